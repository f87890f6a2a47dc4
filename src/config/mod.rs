// Configuration loading and management.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const PROD: &str = "prod";
#[allow(dead_code)]
pub const DEV: &str = "dev";
#[allow(dead_code)]
pub const TEST: &str = "test";

pub const DEFAULT_PORT_ENV: &str = "PORT";

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Orchestrator {
    #[serde(rename = "orchestrator")]
    pub orchestrator: OrchestratorBox,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OrchestratorBox {
    pub env: String,
    pub logs: Option<Logs>,
    pub runtime: Option<Runtime>,
    pub api: Option<Api>,
    pub manifest: Option<ManifestSource>,
    pub ports: Option<Ports>,
    pub supervisor: Option<Supervisor>,
    pub health: Option<Health>,
    pub restart: Option<Restart>,
    pub chain: Option<Chain>,
    pub registry: Option<Registry>,
    pub deploy: Option<Deploy>,
    pub metrics: Option<Metrics>,
    pub k8s: Option<K8S>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Logs {
    pub level: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Runtime {
    pub num_cpus: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Api {
    pub name: Option<String>,
    pub port: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ManifestSource {
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Ports {
    pub from: u16,
    pub to: u16,
    #[serde(rename = "check_bindable", default = "default_check_bindable")]
    pub check_bindable: bool,
}

fn default_check_bindable() -> bool {
    true
}

impl Default for Ports {
    fn default() -> Self {
        Self {
            from: 8000,
            to: 9000,
            check_bindable: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Supervisor {
    #[serde(rename = "grace_period", with = "humantime_serde", default)]
    pub grace_period: Option<Duration>,
    #[serde(rename = "spawn_check", with = "humantime_serde", default)]
    pub spawn_check: Option<Duration>,
    #[serde(rename = "port_env")]
    pub port_env: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Health {
    #[serde(with = "humantime_serde", default)]
    pub interval: Option<Duration>,
    #[serde(rename = "probe_timeout", with = "humantime_serde", default)]
    pub probe_timeout: Option<Duration>,
    #[serde(rename = "failure_threshold")]
    pub failure_threshold: Option<u32>,
    #[serde(rename = "startup_grace", with = "humantime_serde", default)]
    pub startup_grace: Option<Duration>,
    #[serde(rename = "startup_timeout", with = "humantime_serde", default)]
    pub startup_timeout: Option<Duration>,
    #[serde(rename = "samples_window")]
    pub samples_window: Option<usize>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Backoff {
    #[serde(with = "humantime_serde", default)]
    pub initial: Option<Duration>,
    #[serde(with = "humantime_serde", default)]
    pub max: Option<Duration>,
    pub multiplier: Option<f64>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Restart {
    #[serde(rename = "max_restarts")]
    pub max_restarts: Option<u32>,
    #[serde(with = "humantime_serde", default)]
    pub window: Option<Duration>,
    pub backoff: Option<Backoff>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Chain {
    pub enabled: bool,
    pub path: Option<PathBuf>,
    #[serde(rename = "node_id")]
    pub node_id: Option<String>,
    #[serde(with = "humantime_serde", default)]
    pub tick: Option<Duration>,
    #[serde(rename = "max_append_retries")]
    pub max_append_retries: Option<usize>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Registry {
    #[serde(rename = "snapshot_path")]
    pub snapshot_path: Option<PathBuf>,
    #[serde(rename = "snapshot_interval", with = "humantime_serde", default)]
    pub snapshot_interval: Option<Duration>,
    #[serde(rename = "reap_orphans", default)]
    pub reap_orphans: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Deploy {
    #[serde(rename = "dependency_timeout", with = "humantime_serde", default)]
    pub dependency_timeout: Option<Duration>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Metrics {
    pub enabled: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Probe {
    #[serde(with = "humantime_serde", default)]
    pub timeout: Option<Duration>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct K8S {
    pub probe: Probe,
}

/// Resolved supervisor settings.
#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    pub grace_period: Duration,
    pub spawn_check: Duration,
    pub port_env: String,
}

/// Resolved health monitor settings.
#[derive(Debug, Clone)]
pub struct HealthSettings {
    pub interval: Duration,
    pub probe_timeout: Duration,
    pub failure_threshold: u32,
    pub startup_grace: Duration,
    pub startup_timeout: Duration,
    pub samples_window: usize,
}

/// Resolved restart policy settings.
#[derive(Debug, Clone)]
pub struct RestartSettings {
    pub max_restarts: u32,
    pub window: Duration,
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
    pub backoff_multiplier: f64,
}

/// Resolved chain synchronizer settings.
#[derive(Debug, Clone)]
pub struct ChainSettings {
    pub enabled: bool,
    pub path: PathBuf,
    pub node_id: String,
    pub tick: Duration,
    pub max_append_retries: usize,
}

// Config trait
pub trait ConfigTrait {
    fn logs(&self) -> Option<&Logs>;
    fn is_prod(&self) -> bool;
    #[allow(dead_code)]
    fn is_test(&self) -> bool;
    fn runtime(&self) -> &Runtime;
    fn api(&self) -> Option<&Api>;
    fn manifest_path(&self) -> Option<&Path>;
    fn ports(&self) -> Ports;
    fn supervisor(&self) -> SupervisorSettings;
    fn health(&self) -> HealthSettings;
    fn restart(&self) -> RestartSettings;
    fn chain(&self) -> ChainSettings;
    fn registry(&self) -> Option<&Registry>;
    fn dependency_timeout(&self) -> Duration;
    fn metrics_enabled(&self) -> bool;
    fn k8s(&self) -> Option<&K8S>;
}

// Config type alias for convenience
pub type Config = Orchestrator;

impl ConfigTrait for Config {
    fn logs(&self) -> Option<&Logs> {
        self.orchestrator.logs.as_ref()
    }

    fn is_prod(&self) -> bool {
        self.orchestrator.env == PROD
    }

    fn is_test(&self) -> bool {
        self.orchestrator.env == TEST
    }

    fn runtime(&self) -> &Runtime {
        self.orchestrator
            .runtime
            .as_ref()
            .unwrap_or(&Runtime { num_cpus: 0 })
    }

    fn api(&self) -> Option<&Api> {
        self.orchestrator.api.as_ref()
    }

    fn manifest_path(&self) -> Option<&Path> {
        self.orchestrator
            .manifest
            .as_ref()
            .and_then(|m| m.path.as_deref())
    }

    fn ports(&self) -> Ports {
        self.orchestrator.ports.clone().unwrap_or_default()
    }

    fn supervisor(&self) -> SupervisorSettings {
        let s = self.orchestrator.supervisor.as_ref();
        SupervisorSettings {
            grace_period: s
                .and_then(|s| s.grace_period)
                .unwrap_or(Duration::from_secs(10)),
            spawn_check: s
                .and_then(|s| s.spawn_check)
                .unwrap_or(Duration::from_secs(2)),
            port_env: s
                .and_then(|s| s.port_env.clone())
                .unwrap_or_else(|| DEFAULT_PORT_ENV.to_string()),
        }
    }

    fn health(&self) -> HealthSettings {
        let h = self.orchestrator.health.as_ref();
        HealthSettings {
            interval: h.and_then(|h| h.interval).unwrap_or(Duration::from_secs(5)),
            probe_timeout: h
                .and_then(|h| h.probe_timeout)
                .unwrap_or(Duration::from_secs(2)),
            failure_threshold: h.and_then(|h| h.failure_threshold).unwrap_or(3).max(1),
            startup_grace: h
                .and_then(|h| h.startup_grace)
                .unwrap_or(Duration::from_secs(3)),
            startup_timeout: h
                .and_then(|h| h.startup_timeout)
                .unwrap_or(Duration::from_secs(60)),
            samples_window: h.and_then(|h| h.samples_window).unwrap_or(20).max(1),
        }
    }

    fn restart(&self) -> RestartSettings {
        let r = self.orchestrator.restart.as_ref();
        let b = r.and_then(|r| r.backoff.as_ref());
        RestartSettings {
            max_restarts: r.and_then(|r| r.max_restarts).unwrap_or(5),
            window: r
                .and_then(|r| r.window)
                .unwrap_or(Duration::from_secs(10 * 60)),
            backoff_initial: b
                .and_then(|b| b.initial)
                .unwrap_or(Duration::from_millis(500)),
            backoff_max: b.and_then(|b| b.max).unwrap_or(Duration::from_secs(30)),
            backoff_multiplier: b.and_then(|b| b.multiplier).unwrap_or(2.0),
        }
    }

    fn chain(&self) -> ChainSettings {
        let c = self.orchestrator.chain.as_ref();
        ChainSettings {
            enabled: c.map(|c| c.enabled).unwrap_or(false),
            path: c
                .and_then(|c| c.path.clone())
                .unwrap_or_else(|| PathBuf::from("data/chain.jsonl")),
            node_id: c
                .and_then(|c| c.node_id.clone())
                .unwrap_or_else(generate_node_id),
            tick: c.and_then(|c| c.tick).unwrap_or(Duration::from_secs(5)),
            max_append_retries: c.and_then(|c| c.max_append_retries).unwrap_or(3),
        }
    }

    fn registry(&self) -> Option<&Registry> {
        self.orchestrator.registry.as_ref()
    }

    fn dependency_timeout(&self) -> Duration {
        self.orchestrator
            .deploy
            .as_ref()
            .and_then(|d| d.dependency_timeout)
            .unwrap_or(Duration::from_secs(60))
    }

    fn metrics_enabled(&self) -> bool {
        self.orchestrator
            .metrics
            .as_ref()
            .map(|m| m.enabled)
            .unwrap_or(true)
    }

    fn k8s(&self) -> Option<&K8S> {
        self.orchestrator.k8s.as_ref()
    }
}

fn generate_node_id() -> String {
    format!("node-{}", hex::encode(rand::random::<[u8; 4]>()))
}

impl Config {
    /// Loads configuration from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        // Resolve absolute path
        let abs_path = path
            .canonicalize()
            .with_context(|| format!("failed to resolve absolute config filepath: {:?}", path))?;

        let data = std::fs::read_to_string(&abs_path)
            .with_context(|| format!("read config yaml file {:?}", abs_path))?;

        let mut cfg: Orchestrator = serde_yaml::from_str(&data)
            .with_context(|| format!("unmarshal yaml from {:?}", abs_path))?;

        if let Some(ref ports) = cfg.orchestrator.ports {
            if ports.from == 0 || ports.from > ports.to {
                anyhow::bail!(
                    "invalid ports range configured: {}..={}",
                    ports.from,
                    ports.to
                );
            }
        }

        // Pin the node id once so every accessor call sees the same identity.
        let chain = cfg.orchestrator.chain.get_or_insert_with(|| Chain {
            enabled: false,
            path: None,
            node_id: None,
            tick: None,
            max_append_retries: None,
        });
        if chain.node_id.is_none() {
            chain.node_id = Some(generate_node_id());
        }

        Ok(cfg)
    }
}

// Test config is always available for integration tests
mod test_config;
#[allow(dead_code)]
pub use test_config::new_test_config;

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_load_resolves_defaults_and_durations() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
orchestrator:
  env: prod
  ports:
    from: 9100
    to: 9110
  health:
    interval: 250ms
    failure_threshold: 4
  restart:
    max_restarts: 2
    window: 1m
  chain:
    enabled: true
    path: /tmp/chain.jsonl
"#
        )
        .unwrap();

        let cfg = Config::load(file.path()).unwrap();
        assert!(cfg.is_prod());
        assert_eq!(cfg.ports().from, 9100);
        assert_eq!(cfg.health().interval, Duration::from_millis(250));
        assert_eq!(cfg.health().failure_threshold, 4);
        assert_eq!(cfg.health().probe_timeout, Duration::from_secs(2));
        assert_eq!(cfg.restart().max_restarts, 2);
        assert_eq!(cfg.restart().window, Duration::from_secs(60));
        assert_eq!(cfg.supervisor().port_env, DEFAULT_PORT_ENV);

        let chain = cfg.chain();
        assert!(chain.enabled);
        assert_eq!(chain.node_id, cfg.chain().node_id);
    }

    #[test]
    fn test_load_rejects_inverted_port_range() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            "orchestrator:\n  env: dev\n  ports:\n    from: 9000\n    to: 8000\n"
        )
        .unwrap();

        assert!(Config::load(file.path()).is_err());
    }
}
