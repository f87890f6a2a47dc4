use super::{
    Api, Backoff, Chain, Deploy, Health, Logs, Metrics, Orchestrator, OrchestratorBox, Ports,
    Registry, Restart, Runtime, Supervisor,
};
use std::path::PathBuf;
use std::time::Duration;

/// Creates a new test configuration.
///
/// Timings are scaled down so scenario tests finish in well under a second
/// per lifecycle step.
pub fn new_test_config() -> Orchestrator {
    Orchestrator {
        orchestrator: OrchestratorBox {
            env: super::TEST.to_string(),
            logs: Some(Logs {
                level: Some("debug".to_string()),
            }),
            runtime: Some(Runtime { num_cpus: 2 }),
            api: Some(Api {
                name: Some("meshd:8700".to_string()),
                port: Some("8700".to_string()),
            }),
            manifest: None,
            ports: Some(Ports {
                from: 42000,
                to: 42063,
                check_bindable: false,
            }),
            supervisor: Some(Supervisor {
                grace_period: Some(Duration::from_millis(500)),
                spawn_check: Some(Duration::from_millis(100)),
                port_env: Some("PORT".to_string()),
            }),
            health: Some(Health {
                interval: Some(Duration::from_millis(50)),
                probe_timeout: Some(Duration::from_millis(100)),
                failure_threshold: Some(3),
                startup_grace: Some(Duration::from_millis(100)),
                startup_timeout: Some(Duration::from_secs(5)),
                samples_window: Some(10),
            }),
            restart: Some(Restart {
                max_restarts: Some(5),
                window: Some(Duration::from_secs(600)),
                backoff: Some(Backoff {
                    initial: Some(Duration::from_millis(10)),
                    max: Some(Duration::from_millis(50)),
                    multiplier: Some(2.0),
                }),
            }),
            chain: Some(Chain {
                enabled: false,
                path: Some(PathBuf::from("target/test-chain.jsonl")),
                node_id: Some("test-node".to_string()),
                tick: Some(Duration::from_millis(100)),
                max_append_retries: Some(3),
            }),
            registry: Some(Registry {
                snapshot_path: None,
                snapshot_interval: Some(Duration::from_secs(1)),
                reap_orphans: false,
            }),
            deploy: Some(Deploy {
                dependency_timeout: Some(Duration::from_secs(5)),
            }),
            metrics: Some(Metrics { enabled: false }),
            k8s: None,
        },
    }
}
