// Manifest entries and loading.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::ManifestError;

/// Soft resource limits. Passed to the service as hints, never enforced.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceHints {
    pub cpu: Option<f64>,
    pub memory: Option<String>,
}

/// Static description of one service. Immutable after load.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceManifestEntry {
    pub name: String,
    #[serde(alias = "path")]
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default = "default_replicas", alias = "replicaCount")]
    pub replicas: u32,
    pub tier: Option<String>,
    #[serde(default)]
    pub dependencies: BTreeSet<String>,
    #[serde(default, alias = "resourceHints")]
    pub resources: ResourceHints,
    #[serde(alias = "healthCheckPath")]
    pub health_check: Option<String>,
}

fn default_replicas() -> u32 {
    1
}

impl ServiceManifestEntry {
    /// Minimal entry, mostly useful for tests and tooling.
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            args: Vec::new(),
            cwd: None,
            env: BTreeMap::new(),
            replicas: 1,
            tier: None,
            dependencies: BTreeSet::new(),
            resources: ResourceHints::default(),
            health_check: None,
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_replicas(mut self, replicas: u32) -> Self {
        self.replicas = replicas;
        self
    }

    pub fn with_dependencies<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies = deps.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_health_check(mut self, probe: impl Into<String>) -> Self {
        self.health_check = Some(probe.into());
        self
    }

    /// Arguments with the `{port}` placeholder substituted.
    pub fn args_for_port(&self, port: u16) -> Vec<String> {
        let port = port.to_string();
        self.args.iter().map(|a| a.replace("{port}", &port)).collect()
    }
}

#[derive(Debug, Deserialize)]
struct ManifestFile {
    services: Vec<ServiceManifestEntry>,
}

/// Validated set of manifest entries, shared read-only.
#[derive(Debug, Clone, Default)]
pub struct Manifest {
    entries: Vec<Arc<ServiceManifestEntry>>,
    index: HashMap<String, usize>,
}

impl Manifest {
    /// Builds a manifest from entries, validating names, replicas and dependencies.
    ///
    /// Dependency cycles are not rejected here; they surface when a deployment
    /// order is requested.
    pub fn new(entries: Vec<ServiceManifestEntry>) -> Result<Self, ManifestError> {
        let mut index = HashMap::with_capacity(entries.len());
        for (i, entry) in entries.iter().enumerate() {
            if entry.name.trim().is_empty() {
                return Err(ManifestError::EmptyName);
            }
            if entry.command.trim().is_empty() {
                return Err(ManifestError::EmptyCommand {
                    service: entry.name.clone(),
                });
            }
            if entry.replicas == 0 {
                return Err(ManifestError::InvalidReplicas {
                    service: entry.name.clone(),
                });
            }
            if index.insert(entry.name.clone(), i).is_some() {
                return Err(ManifestError::DuplicateService(entry.name.clone()));
            }
        }

        for entry in &entries {
            for dep in &entry.dependencies {
                if !index.contains_key(dep) {
                    return Err(ManifestError::UnknownDependency {
                        service: entry.name.clone(),
                        dependency: dep.clone(),
                    });
                }
            }
        }

        Ok(Self {
            entries: entries.into_iter().map(Arc::new).collect(),
            index,
        })
    }

    /// Loads a manifest from a YAML or JSON file (chosen by extension).
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ManifestError> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path).map_err(|source| ManifestError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let is_json = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.eq_ignore_ascii_case("json"))
            .unwrap_or(false);

        let file: ManifestFile = if is_json {
            serde_json::from_str(&data).map_err(|e| ManifestError::Parse {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?
        } else {
            serde_yaml::from_str(&data).map_err(|e| ManifestError::Parse {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?
        };

        Self::new(file.services)
    }

    pub fn get(&self, name: &str) -> Option<Arc<ServiceManifestEntry>> {
        self.index.get(name).map(|&i| self.entries[i].clone())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    pub fn entries(&self) -> &[Arc<ServiceManifestEntry>] {
        &self.entries
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|e| e.name.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
