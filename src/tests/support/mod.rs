// Shared fixtures for scenario tests.

pub mod prober;

use std::sync::Arc;
use std::time::Duration;

use crate::config::{new_test_config, Config};
use crate::manifest::{Manifest, ServiceManifestEntry};
use crate::model::InstanceStatus;
use crate::orchestrator::Orchestrator;

pub use prober::ScriptedProber;

/// A long-running process that never binds anything.
pub fn sleeper(name: &str) -> ServiceManifestEntry {
    ServiceManifestEntry::new(name, "sleep").with_args(["30"])
}

/// A process that runs past the spawn check and then exits with `code`.
pub fn crasher(name: &str, after: Duration, code: i32) -> ServiceManifestEntry {
    ServiceManifestEntry::new(name, "sh").with_args([
        "-c".to_string(),
        format!("sleep {:.2}; exit {code}", after.as_secs_f64()),
    ])
}

/// One orchestrator node built from the test config.
pub struct Node {
    pub orchestrator: Arc<Orchestrator>,
    pub prober: Arc<ScriptedProber>,
}

impl Node {
    pub fn new(entries: Vec<ServiceManifestEntry>) -> Self {
        Self::with_config(new_test_config(), entries)
    }

    pub fn with_config(cfg: Config, entries: Vec<ServiceManifestEntry>) -> Self {
        let manifest = Manifest::new(entries).expect("valid test manifest");
        let prober = Arc::new(ScriptedProber::default());
        let orchestrator = Arc::new(Orchestrator::new(&cfg, manifest, prober.clone()));
        Self {
            orchestrator,
            prober,
        }
    }

    /// Waits until `n` instances of `service` report `status`.
    pub async fn wait_count(&self, service: &str, status: InstanceStatus, n: usize, within: Duration) -> bool {
        self.orchestrator
            .registry()
            .wait_for(within, |r| r.count(service, |s| s == status) == n)
            .await
    }
}
