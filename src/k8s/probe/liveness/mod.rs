// Package liveness provides Kubernetes liveness probe functionality.

use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::warn;

pub mod error;
pub mod service;

pub use error::TimeoutIsTooShortError;
pub use service::Service;

const MIN_TIMEOUT: Duration = Duration::from_millis(1);

/// Liveness probe: alive while every watched service says so.
pub struct Probe {
    services: RwLock<Vec<Arc<dyn Service>>>,
    timeout: Duration,
}

impl Probe {
    /// Creates a new liveness probe
    pub fn new(timeout_duration: Duration) -> Self {
        let timeout = if timeout_duration < MIN_TIMEOUT {
            warn!(
                error = %TimeoutIsTooShortError,
                "min timeout duration is 1ms (timeout set up as 10ms as a more reasonable value)"
            );
            Duration::from_millis(10)
        } else {
            timeout_duration
        };

        Self {
            services: RwLock::new(Vec::new()),
            timeout,
        }
    }

    /// Registers services to check. Nothing watched means alive.
    pub fn watch(&self, services: Vec<Arc<dyn Service>>) {
        self.services.write().extend(services);
    }

    /// Checks every watched service off the async workers.
    pub async fn is_alive_async(&self) -> bool {
        let services = self.services.read().clone();
        let probe_timeout = self.timeout;

        let check = tokio::task::spawn_blocking(move || {
            services.iter().all(|s| s.is_alive(probe_timeout))
        });

        match timeout(probe_timeout, check).await {
            Ok(Ok(alive)) => alive,
            Ok(Err(e)) => {
                warn!(component = "liveness", event = "check_panicked", error = %e);
                false
            }
            Err(_) => {
                warn!(
                    component = "liveness",
                    event = "timeout",
                    timeout = ?probe_timeout,
                    "liveness check timed out"
                );
                false
            }
        }
    }
}
