// Scriptable health probers.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::time::Duration;

use crate::health::{ProbeError, ProbeTarget, Prober};

/// Answers OK for every port except the ones told to hang or refuse.
#[derive(Default)]
pub struct ScriptedProber {
    hanging: Mutex<HashSet<u16>>,
    refusing: Mutex<HashSet<u16>>,
}

impl ScriptedProber {
    /// Probes of `port` never answer; the monitor sees timeouts.
    pub fn hang(&self, port: u16) {
        self.hanging.lock().insert(port);
    }

    /// Probes of `port` fail right away.
    pub fn refuse(&self, port: u16) {
        self.refusing.lock().insert(port);
    }
}

#[async_trait]
impl Prober for ScriptedProber {
    async fn probe(&self, _target: &ProbeTarget, port: u16) -> Result<(), ProbeError> {
        let hangs = self.hanging.lock().contains(&port);
        if hangs {
            tokio::time::sleep(Duration::from_secs(60)).await;
        }
        if self.refusing.lock().contains(&port) {
            return Err(ProbeError::Unreachable(format!("127.0.0.1:{port}: refused")));
        }
        Ok(())
    }
}
