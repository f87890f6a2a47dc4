// Process lifecycle events emitted by the supervisor.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::InstanceId;

/// Emitted once when a supervised process exits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExitEvent {
    pub instance_id: InstanceId,
    pub service: String,
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
    pub timestamp: DateTime<Utc>,
    /// True when the exit followed a terminate request.
    pub requested: bool,
}

impl ExitEvent {
    /// An exit nobody asked for.
    pub fn is_crash(&self) -> bool {
        !self.requested
    }

    pub fn describe(&self) -> String {
        match (self.exit_code, self.signal) {
            (Some(code), _) => format!("exit code {code}"),
            (None, Some(sig)) => format!("signal {sig}"),
            (None, None) => "unknown exit status".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LifecycleEvent {
    Spawned {
        instance_id: InstanceId,
        service: String,
        port: u16,
        pid: u32,
        timestamp: DateTime<Utc>,
    },
    Exited(ExitEvent),
}

impl LifecycleEvent {
    pub fn instance_id(&self) -> &InstanceId {
        match self {
            LifecycleEvent::Spawned { instance_id, .. } => instance_id,
            LifecycleEvent::Exited(ev) => &ev.instance_id,
        }
    }
}
