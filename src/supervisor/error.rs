// Supervisor errors.

use crate::model::InstanceId;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SupervisorError {
    #[error("spawn of service {service:?} failed: {reason}")]
    SpawnFailed { service: String, reason: String },
    #[error("instance {0} is not supervised")]
    UnknownInstance(InstanceId),
}

impl SupervisorError {
    pub fn spawn_failed(service: &str, reason: impl Into<String>) -> Self {
        Self::SpawnFailed {
            service: service.to_string(),
            reason: reason.into(),
        }
    }
}
