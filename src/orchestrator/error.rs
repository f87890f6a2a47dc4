// Facade errors, with service or instance context attached.

use crate::manifest::ManifestError;
use crate::model::InstanceId;
use crate::ports::PortError;
use crate::supervisor::SupervisorError;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum OrchestratorError {
    #[error("unknown service {0:?}")]
    UnknownService(String),
    #[error("unknown instance {0}")]
    UnknownInstance(InstanceId),
    #[error("spawn of service {service:?} failed: {reason}")]
    SpawnFailed { service: String, reason: String },
    #[error("port pool {from}..={to} exhausted while deploying {service:?}")]
    PortPoolExhausted { service: String, from: u16, to: u16 },
    #[error("cyclic dependency between services {services:?}")]
    CyclicDependency { services: Vec<String> },
    #[error("service {service:?} already runs its desired {desired} replica(s)")]
    AlreadyAtDesired { service: String, desired: u32 },
    #[error("dependency {dependency:?} of service {service:?} did not become ready")]
    DependencyNotReady { service: String, dependency: String },
    #[error("service {service:?} exhausted its restart budget")]
    RestartBudgetExceeded { service: String },
    #[error("invalid manifest: {0}")]
    Manifest(String),
    #[error("orchestrator is shutting down")]
    ShuttingDown,
}

impl OrchestratorError {
    pub(crate) fn from_port(service: &str, err: PortError) -> Self {
        match err {
            PortError::PoolExhausted { from, to } => Self::PortPoolExhausted {
                service: service.to_string(),
                from,
                to,
            },
            PortError::NotLeased(port) => Self::SpawnFailed {
                service: service.to_string(),
                reason: format!("port {port} lost its lease"),
            },
        }
    }

    pub(crate) fn from_supervisor(err: SupervisorError) -> Self {
        match err {
            SupervisorError::SpawnFailed { service, reason } => Self::SpawnFailed { service, reason },
            SupervisorError::UnknownInstance(id) => Self::UnknownInstance(id),
        }
    }
}

impl From<ManifestError> for OrchestratorError {
    fn from(err: ManifestError) -> Self {
        match err {
            ManifestError::CyclicDependency { services } => Self::CyclicDependency { services },
            other => Self::Manifest(other.to_string()),
        }
    }
}
