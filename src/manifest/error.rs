// Manifest-level errors.

use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    #[error("failed to read manifest {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse manifest {path:?}: {reason}")]
    Parse { path: PathBuf, reason: String },
    #[error("manifest declares service {0:?} more than once")]
    DuplicateService(String),
    #[error("manifest entry has an empty service name")]
    EmptyName,
    #[error("service {service:?} has no command")]
    EmptyCommand { service: String },
    #[error("service {service:?} must run at least one replica")]
    InvalidReplicas { service: String },
    #[error("service {service:?} depends on unknown service {dependency:?}")]
    UnknownDependency { service: String, dependency: String },
    #[error("cyclic dependency between services: {}", .services.join(", "))]
    CyclicDependency { services: Vec<String> },
}
