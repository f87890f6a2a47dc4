// HTTP API controllers for orchestrator endpoints.

pub mod chain;
pub mod controller;
pub mod deploy;
pub mod instance;
pub mod metrics;
pub mod probe;
pub mod status;

#[cfg(test)]
mod controller_test;

// Re-export controller types for convenience
pub use chain::ChainController;
pub use deploy::DeployController;
pub use instance::InstanceController;
pub use metrics::PrometheusMetricsController;
pub use probe::LivenessProbeController;
pub use status::StatusController;
