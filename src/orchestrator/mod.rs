//! Orchestrator facade: deploy, terminate, scale and status over the
//! supervisor, registry, port allocator and health monitor.

pub mod error;
pub mod orchestrator;

#[cfg(test)]
mod orchestrator_test;

pub use error::OrchestratorError;
pub use orchestrator::{Orchestrator, ScaleReport};
