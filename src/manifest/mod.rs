//! Declarative service manifest: what the orchestrator is able to run.

pub mod entry;
pub mod error;
pub mod graph;


pub use entry::{Manifest, ResourceHints, ServiceManifestEntry};
pub use error::ManifestError;
