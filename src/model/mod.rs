// Package model provides the orchestrator's shared data types.

pub mod event;
pub mod health;
pub mod instance;

// Re-export main types
pub use event::{ExitEvent, LifecycleEvent};
pub use health::{HealthSample, ProbeResult};
pub use instance::{Instance, InstanceId, InstanceStatus, InstanceSummary};
