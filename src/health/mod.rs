//! Health monitoring and self-healing.

pub mod monitor;
pub mod prober;
pub mod restart;
mod retired;


pub use monitor::{FailureReport, HealthMonitor, LifelineId};
pub use prober::{NetProber, ProbeError, ProbeTarget, Prober};
pub use restart::{Backoff, RestartBudget};
