// Service trait for liveness checking

use std::time::Duration;

/// Something the node cannot live without.
pub trait Service: Send + Sync {
    /// Answers within `timeout`; a slow answer counts as dead.
    fn is_alive(&self, timeout: Duration) -> bool;
}
