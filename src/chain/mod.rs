//! Chain-state record shared by every orchestrator node, and the
//! synchronizer that reconciles this node against it.

pub mod block;
pub mod file;
pub mod log;
pub mod memory;
pub mod synchronizer;

#[cfg(test)]
mod synchronizer_test;

pub use block::{Block, Desired, Intent, IntentView};
pub use file::FileChainLog;
pub use log::{ChainError, ChainLog};
pub use memory::MemoryChainLog;
pub use synchronizer::{ChainSynchronizer, LocalService, Reconciler, TickReport};
