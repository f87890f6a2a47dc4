//! Port pool: unique, available network ports for spawned instances.

pub mod allocator;

#[cfg(test)]
mod allocator_test;

pub use allocator::{PortAllocator, PortError, PortLease};
