//! Service registry: the table of instances known to this node.

pub mod dumper;
pub mod registry;


pub use dumper::{RegistryDumper, Snapshot};
pub use registry::Registry;
