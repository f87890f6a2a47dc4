//! Process supervision: one OS process per instance, owned by its own task.

pub mod error;
pub mod process;
pub mod supervisor;


pub use error::SupervisorError;
pub use supervisor::Supervisor;
