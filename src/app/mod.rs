// Orchestrator node application and its API server.

pub mod app;
pub mod server;

pub use app::App;
