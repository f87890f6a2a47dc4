// API server.

pub mod server;

pub use server::{HttpServer, Server};
