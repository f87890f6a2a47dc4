#[path = "k8s/probe/liveness/mod.rs"]
pub mod liveness;
#[cfg(test)]
mod tests;

pub mod app;
pub mod chain;
pub mod config;
pub mod controller;
pub mod health;
pub mod http;
pub mod manifest;
pub mod metrics;
pub mod middleware;
pub mod model;
pub mod orchestrator;
pub mod ports;
pub mod registry;
pub mod shutdown;
pub mod supervisor;
