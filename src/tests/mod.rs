//! Scenario tests for a whole orchestrator node.
//!
//! Each case drives real `sh`/`sleep` child processes through the public
//! facade, the chain record or the HTTP API.

mod cases_chain_test;
mod cases_self_healing_test;

pub mod support;
