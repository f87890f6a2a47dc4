//! Prometheus metrics functionality.
//
//! Metrics organization:
//! - Orchestrator metrics: metrics::meter (instances, restarts, probes, chain appends)
//! - Process metrics: metrics-process (process_resident_memory_bytes, process_cpu_*, etc.)

pub mod meter;

pub use meter::*;
