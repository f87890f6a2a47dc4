use crate::model::InstanceStatus;

// Metric name constants
pub const INSTANCES: &str = "meshd_instances";
pub const SPAWNS: &str = "meshd_spawns_total";
pub const SPAWN_FAILURES: &str = "meshd_spawn_failures_total";
pub const EXITS: &str = "meshd_exits_total";
pub const CRASHES: &str = "meshd_crashes_total";
pub const RESTARTS: &str = "meshd_restarts_total";
pub const FAILED_SERVICES: &str = "meshd_failed_total";

pub const PROBES: &str = "meshd_probes_total";
pub const PROBE_LATENCY_MS: &str = "meshd_probe_latency_ms";

pub const PORTS_LEASED: &str = "meshd_ports_leased";

pub const CHAIN_HEIGHT: &str = "meshd_chain_height";
pub const CHAIN_APPENDS: &str = "meshd_chain_appends_total";
pub const CHAIN_CONFLICTS: &str = "meshd_chain_conflicts_total";
pub const CHAIN_RESURRECTIONS: &str = "meshd_chain_resurrections_total";
pub const CHAIN_DEACTIVATIONS: &str = "meshd_chain_deactivations_total";

/// Sets the number of instances of a service in the given status.
pub fn set_instances(service: &str, status: InstanceStatus, count: usize) {
    metrics::gauge!(INSTANCES, "service" => service.to_string(), "status" => status.as_str())
        .set(count as f64);
}

/// Adds a successful spawn.
pub fn add_spawn(service: &str) {
    metrics::counter!(SPAWNS, "service" => service.to_string()).increment(1);
}

/// Adds a failed spawn.
pub fn add_spawn_failure(service: &str) {
    metrics::counter!(SPAWN_FAILURES, "service" => service.to_string()).increment(1);
}

/// Adds a process exit; unrequested exits also count as crashes.
pub fn add_exit(service: &str, crashed: bool) {
    metrics::counter!(EXITS, "service" => service.to_string()).increment(1);
    if crashed {
        metrics::counter!(CRASHES, "service" => service.to_string()).increment(1);
    }
}

/// Adds a restart performed by a health monitor.
pub fn add_restart(service: &str) {
    metrics::counter!(RESTARTS, "service" => service.to_string()).increment(1);
}

/// Adds an instance that exhausted its restart budget.
pub fn add_failed(service: &str) {
    metrics::counter!(FAILED_SERVICES, "service" => service.to_string()).increment(1);
}

/// Records one probe result and its latency.
pub fn add_probe(service: &str, result: &'static str, latency_ms: u64) {
    metrics::counter!(PROBES, "service" => service.to_string(), "result" => result).increment(1);
    metrics::histogram!(PROBE_LATENCY_MS, "service" => service.to_string()).record(latency_ms as f64);
}

/// Sets the number of leased ports.
pub fn set_ports_leased(count: usize) {
    metrics::gauge!(PORTS_LEASED).set(count as f64);
}

/// Sets the observed chain height.
pub fn set_chain_height(height: u64) {
    metrics::gauge!(CHAIN_HEIGHT).set(height as f64);
}

/// Adds a block appended by this node.
pub fn add_chain_append() {
    metrics::counter!(CHAIN_APPENDS).increment(1);
}

/// Adds a lost append race.
pub fn add_chain_conflict() {
    metrics::counter!(CHAIN_CONFLICTS).increment(1);
}

/// Adds reconciliation actions.
pub fn add_chain_reconcile(resurrected: u64, deactivated: u64) {
    metrics::counter!(CHAIN_RESURRECTIONS).increment(resurrected);
    metrics::counter!(CHAIN_DEACTIVATIONS).increment(deactivated);
}

/// Registers help text for every orchestrator metric.
pub fn describe() {
    metrics::describe_gauge!(INSTANCES, "Instances per service and status");
    metrics::describe_counter!(SPAWNS, "Successful instance spawns");
    metrics::describe_counter!(SPAWN_FAILURES, "Failed instance spawns");
    metrics::describe_counter!(EXITS, "Instance process exits");
    metrics::describe_counter!(CRASHES, "Instance exits nobody asked for");
    metrics::describe_counter!(RESTARTS, "Instance replacements by the health monitor");
    metrics::describe_counter!(FAILED_SERVICES, "Replica slots that exhausted their restart budget");
    metrics::describe_counter!(PROBES, "Health probes by result");
    metrics::describe_histogram!(PROBE_LATENCY_MS, "Health probe latency in milliseconds");
    metrics::describe_gauge!(PORTS_LEASED, "Ports currently leased from the pool");
    metrics::describe_gauge!(CHAIN_HEIGHT, "Last chain height this node has seen");
    metrics::describe_counter!(CHAIN_APPENDS, "Blocks appended by this node");
    metrics::describe_counter!(CHAIN_CONFLICTS, "Chain appends that lost a race");
    metrics::describe_counter!(CHAIN_RESURRECTIONS, "Services resurrected from chain intents");
    metrics::describe_counter!(CHAIN_DEACTIVATIONS, "Services deactivated from chain intents");
}
