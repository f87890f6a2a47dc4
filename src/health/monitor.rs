// Health monitor: one lifeline task per replica slot.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::prober::{ProbeError, ProbeTarget, Prober};
use super::restart::{Backoff, RestartBudget};
use super::retired::Retired;
use crate::config::{HealthSettings, RestartSettings};
use crate::manifest::ServiceManifestEntry;
use crate::metrics;
use crate::model::{ExitEvent, HealthSample, Instance, InstanceId, InstanceStatus, ProbeResult};
use crate::ports::{PortAllocator, PortError};
use crate::registry::Registry;
use crate::supervisor::Supervisor;

pub type LifelineId = u64;

/// Lower bound on the probe interval.
pub const MIN_INTERVAL: Duration = Duration::from_millis(10);

/// Terminal failure of a lifeline: its restart budget is spent.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureReport {
    pub service: String,
    #[serde(rename = "instanceID")]
    pub instance_id: InstanceId,
    pub restart_count: u32,
    pub reason: String,
    pub failed_at: DateTime<Utc>,
}

struct LifelineHandle {
    service: String,
    current: watch::Receiver<InstanceId>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Why observation of an instance ended.
enum Outcome {
    Cancelled,
    /// Stopped by someone else; nothing to heal.
    Stopped,
    Crashed(ExitEvent),
    Unhealthy(String),
}

/// State shared by every lifeline task.
struct Shared {
    health: HealthSettings,
    restart: RestartSettings,
    supervisor: Arc<Supervisor>,
    registry: Arc<Registry>,
    ports: Arc<PortAllocator>,
    prober: Arc<dyn Prober>,
    samples: DashMap<InstanceId, VecDeque<HealthSample>>,
    failures: Mutex<Vec<FailureReport>>,
    retired: Mutex<Retired>,
}

/// Watches instances and heals them.
///
/// Each watched instance gets a lifeline: a task that owns the restart
/// budget of that replica slot, probes the current instance on its own
/// interval, and replaces it on crash or sustained probe failure. All
/// transitions of a lifeline happen sequentially inside its task.
pub struct HealthMonitor {
    shared: Arc<Shared>,
    lifelines: DashMap<LifelineId, LifelineHandle>,
    seq: AtomicU64,
}

impl HealthMonitor {
    pub fn new(
        health: HealthSettings,
        restart: RestartSettings,
        supervisor: Arc<Supervisor>,
        registry: Arc<Registry>,
        ports: Arc<PortAllocator>,
        prober: Arc<dyn Prober>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                health,
                restart,
                supervisor,
                registry,
                ports,
                prober,
                samples: DashMap::new(),
                failures: Mutex::new(Vec::new()),
                retired: Mutex::new(Retired::default()),
            }),
            lifelines: DashMap::new(),
            seq: AtomicU64::new(1),
        }
    }

    /// Starts a lifeline for a freshly spawned, registered instance.
    pub fn watch(&self, entry: Arc<ServiceManifestEntry>, instance: Instance) -> LifelineId {
        let id = self.seq.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();
        let (current_tx, current) = watch::channel(instance.id.clone());

        debug!(
            component = "health",
            event = "lifeline_started",
            lifeline = id,
            service = %entry.name,
            instance_id = %instance.id
        );

        let service = entry.name.clone();
        let task = tokio::spawn(self.shared.clone().lifeline(
            id,
            entry,
            instance,
            current_tx,
            cancel.clone(),
        ));

        self.lifelines.insert(
            id,
            LifelineHandle {
                service,
                current,
                cancel,
                task,
            },
        );
        id
    }

    /// Stops a lifeline and gracefully retires its current instance.
    ///
    /// Returns the id of the instance the lifeline held, or `None` if the
    /// lifeline is unknown (already stopped).
    pub async fn stop_lifeline(&self, lifeline: LifelineId) -> Option<InstanceId> {
        let (_, handle) = self.lifelines.remove(&lifeline)?;
        handle.cancel.cancel();
        if let Err(e) = handle.task.await {
            error!(component = "health", event = "lifeline_panicked", lifeline, error = %e);
        }

        // A failed lifeline has already returned; drop its record here.
        let current = handle.current.borrow().clone();
        self.shared.registry.remove(&current);
        self.shared.samples.remove(&current);
        Some(current)
    }

    /// Stops every lifeline concurrently.
    pub async fn stop_all(&self) {
        let ids: Vec<LifelineId> = self.lifelines.iter().map(|e| *e.key()).collect();
        futures::future::join_all(ids.into_iter().map(|id| self.stop_lifeline(id))).await;
    }

    /// The lifeline currently holding instance `id`.
    pub fn lifeline_of(&self, id: &InstanceId) -> Option<LifelineId> {
        self.lifelines
            .iter()
            .find(|e| *e.value().current.borrow() == *id)
            .map(|e| *e.key())
    }

    pub fn lifelines_of(&self, service: &str) -> Vec<LifelineId> {
        let mut ids: Vec<LifelineId> = self
            .lifelines
            .iter()
            .filter(|e| e.value().service == service)
            .map(|e| *e.key())
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Instance currently held by a lifeline.
    pub fn current(&self, lifeline: LifelineId) -> Option<InstanceId> {
        self.lifelines
            .get(&lifeline)
            .map(|h| h.current.borrow().clone())
    }

    pub fn len(&self) -> usize {
        self.lifelines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lifelines.is_empty()
    }

    /// Rolling window of probe samples for an instance, oldest first.
    pub fn samples(&self, id: &InstanceId) -> Vec<HealthSample> {
        self.shared
            .samples
            .get(id)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn failures(&self) -> Vec<FailureReport> {
        self.shared.failures.lock().clone()
    }

    /// Forgets failure reports of `service`, after manual intervention.
    pub fn clear_failures(&self, service: &str) {
        self.shared.failures.lock().retain(|f| f.service != service);
    }

    /// Remembers an instance that was stopped on purpose.
    pub fn retire(&self, id: InstanceId) {
        self.shared.retired.lock().insert(id);
    }

    /// Whether `id` was stopped on purpose or replaced by a lifeline.
    pub fn is_retired(&self, id: &InstanceId) -> bool {
        self.shared.retired.lock().contains(id)
    }
}

impl Shared {
    async fn lifeline(
        self: Arc<Self>,
        lifeline: LifelineId,
        entry: Arc<ServiceManifestEntry>,
        mut instance: Instance,
        current_tx: watch::Sender<InstanceId>,
        cancel: CancellationToken,
    ) {
        let target = match entry.health_check.as_deref().map(ProbeTarget::parse) {
            None => None,
            Some(Ok(target)) => Some(target),
            Some(Err(e)) => {
                warn!(
                    component = "health",
                    event = "probe_disabled",
                    service = %entry.name,
                    error = %e,
                    "falling back to process liveness"
                );
                None
            }
        };
        let backoff = Backoff {
            initial: self.restart.backoff_initial,
            max: self.restart.backoff_max,
            multiplier: self.restart.backoff_multiplier,
        };
        let mut budget = RestartBudget::from_settings(&self.restart);

        loop {
            let reason = match self.observe(&mut instance, target.as_ref(), &cancel).await {
                Outcome::Cancelled => {
                    self.retire(&instance).await;
                    return;
                }
                Outcome::Stopped => {
                    self.release(&instance);
                    return;
                }
                Outcome::Crashed(exit) => format!("crashed with {}", exit.describe()),
                Outcome::Unhealthy(reason) => reason,
            };

            match self
                .heal(lifeline, &entry, &instance, reason, &mut budget, backoff, &cancel)
                .await
            {
                Some(next) => {
                    instance = next;
                    current_tx.send_replace(instance.id.clone());
                }
                None => return,
            }
        }
    }

    /// Watches one instance until it crashes, turns unhealthy or the lifeline is cancelled.
    async fn observe(
        &self,
        instance: &mut Instance,
        target: Option<&ProbeTarget>,
        cancel: &CancellationToken,
    ) -> Outcome {
        let id = instance.id.clone();
        let exited = self.supervisor.wait(&id);
        tokio::pin!(exited);

        let mut ticker = tokio::time::interval(self.health.interval.max(MIN_INTERVAL));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let started = Instant::now();
        let mut consecutive = 0u32;

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Outcome::Cancelled,
                exit = &mut exited => {
                    return match exit {
                        Ok(exit) if exit.is_crash() => Outcome::Crashed(exit),
                        _ => Outcome::Stopped,
                    };
                }
                _ = ticker.tick() => {}
            }

            let Some(target) = target else {
                if instance.status == InstanceStatus::Starting
                    && started.elapsed() >= self.health.startup_grace
                {
                    self.transition(instance, InstanceStatus::Running);
                }
                if instance.status == InstanceStatus::Running {
                    self.heartbeat(instance);
                }
                continue;
            };

            match self.probe(instance, target).await {
                Ok(()) => {
                    consecutive = 0;
                    if instance.status != InstanceStatus::Running {
                        self.transition(instance, InstanceStatus::Running);
                    }
                    self.heartbeat(instance);
                }
                Err(e) if instance.status == InstanceStatus::Starting => {
                    if started.elapsed() >= self.health.startup_timeout {
                        self.transition(instance, InstanceStatus::Unhealthy);
                        return Outcome::Unhealthy(format!(
                            "not ready after {:?}: {e}",
                            self.health.startup_timeout
                        ));
                    }
                }
                Err(e) => {
                    consecutive += 1;
                    debug!(
                        component = "health",
                        event = "probe_failed",
                        instance_id = %instance.id,
                        consecutive,
                        error = %e
                    );
                    if consecutive >= self.health.failure_threshold {
                        self.transition(instance, InstanceStatus::Unhealthy);
                        return Outcome::Unhealthy(format!(
                            "{consecutive} consecutive failed probes, last: {e}"
                        ));
                    }
                }
            }
        }
    }

    /// Replaces a dead or unhealthy instance, retrying within the budget.
    ///
    /// Returns the replacement, or `None` when the lifeline ended (budget
    /// spent or cancelled while waiting).
    #[allow(clippy::too_many_arguments)]
    async fn heal(
        &self,
        lifeline: LifelineId,
        entry: &ServiceManifestEntry,
        old: &Instance,
        mut reason: String,
        budget: &mut RestartBudget,
        backoff: Backoff,
        cancel: &CancellationToken,
    ) -> Option<Instance> {
        warn!(
            component = "health",
            event = "restarting",
            lifeline,
            service = %entry.name,
            instance_id = %old.id,
            reason = %reason,
            "instance needs replacement"
        );
        self.registry.set_status(&old.id, InstanceStatus::Restarting);
        // Once terminate returns the process has been reaped.
        let old_dead = match self.supervisor.terminate(&old.id, false).await {
            Ok(_) => true,
            Err(e) => {
                debug!(component = "health", event = "terminate_failed", instance_id = %old.id, error = %e);
                false
            }
        };

        let mut restarts = old.restart_count;
        let mut old_port = Some(old.port);

        loop {
            let Some(attempt) = budget.try_acquire(Instant::now()) else {
                self.fail(old, restarts, reason, &mut old_port);
                return None;
            };

            tokio::select! {
                _ = cancel.cancelled() => {
                    self.release_port(&mut old_port);
                    self.registry.remove(&old.id);
                    self.samples.remove(&old.id);
                    return None;
                }
                _ = tokio::time::sleep(backoff.delay_for_attempt(attempt)) => {}
            }

            // The new port is held before the old one is freed, so the
            // replacement gets a different port whenever the pool has one.
            let reserved = match self.ports.reserve() {
                Err(PortError::PoolExhausted { .. }) if old_dead && old_port.is_some() => {
                    self.release_port(&mut old_port);
                    self.ports.reserve()
                }
                other => other,
            };
            let lease = match reserved {
                Ok(lease) => lease,
                Err(e) => {
                    reason = e.to_string();
                    warn!(component = "health", event = "restart_failed", service = %entry.name, attempt, error = %e);
                    continue;
                }
            };
            self.release_port(&mut old_port);

            restarts += 1;
            metrics::add_restart(&entry.name);

            match self.supervisor.spawn(entry, lease.port).await {
                Ok(mut next) => {
                    next.restart_count = restarts;
                    if let Err(e) = self.ports.assign(lease.port, next.id.clone()) {
                        warn!(component = "health", event = "assign_failed", port = lease.port, error = %e);
                    }
                    self.registry.remove(&old.id);
                    self.samples.remove(&old.id);
                    self.retired.lock().insert(old.id.clone());
                    self.registry.upsert(next.clone());
                    info!(
                        component = "health",
                        event = "restarted",
                        lifeline,
                        service = %entry.name,
                        old_instance_id = %old.id,
                        instance_id = %next.id,
                        old_port = old.port,
                        port = next.port,
                        restart_count = restarts,
                        "replacement started"
                    );
                    return Some(next);
                }
                Err(e) => {
                    let _ = self.ports.release(lease.port);
                    reason = e.to_string();
                    warn!(
                        component = "health",
                        event = "restart_failed",
                        service = %entry.name,
                        attempt,
                        error = %e
                    );
                    self.registry.update(&old.id, |i| i.restart_count = restarts);
                }
            }
        }
    }

    fn fail(&self, old: &Instance, restarts: u32, reason: String, old_port: &mut Option<u16>) {
        self.release_port(old_port);
        self.registry.update(&old.id, |i| {
            i.status = InstanceStatus::Failed;
            i.restart_count = restarts;
        });
        metrics::add_failed(&old.service);
        error!(
            component = "health",
            event = "failed",
            service = %old.service,
            instance_id = %old.id,
            restart_count = restarts,
            reason = %reason,
            "restart budget exceeded"
        );
        self.failures.lock().push(FailureReport {
            service: old.service.clone(),
            instance_id: old.id.clone(),
            restart_count: restarts,
            reason,
            failed_at: Utc::now(),
        });
    }

    /// Gracefully stops the instance and frees everything it holds.
    async fn retire(&self, instance: &Instance) {
        if let Err(e) = self.supervisor.terminate(&instance.id, true).await {
            debug!(component = "health", event = "terminate_failed", instance_id = %instance.id, error = %e);
        }
        self.release(instance);
    }

    fn release(&self, instance: &Instance) {
        self.supervisor.forget(&instance.id);
        let _ = self.ports.release(instance.port);
        self.registry.remove(&instance.id);
        self.samples.remove(&instance.id);
    }

    fn release_port(&self, port: &mut Option<u16>) {
        if let Some(port) = port.take() {
            let _ = self.ports.release(port);
        }
    }

    async fn probe(&self, instance: &Instance, target: &ProbeTarget) -> Result<(), ProbeError> {
        let started = std::time::Instant::now();
        let res = match tokio::time::timeout(
            self.health.probe_timeout,
            self.prober.probe(target, instance.port),
        )
        .await
        {
            Ok(res) => res,
            Err(_) => Err(ProbeError::Timeout),
        };
        let latency_ms = started.elapsed().as_millis() as u64;
        let result = match &res {
            Ok(()) => ProbeResult::Ok,
            Err(e) => e.result(),
        };

        metrics::add_probe(&instance.service, result.as_str(), latency_ms);
        self.record(HealthSample {
            instance_id: instance.id.clone(),
            timestamp: Utc::now(),
            result,
            latency_ms,
        });
        res
    }

    fn record(&self, sample: HealthSample) {
        let window = self.health.samples_window.max(1);
        let mut samples = self.samples.entry(sample.instance_id.clone()).or_default();
        if samples.len() >= window {
            samples.pop_front();
        }
        samples.push_back(sample);
    }

    fn transition(&self, instance: &mut Instance, to: InstanceStatus) {
        let from = instance.status;
        instance.status = to;
        self.registry.set_status(&instance.id, to);
        info!(
            component = "health",
            event = "transition",
            service = %instance.service,
            instance_id = %instance.id,
            from = %from,
            to = %to
        );
    }

    fn heartbeat(&self, instance: &mut Instance) {
        let now = Utc::now();
        instance.last_heartbeat_at = Some(now);
        self.registry
            .update(&instance.id, |i| i.last_heartbeat_at = Some(now));
    }
}
