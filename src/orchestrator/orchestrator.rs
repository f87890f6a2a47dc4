// Orchestrator facade.

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{info, warn};

use super::OrchestratorError;
use crate::chain::{Intent, LocalService, Reconciler};
use crate::config::{Config, ConfigTrait};
use crate::health::{FailureReport, HealthMonitor, Prober};
use crate::manifest::{Manifest, ServiceManifestEntry};
use crate::metrics;
use crate::model::{
    HealthSample, InstanceId, InstanceStatus, InstanceSummary, LifecycleEvent,
};
use crate::ports::PortAllocator;
use crate::registry::Registry;
use crate::supervisor::Supervisor;

/// Result of a scale operation.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScaleReport {
    pub service: String,
    pub from: u32,
    pub to: u32,
    pub started: Vec<InstanceId>,
    pub stopped: Vec<InstanceId>,
}

/// Public entry point composing the allocator, supervisor, registry and
/// health monitor.
///
/// Operations on one service are serialized by a per-service async lock;
/// operations on different services run concurrently.
pub struct Orchestrator {
    manifest: Arc<Manifest>,
    ports: Arc<PortAllocator>,
    supervisor: Arc<Supervisor>,
    registry: Arc<Registry>,
    monitor: HealthMonitor,
    dependency_timeout: Duration,
    desired: DashMap<String, u32>,
    locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
    pending: Mutex<Vec<Intent>>,
    shutting_down: AtomicBool,
}

impl Orchestrator {
    pub fn new(cfg: &Config, manifest: Manifest, prober: Arc<dyn Prober>) -> Self {
        let ports = Arc::new(PortAllocator::new(&cfg.ports()));
        let supervisor = Arc::new(Supervisor::new(cfg.supervisor()));
        let registry = Arc::new(Registry::new());
        let monitor = HealthMonitor::new(
            cfg.health(),
            cfg.restart(),
            supervisor.clone(),
            registry.clone(),
            ports.clone(),
            prober,
        );

        let desired = manifest
            .entries()
            .iter()
            .map(|e| (e.name.clone(), e.replicas))
            .collect();

        Self {
            manifest: Arc::new(manifest),
            ports,
            supervisor,
            registry,
            monitor,
            dependency_timeout: cfg.dependency_timeout(),
            desired,
            locks: DashMap::new(),
            pending: Mutex::new(Vec::new()),
            shutting_down: AtomicBool::new(false),
        }
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn ports(&self) -> &Arc<PortAllocator> {
        &self.ports
    }

    /// Deploys every service in dependency order.
    ///
    /// Fails with `CyclicDependency` before anything is spawned. A service
    /// is started only after every instance of each of its dependencies
    /// reports Running.
    pub async fn deploy_all(&self) -> Result<Vec<InstanceId>, OrchestratorError> {
        let layers = self.manifest.deployment_layers()?;
        let mut started = Vec::new();

        for layer in layers {
            for entry in layer {
                self.await_dependencies(&entry).await?;

                let lock = self.lock_for(&entry.name);
                let _guard = lock.lock().await;
                self.ensure_not_shutting_down()?;

                let desired = self.desired_of(&entry.name);
                let live = self.live_count(&entry.name);
                for _ in live..desired as usize {
                    started.push(self.spawn_one(&entry).await?);
                }
                self.intend(Intent::active(entry.name.clone()));
                info!(
                    component = "orchestrator",
                    event = "service_deployed",
                    service = %entry.name,
                    replicas = desired
                );
            }
        }
        Ok(started)
    }

    /// Adds one instance of `service` if it runs fewer than desired.
    ///
    /// A service previously terminated as a whole is re-activated with its
    /// manifest replica count. Failed instances of the service are cleared.
    pub async fn deploy(&self, service: &str) -> Result<InstanceId, OrchestratorError> {
        let entry = self.entry(service)?;
        let lock = self.lock_for(service);
        let _guard = lock.lock().await;
        self.ensure_not_shutting_down()?;

        self.clear_failed(service).await;
        let desired = {
            let mut desired = self.desired.entry(service.to_string()).or_insert(entry.replicas);
            if *desired == 0 {
                *desired = entry.replicas;
            }
            *desired
        };
        if self.live_count(service) >= desired as usize {
            return Err(OrchestratorError::AlreadyAtDesired {
                service: service.to_string(),
                desired,
            });
        }

        let id = self.spawn_one(&entry).await?;
        self.intend(Intent::active(service));
        Ok(id)
    }

    /// Gracefully stops one instance. Repeated calls for the same id succeed.
    pub async fn terminate_instance(&self, id: &InstanceId) -> Result<(), OrchestratorError> {
        let Some(lifeline) = self.monitor.lifeline_of(id) else {
            if self.monitor.is_retired(id) {
                return Ok(());
            }
            return Err(OrchestratorError::UnknownInstance(id.clone()));
        };

        let service = self
            .registry
            .get(id)
            .map(|i| i.service)
            .unwrap_or_default();
        let lock = self.lock_for(&service);
        let _guard = lock.lock().await;

        if let Some(stopped) = self.monitor.stop_lifeline(lifeline).await {
            self.monitor.retire(stopped);
        }
        self.monitor.retire(id.clone());
        self.monitor.clear_failures(&service);
        info!(component = "orchestrator", event = "instance_terminated", instance_id = %id, service = %service);
        Ok(())
    }

    /// Stops every instance of `service` and marks it inactive. Idempotent.
    pub async fn terminate_service(&self, service: &str) -> Result<Vec<InstanceId>, OrchestratorError> {
        self.entry(service)?;
        let lock = self.lock_for(service);
        let _guard = lock.lock().await;

        let stopped = self.stop_service(service).await;
        self.intend(Intent::inactive(service));
        info!(
            component = "orchestrator",
            event = "service_terminated",
            service = %service,
            stopped = stopped.len()
        );
        Ok(stopped)
    }

    /// Sets the desired replica count and converges the live count on it.
    pub async fn scale(&self, service: &str, replicas: u32) -> Result<ScaleReport, OrchestratorError> {
        let entry = self.entry(service)?;
        let lock = self.lock_for(service);
        let _guard = lock.lock().await;
        self.ensure_not_shutting_down()?;

        self.clear_failed(service).await;
        let from = self.live_count(service) as u32;
        self.desired.insert(service.to_string(), replicas);

        let mut report = ScaleReport {
            service: service.to_string(),
            from,
            to: replicas,
            started: Vec::new(),
            stopped: Vec::new(),
        };

        if replicas == 0 {
            report.stopped = self.stop_service(service).await;
            self.intend(Intent::inactive(service));
            return Ok(report);
        }

        for _ in from..replicas {
            report.started.push(self.spawn_one(&entry).await?);
        }
        if from > replicas {
            // Newest lifelines go first.
            let surplus = (from - replicas) as usize;
            for lifeline in self.monitor.lifelines_of(service).into_iter().rev().take(surplus) {
                if let Some(id) = self.monitor.stop_lifeline(lifeline).await {
                    self.monitor.retire(id.clone());
                    report.stopped.push(id);
                }
            }
        }
        self.intend(Intent::active(service));

        info!(
            component = "orchestrator",
            event = "service_scaled",
            service = %service,
            from,
            to = replicas
        );
        Ok(report)
    }

    /// Every known instance, ordered by service then start time.
    pub fn status(&self) -> Vec<InstanceSummary> {
        let now = Utc::now();
        let mut all = self.registry.all();
        all.sort_by(|a, b| {
            a.service
                .cmp(&b.service)
                .then(a.started_at.cmp(&b.started_at))
        });
        all.iter().map(|i| i.summary(now)).collect()
    }

    pub fn status_of(&self, service: &str) -> Result<Vec<InstanceSummary>, OrchestratorError> {
        self.entry(service)?;
        Ok(self
            .status()
            .into_iter()
            .filter(|s| s.service_name == service)
            .collect())
    }

    /// Rolling probe samples of a registered instance.
    pub fn samples(&self, id: &InstanceId) -> Result<Vec<HealthSample>, OrchestratorError> {
        if self.registry.get(id).is_none() {
            return Err(OrchestratorError::UnknownInstance(id.clone()));
        }
        Ok(self.monitor.samples(id))
    }

    pub fn failures(&self) -> Vec<FailureReport> {
        self.monitor.failures()
    }

    /// Whether any instance ended in `Failed`.
    pub fn has_failures(&self) -> bool {
        self.registry
            .all()
            .iter()
            .any(|i| i.status == InstanceStatus::Failed)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.supervisor.subscribe()
    }

    /// Updates instance and port gauges.
    pub fn publish_metrics(&self) {
        self.registry.publish_metrics();
        metrics::set_ports_leased(self.ports.leases().len());
    }

    /// Gracefully stops every instance. Further deploys are refused.
    pub async fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(
            component = "orchestrator",
            event = "shutdown",
            lifelines = self.monitor.len(),
            "stopping all instances"
        );
        self.monitor.stop_all().await;

        let stragglers = self.supervisor.terminate_all(true).await;
        if !stragglers.is_empty() {
            warn!(
                component = "orchestrator",
                event = "stragglers_stopped",
                count = stragglers.len()
            );
        }
    }

    fn entry(&self, service: &str) -> Result<Arc<ServiceManifestEntry>, OrchestratorError> {
        self.manifest
            .get(service)
            .ok_or_else(|| OrchestratorError::UnknownService(service.to_string()))
    }

    fn lock_for(&self, service: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.locks.entry(service.to_string()).or_default().clone()
    }

    fn desired_of(&self, service: &str) -> u32 {
        self.desired.get(service).map(|d| *d).unwrap_or(0)
    }

    fn live_count(&self, service: &str) -> usize {
        self.registry.count(service, |s| s.is_live())
    }

    fn ensure_not_shutting_down(&self) -> Result<(), OrchestratorError> {
        if self.shutting_down.load(Ordering::SeqCst) {
            Err(OrchestratorError::ShuttingDown)
        } else {
            Ok(())
        }
    }

    fn intend(&self, intent: Intent) {
        self.pending.lock().push(intent);
    }

    /// Reserve, spawn, register, watch. The port goes back to the pool if
    /// the spawn fails.
    async fn spawn_one(&self, entry: &Arc<ServiceManifestEntry>) -> Result<InstanceId, OrchestratorError> {
        let lease = self
            .ports
            .reserve()
            .map_err(|e| OrchestratorError::from_port(&entry.name, e))?;

        let instance = match self.supervisor.spawn(entry, lease.port).await {
            Ok(instance) => instance,
            Err(e) => {
                let _ = self.ports.release(lease.port);
                return Err(OrchestratorError::from_supervisor(e));
            }
        };

        let id = instance.id.clone();
        if let Err(e) = self.ports.assign(lease.port, id.clone()) {
            warn!(component = "orchestrator", event = "assign_failed", port = lease.port, error = %e);
        }
        self.registry.upsert(instance.clone());
        self.monitor.watch(entry.clone(), instance);
        Ok(id)
    }

    /// Stops all lifelines of a service and zeroes its desired count.
    async fn stop_service(&self, service: &str) -> Vec<InstanceId> {
        self.desired.insert(service.to_string(), 0);
        let lifelines = self.monitor.lifelines_of(service);
        let stopped: Vec<InstanceId> = futures::future::join_all(
            lifelines.into_iter().map(|l| self.monitor.stop_lifeline(l)),
        )
        .await
        .into_iter()
        .flatten()
        .collect();

        for id in &stopped {
            self.monitor.retire(id.clone());
        }
        self.monitor.clear_failures(service);
        stopped
    }

    /// Drops lifelines of `service` whose instance ended in `Failed`.
    async fn clear_failed(&self, service: &str) {
        for lifeline in self.monitor.lifelines_of(service) {
            let failed = self
                .monitor
                .current(lifeline)
                .and_then(|id| self.registry.get(&id))
                .map(|i| i.status == InstanceStatus::Failed)
                .unwrap_or(false);
            if failed {
                if let Some(id) = self.monitor.stop_lifeline(lifeline).await {
                    self.monitor.retire(id);
                }
            }
        }
        self.monitor.clear_failures(service);
    }

    async fn await_dependencies(&self, entry: &ServiceManifestEntry) -> Result<(), OrchestratorError> {
        if entry.dependencies.is_empty() {
            return Ok(());
        }

        let settled = |r: &Registry, dep: &str| {
            dependency_ready(r, dep) || dependency_failed(r, dep)
        };
        self.registry
            .wait_for(self.dependency_timeout, |r| {
                entry.dependencies.iter().all(|d| settled(r, d))
            })
            .await;

        for dep in &entry.dependencies {
            if dependency_failed(&self.registry, dep) {
                return Err(OrchestratorError::RestartBudgetExceeded {
                    service: dep.clone(),
                });
            }
            if !dependency_ready(&self.registry, dep) {
                return Err(OrchestratorError::DependencyNotReady {
                    service: entry.name.clone(),
                    dependency: dep.clone(),
                });
            }
        }
        Ok(())
    }
}

/// Every live instance of `dep` is Running, and there is at least one.
fn dependency_ready(registry: &Registry, dep: &str) -> bool {
    let live = registry.count(dep, |s| s.is_live());
    live > 0 && registry.count(dep, |s| s == InstanceStatus::Running) == live
}

fn dependency_failed(registry: &Registry, dep: &str) -> bool {
    registry.count(dep, |s| s.is_live()) == 0
        && registry.count(dep, |s| s == InstanceStatus::Failed) > 0
}

#[async_trait]
impl Reconciler for Orchestrator {
    fn local_view(&self) -> BTreeMap<String, LocalService> {
        let mut view: BTreeMap<String, LocalService> = BTreeMap::new();
        for inst in self.registry.all() {
            let s = view.entry(inst.service.clone()).or_default();
            if inst.status.is_up() {
                s.up += 1;
            }
            if inst.status.is_live() {
                s.live += 1;
            }
            if inst.status == InstanceStatus::Failed {
                s.failed = true;
            }
        }
        view
    }

    async fn resurrect(&self, service: &str) -> anyhow::Result<()> {
        let entry = self.entry(service)?;
        let lock = self.lock_for(service);
        let _guard = lock.lock().await;
        self.ensure_not_shutting_down()?;

        if self.live_count(service) > 0 {
            return Ok(());
        }
        let desired = {
            let mut desired = self.desired.entry(service.to_string()).or_insert(entry.replicas);
            if *desired == 0 {
                *desired = entry.replicas;
            }
            *desired
        };
        for _ in 0..desired {
            self.spawn_one(&entry).await?;
        }
        info!(
            component = "orchestrator",
            event = "resurrected",
            service = %service,
            replicas = desired
        );
        Ok(())
    }

    async fn deactivate(&self, service: &str) -> anyhow::Result<()> {
        self.entry(service)?;
        let lock = self.lock_for(service);
        let _guard = lock.lock().await;

        let stopped = self.stop_service(service).await;
        info!(
            component = "orchestrator",
            event = "deactivated",
            service = %service,
            stopped = stopped.len()
        );
        Ok(())
    }

    fn take_pending_intents(&self) -> Vec<Intent> {
        std::mem::take(&mut *self.pending.lock())
    }

    fn restore_pending_intents(&self, mut intents: Vec<Intent>) {
        let mut pending = self.pending.lock();
        intents.append(&mut pending);
        *pending = intents;
    }
}
