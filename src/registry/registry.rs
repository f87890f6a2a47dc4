// In-memory instance table.

use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tokio::sync::watch;

use crate::metrics;
use crate::model::{Instance, InstanceId, InstanceStatus};

/// Table of all instances keyed by id.
///
/// Every mutation happens under one write lock and bumps a version counter;
/// readers get cloned snapshots and may await the next version through
/// [`Registry::subscribe`] or [`Registry::wait_for`].
pub struct Registry {
    instances: RwLock<BTreeMap<InstanceId, Instance>>,
    version: watch::Sender<u64>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        let (version, _) = watch::channel(0);
        Self {
            instances: RwLock::new(BTreeMap::new()),
            version,
        }
    }

    /// Inserts or replaces an instance. Returns the previous value.
    pub fn upsert(&self, instance: Instance) -> Option<Instance> {
        let prev = self.instances.write().insert(instance.id.clone(), instance);
        self.bump();
        prev
    }

    pub fn remove(&self, id: &InstanceId) -> Option<Instance> {
        let removed = self.instances.write().remove(id);
        if removed.is_some() {
            self.bump();
        }
        removed
    }

    /// Applies `f` to the instance in place and returns the updated copy.
    pub fn update<F>(&self, id: &InstanceId, f: F) -> Option<Instance>
    where
        F: FnOnce(&mut Instance),
    {
        let updated = {
            let mut instances = self.instances.write();
            let instance = instances.get_mut(id)?;
            f(instance);
            instance.clone()
        };
        self.bump();
        Some(updated)
    }

    /// Sets the status of an instance, if it is still registered.
    pub fn set_status(&self, id: &InstanceId, status: InstanceStatus) -> Option<Instance> {
        self.update(id, |i| i.status = status)
    }

    pub fn get(&self, id: &InstanceId) -> Option<Instance> {
        self.instances.read().get(id).cloned()
    }

    pub fn find(&self, service: &str) -> Vec<Instance> {
        self.instances
            .read()
            .values()
            .filter(|i| i.service == service)
            .cloned()
            .collect()
    }

    pub fn all(&self) -> Vec<Instance> {
        self.instances.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.instances.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.read().is_empty()
    }

    /// Number of instances of `service` whose status matches `pred`.
    pub fn count<P>(&self, service: &str, pred: P) -> usize
    where
        P: Fn(InstanceStatus) -> bool,
    {
        self.instances
            .read()
            .values()
            .filter(|i| i.service == service && pred(i.status))
            .count()
    }

    pub fn version(&self) -> u64 {
        *self.version.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.version.subscribe()
    }

    /// Waits until `done` holds or `timeout` elapses. Returns the final verdict.
    pub async fn wait_for<F>(&self, timeout: Duration, mut done: F) -> bool
    where
        F: FnMut(&Self) -> bool,
    {
        let mut changes = self.version.subscribe();
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if done(self) {
                return true;
            }
            match tokio::time::timeout_at(deadline, changes.changed()).await {
                Ok(Ok(())) => continue,
                _ => return done(self),
            }
        }
    }

    /// Publishes per-service, per-status instance gauges.
    pub fn publish_metrics(&self) {
        let mut counts: HashMap<(String, InstanceStatus), usize> = HashMap::new();
        let mut services: Vec<String> = Vec::new();
        for inst in self.instances.read().values() {
            *counts.entry((inst.service.clone(), inst.status)).or_default() += 1;
            services.push(inst.service.clone());
        }
        services.sort();
        services.dedup();
        for service in &services {
            for status in InstanceStatus::ALL {
                let n = counts.get(&(service.clone(), status)).copied().unwrap_or(0);
                metrics::set_instances(service, status, n);
            }
        }
    }

    fn bump(&self) {
        self.version.send_modify(|v| *v = v.wrapping_add(1));
    }
}
