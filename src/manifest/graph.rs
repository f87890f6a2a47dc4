// Dependency ordering for deployments.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use super::{Manifest, ManifestError, ServiceManifestEntry};

impl Manifest {
    /// Groups services into deployment layers.
    ///
    /// Every service appears in a later layer than all of its dependencies, and
    /// names inside a layer are sorted, so the order is deterministic. Fails with
    /// `CyclicDependency` naming every service that sits on or behind a cycle.
    pub fn deployment_layers(&self) -> Result<Vec<Vec<Arc<ServiceManifestEntry>>>, ManifestError> {
        let mut in_degree: BTreeMap<&str, usize> = BTreeMap::new();
        let mut dependents: BTreeMap<&str, Vec<&str>> = BTreeMap::new();

        for entry in self.entries() {
            in_degree.insert(entry.name.as_str(), entry.dependencies.len());
            for dep in &entry.dependencies {
                dependents
                    .entry(dep.as_str())
                    .or_default()
                    .push(entry.name.as_str());
            }
        }

        let mut layers = Vec::new();
        let mut ready: BTreeSet<&str> = in_degree
            .iter()
            .filter(|(_, &d)| d == 0)
            .map(|(&n, _)| n)
            .collect();
        let mut placed = 0usize;

        while !ready.is_empty() {
            let mut next = BTreeSet::new();
            let mut layer = Vec::with_capacity(ready.len());
            for name in &ready {
                if let Some(entry) = self.get(name) {
                    layer.push(entry);
                }
                placed += 1;
                for dependent in dependents.get(name).into_iter().flatten() {
                    if let Some(d) = in_degree.get_mut(dependent) {
                        *d -= 1;
                        if *d == 0 {
                            next.insert(*dependent);
                        }
                    }
                }
            }
            layers.push(layer);
            ready = next;
        }

        if placed != self.len() {
            let services = in_degree
                .into_iter()
                .filter(|(_, d)| *d > 0)
                .map(|(n, _)| n.to_string())
                .collect();
            return Err(ManifestError::CyclicDependency { services });
        }

        Ok(layers)
    }

    /// Flat topological order.
    pub fn deployment_order(&self) -> Result<Vec<Arc<ServiceManifestEntry>>, ManifestError> {
        Ok(self.deployment_layers()?.into_iter().flatten().collect())
    }
}
