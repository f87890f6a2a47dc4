// Package registry provides snapshot persistence for the instance table.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::Registry;
use crate::model::Instance;

/// On-disk form of the registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub node_id: String,
    pub written_at: DateTime<Utc>,
    pub instances: Vec<Instance>,
}

/// Writes registry snapshots to one JSON file.
pub struct RegistryDumper {
    path: PathBuf,
    node_id: String,
    registry: Arc<Registry>,
}

impl RegistryDumper {
    pub fn new(path: impl Into<PathBuf>, node_id: impl Into<String>, registry: Arc<Registry>) -> Self {
        Self {
            path: path.into(),
            node_id: node_id.into(),
            registry,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Writes the current registry. The file is replaced atomically via tmp + rename.
    pub fn dump(&self) -> Result<usize> {
        let start = Instant::now();
        let snapshot = Snapshot {
            node_id: self.node_id.clone(),
            written_at: Utc::now(),
            instances: self.registry.all(),
        };
        let data = serde_json::to_vec_pretty(&snapshot).context("encode registry snapshot")?;

        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir)
                .with_context(|| format!("create snapshot dir: {}", dir.display()))?;
        }

        let tmp = PathBuf::from(format!("{}.tmp", self.path.display()));
        {
            let mut file = fs::File::create(&tmp)
                .with_context(|| format!("create snapshot tmp file: {}", tmp.display()))?;
            file.write_all(&data)
                .with_context(|| format!("write snapshot: {}", tmp.display()))?;
            file.sync_all()
                .with_context(|| format!("sync snapshot: {}", tmp.display()))?;
        }
        fs::rename(&tmp, &self.path)
            .with_context(|| format!("rename snapshot into place: {}", self.path.display()))?;

        info!(
            component = "registry",
            event = "dumped",
            path = %self.path.display(),
            instances = snapshot.instances.len(),
            elapsed = ?start.elapsed(),
            "registry snapshot written"
        );
        Ok(snapshot.instances.len())
    }

    /// Reads the snapshot left by a previous run, if any.
    pub fn load(path: &Path) -> Result<Option<Snapshot>> {
        let data = match fs::read(path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e).with_context(|| format!("read snapshot: {}", path.display()))
            }
        };
        let snapshot = serde_json::from_slice(&data)
            .with_context(|| format!("decode snapshot: {}", path.display()))?;
        Ok(Some(snapshot))
    }

    /// Dumps on every tick until `ctx` is cancelled, then once more.
    pub async fn run(self: Arc<Self>, ctx: CancellationToken, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ctx.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.dump() {
                        error!(component = "registry", event = "dump_failed", error = %e);
                    }
                }
            }
        }

        if let Err(e) = self.dump() {
            error!(component = "registry", event = "final_dump_failed", error = %e);
        }
    }
}

/// Stops processes recorded by a previous run that are still alive.
///
/// Supervised processes lead their own process group, so the group of the
/// recorded pid is signalled. Returns the number of groups signalled.
#[cfg(unix)]
pub fn reap_orphans(snapshot: &Snapshot) -> usize {
    use crate::supervisor::process::{signal_group, terminate_signal};

    let mut reaped = 0;
    for inst in snapshot.instances.iter().filter(|i| i.status.is_live()) {
        let Some(pid) = inst.pid else { continue };
        // Signal 0 only checks that the group exists.
        if signal_group(pid, 0).is_err() {
            continue;
        }
        match signal_group(pid, terminate_signal()) {
            Ok(()) => {
                reaped += 1;
                warn!(
                    component = "registry",
                    event = "orphan_reaped",
                    instance_id = %inst.id,
                    service = %inst.service,
                    pid,
                    port = inst.port,
                    "stopped process left by a previous run"
                );
            }
            Err(e) => warn!(
                component = "registry",
                event = "orphan_reap_failed",
                instance_id = %inst.id,
                pid,
                error = %e
            ),
        }
    }
    reaped
}

#[cfg(not(unix))]
pub fn reap_orphans(_snapshot: &Snapshot) -> usize {
    0
}
