// Process supervisor: spawns, watches and stops service processes.

use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io;
use std::process::ExitStatus;
use std::time::Duration;
use tokio::process::Child;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use super::process::{build_command, signal_group, terminate_signal};
use super::SupervisorError;
use crate::config::SupervisorSettings;
use crate::manifest::ServiceManifestEntry;
use crate::metrics;
use crate::model::{ExitEvent, Instance, InstanceId, InstanceStatus, LifecycleEvent};

const EVENTS_CAPACITY: usize = 1024;

type ExitRx = watch::Receiver<Option<ExitEvent>>;

/// Supervisor-side handle of one running process.
struct ProcessHandle {
    /// Carries the graceful flag of a terminate request.
    stop_tx: mpsc::Sender<bool>,
    exit_rx: ExitRx,
}

enum Wake {
    Exited(io::Result<ExitStatus>),
    Stop(Option<bool>),
}

/// Owns every OS process spawned on behalf of the orchestrator.
///
/// Each process is owned by a dedicated task that reaps it; the supervisor
/// keeps only channels to that task. Exits are published exactly once, both
/// on the per-instance watch channel and on the lifecycle broadcast.
pub struct Supervisor {
    cfg: SupervisorSettings,
    handles: Mutex<HashMap<InstanceId, ProcessHandle>>,
    events: broadcast::Sender<LifecycleEvent>,
}

impl Supervisor {
    pub fn new(cfg: SupervisorSettings) -> Self {
        let (events, _) = broadcast::channel(EVENTS_CAPACITY);
        Self {
            cfg,
            handles: Mutex::new(HashMap::new()),
            events,
        }
    }

    /// Starts one process for `entry` bound to `port`.
    ///
    /// The returned instance is `Starting`. A process that exits with a
    /// non-zero status inside the spawn check window is reported as
    /// `SpawnFailed`.
    pub async fn spawn(
        &self,
        entry: &ServiceManifestEntry,
        port: u16,
    ) -> Result<Instance, SupervisorError> {
        let id = InstanceId::generate(&entry.name);
        let service = entry.name.clone();

        let mut cmd = build_command(entry, port, &id, &self.cfg.port_env).inspect_err(|_| {
            metrics::add_spawn_failure(&service);
        })?;
        let child = cmd.spawn().map_err(|e| {
            metrics::add_spawn_failure(&service);
            SupervisorError::spawn_failed(&service, e.to_string())
        })?;
        let Some(pid) = child.id() else {
            metrics::add_spawn_failure(&service);
            return Err(SupervisorError::spawn_failed(&service, "process exited before it got a pid"));
        };

        let (stop_tx, stop_rx) = mpsc::channel(1);
        let (exit_tx, exit_rx) = watch::channel(None);
        self.handles.lock().insert(
            id.clone(),
            ProcessHandle {
                stop_tx,
                exit_rx: exit_rx.clone(),
            },
        );

        let (announced_tx, announced_rx) = oneshot::channel();
        tokio::spawn(own_process(
            child,
            id.clone(),
            service.clone(),
            pid,
            self.cfg.grace_period,
            stop_rx,
            exit_tx,
            announced_rx,
            self.events.clone(),
        ));

        if let Some(exit) = early_exit(exit_rx, self.cfg.spawn_check).await {
            if exit.exit_code != Some(0) {
                let _ = announced_tx.send(false);
                self.handles.lock().remove(&id);
                metrics::add_spawn_failure(&service);
                warn!(
                    component = "supervisor",
                    event = "spawn_failed",
                    service = %service,
                    instance_id = %id,
                    reason = %exit.describe(),
                    "process exited during spawn check"
                );
                return Err(SupervisorError::spawn_failed(
                    &service,
                    format!("exited with {} during spawn check", exit.describe()),
                ));
            }
        }

        let _ = self.events.send(LifecycleEvent::Spawned {
            instance_id: id.clone(),
            service: service.clone(),
            port,
            pid,
            timestamp: Utc::now(),
        });
        let _ = announced_tx.send(true);

        metrics::add_spawn(&service);
        info!(
            component = "supervisor",
            event = "spawned",
            service = %service,
            instance_id = %id,
            pid,
            port,
            "process started"
        );

        let mut instance = Instance::new(id, service, port, Some(pid));
        instance.status = InstanceStatus::Starting;
        Ok(instance)
    }

    /// Stops an instance and waits for its exit.
    ///
    /// Graceful termination sends SIGTERM and escalates to SIGKILL after the
    /// grace period. Terminating an instance that is unknown or already
    /// reaped returns `Ok(None)`, so repeated calls are harmless.
    pub async fn terminate(
        &self,
        id: &InstanceId,
        graceful: bool,
    ) -> Result<Option<ExitEvent>, SupervisorError> {
        let Some((stop_tx, mut exit_rx)) = self
            .handles
            .lock()
            .get(id)
            .map(|h| (h.stop_tx.clone(), h.exit_rx.clone()))
        else {
            return Ok(None);
        };

        if exit_rx.borrow().is_none() {
            // A closed channel means the owner already saw the exit.
            let _ = stop_tx.send(graceful).await;
        }
        let exit = wait_exit(&mut exit_rx).await;
        self.handles.lock().remove(id);
        Ok(exit)
    }

    /// Waits until the process of `id` exits, without stopping it.
    pub async fn wait(&self, id: &InstanceId) -> Result<ExitEvent, SupervisorError> {
        let mut exit_rx = self
            .handles
            .lock()
            .get(id)
            .map(|h| h.exit_rx.clone())
            .ok_or_else(|| SupervisorError::UnknownInstance(id.clone()))?;

        wait_exit(&mut exit_rx)
            .await
            .ok_or_else(|| SupervisorError::UnknownInstance(id.clone()))
    }

    /// Drops bookkeeping for an instance whose exit was already observed.
    pub fn forget(&self, id: &InstanceId) {
        self.handles.lock().remove(id);
    }

    /// Stops every supervised process concurrently.
    pub async fn terminate_all(&self, graceful: bool) -> Vec<ExitEvent> {
        let ids: Vec<InstanceId> = self.handles.lock().keys().cloned().collect();
        let stops = ids.iter().map(|id| self.terminate(id, graceful));
        futures::future::join_all(stops)
            .await
            .into_iter()
            .filter_map(|r| r.ok().flatten())
            .collect()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.events.subscribe()
    }

    pub fn is_running(&self, id: &InstanceId) -> bool {
        self.handles
            .lock()
            .get(id)
            .map(|h| h.exit_rx.borrow().is_none())
            .unwrap_or(false)
    }

    /// Number of processes that have not exited yet.
    pub fn running(&self) -> usize {
        self.handles
            .lock()
            .values()
            .filter(|h| h.exit_rx.borrow().is_none())
            .count()
    }
}

async fn early_exit(mut exit_rx: ExitRx, window: Duration) -> Option<ExitEvent> {
    match tokio::time::timeout(window, exit_rx.wait_for(Option::is_some)).await {
        Ok(Ok(exit)) => exit.clone(),
        _ => None,
    }
}

async fn wait_exit(exit_rx: &mut ExitRx) -> Option<ExitEvent> {
    let exit = exit_rx.wait_for(Option::is_some).await.ok().and_then(|e| e.clone());
    exit.or_else(|| exit_rx.borrow().clone())
}

/// Reaps one child. Runs until the process has exited and the exit is published.
#[allow(clippy::too_many_arguments)]
async fn own_process(
    mut child: Child,
    id: InstanceId,
    service: String,
    pid: u32,
    grace: Duration,
    mut stop_rx: mpsc::Receiver<bool>,
    exit_tx: watch::Sender<Option<ExitEvent>>,
    announced: oneshot::Receiver<bool>,
    events: broadcast::Sender<LifecycleEvent>,
) {
    let wake = tokio::select! {
        status = child.wait() => Wake::Exited(status),
        graceful = stop_rx.recv() => Wake::Stop(graceful),
    };

    let (status, requested) = match wake {
        Wake::Exited(status) => (status, false),
        Wake::Stop(Some(graceful)) => (stop_child(&mut child, pid, graceful, grace, &id).await, true),
        // Handle dropped without a terminate request; keep reaping.
        Wake::Stop(None) => (child.wait().await, false),
    };
    drop(stop_rx);

    let (exit_code, signal) = match &status {
        Ok(status) => decode_status(status),
        Err(e) => {
            warn!(component = "supervisor", event = "wait_failed", instance_id = %id, error = %e);
            (None, None)
        }
    };

    let exit = ExitEvent {
        instance_id: id,
        service,
        exit_code,
        signal,
        timestamp: Utc::now(),
        requested,
    };

    metrics::add_exit(&exit.service, exit.is_crash());
    if exit.is_crash() {
        warn!(
            component = "supervisor",
            event = "crashed",
            service = %exit.service,
            instance_id = %exit.instance_id,
            status = %exit.describe(),
            "process exited unexpectedly"
        );
    } else {
        info!(
            component = "supervisor",
            event = "stopped",
            service = %exit.service,
            instance_id = %exit.instance_id,
            status = %exit.describe(),
            "process stopped"
        );
    }

    exit_tx.send_replace(Some(exit.clone()));
    // Exits of processes rejected by the spawn check are not broadcast,
    // and an announced exit never precedes its Spawned event.
    if announced.await.unwrap_or(false) {
        let _ = events.send(LifecycleEvent::Exited(exit));
    }
}

async fn stop_child(
    child: &mut Child,
    pid: u32,
    graceful: bool,
    grace: Duration,
    id: &InstanceId,
) -> io::Result<ExitStatus> {
    if graceful {
        if let Err(e) = signal_group(pid, terminate_signal()) {
            debug!(component = "supervisor", event = "sigterm_failed", instance_id = %id, error = %e);
        }
        match tokio::time::timeout(grace, child.wait()).await {
            Ok(status) => return status,
            Err(_) => warn!(
                component = "supervisor",
                event = "grace_elapsed",
                instance_id = %id,
                grace = ?grace,
                "process ignored SIGTERM, killing"
            ),
        }
    }

    #[cfg(unix)]
    if let Err(e) = signal_group(pid, libc::SIGKILL) {
        debug!(component = "supervisor", event = "sigkill_group_failed", instance_id = %id, error = %e);
    }
    if let Err(e) = child.start_kill() {
        debug!(component = "supervisor", event = "kill_failed", instance_id = %id, error = %e);
    }
    child.wait().await
}

#[cfg(unix)]
fn decode_status(status: &ExitStatus) -> (Option<i32>, Option<i32>) {
    use std::os::unix::process::ExitStatusExt;
    (status.code(), status.signal())
}

#[cfg(not(unix))]
fn decode_status(status: &ExitStatus) -> (Option<i32>, Option<i32>) {
    (status.code(), None)
}
