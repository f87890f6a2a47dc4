// Chain-state synchronizer: converges the local node on the mesh-wide intents.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::block::{dedup_intents, Block, Desired, Intent, IntentView};
use super::{ChainError, ChainLog};
use crate::config::ChainSettings;
use crate::metrics;

/// What this node runs for one service.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LocalService {
    /// Instances in Starting or Running.
    pub up: usize,
    /// Instances still holding a replica slot (anything but Terminated/Failed).
    pub live: usize,
    /// Some lifeline of the service exhausted its restart budget.
    pub failed: bool,
}

/// The local side of reconciliation.
#[async_trait]
pub trait Reconciler: Send + Sync {
    fn local_view(&self) -> BTreeMap<String, LocalService>;

    /// Brings up a service the mesh wants active. Must not record an intent.
    async fn resurrect(&self, service: &str) -> anyhow::Result<()>;

    /// Stops every local instance of a service the mesh wants inactive.
    /// Must not record an intent.
    async fn deactivate(&self, service: &str) -> anyhow::Result<()>;

    /// Drains intents produced by local operations since the last call.
    fn take_pending_intents(&self) -> Vec<Intent>;

    /// Puts back intents that could not be appended.
    fn restore_pending_intents(&self, intents: Vec<Intent>);
}

/// Outcome of one synchronizer tick.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TickReport {
    pub height: u64,
    pub resurrected: Vec<String>,
    pub deactivated: Vec<String>,
    pub appended: Option<u64>,
    pub reset: bool,
}

struct SyncState {
    view: IntentView,
    last_seen: u64,
}

pub struct ChainSynchronizer {
    cfg: ChainSettings,
    log: Arc<dyn ChainLog>,
    reconciler: Arc<dyn Reconciler>,
    state: tokio::sync::Mutex<SyncState>,
    /// Cloned view for readers that must not wait on a running tick.
    published: Mutex<IntentView>,
}

impl ChainSynchronizer {
    pub fn new(cfg: ChainSettings, log: Arc<dyn ChainLog>, reconciler: Arc<dyn Reconciler>) -> Self {
        Self {
            cfg,
            log,
            reconciler,
            state: tokio::sync::Mutex::new(SyncState {
                view: IntentView::default(),
                last_seen: 0,
            }),
            published: Mutex::new(IntentView::default()),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.cfg.node_id
    }

    /// Latest-intent view as of the last completed read.
    pub fn view(&self) -> IntentView {
        self.published.lock().clone()
    }

    /// Raw blocks from `from` on, straight from the record.
    pub async fn blocks_from(&self, from: u64) -> Result<Vec<Block>, ChainError> {
        self.blocking(move |log| log.read_from(from)).await
    }

    /// Ticks until `ctx` is cancelled, then flushes pending intents once.
    pub async fn run(self: Arc<Self>, ctx: CancellationToken) {
        info!(
            component = "chain",
            event = "started",
            node_id = %self.cfg.node_id,
            tick = ?self.cfg.tick,
            "chain synchronizer started"
        );

        let mut ticker = tokio::time::interval(self.cfg.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ctx.cancelled() => break,
                _ = ticker.tick() => {
                    match self.tick().await {
                        Ok(report) if !report.resurrected.is_empty() || !report.deactivated.is_empty() => {
                            info!(
                                component = "chain",
                                event = "reconciled",
                                height = report.height,
                                resurrected = ?report.resurrected,
                                deactivated = ?report.deactivated
                            );
                        }
                        Ok(_) => {}
                        Err(e) => error!(component = "chain", event = "tick_failed", error = %e),
                    }
                }
            }
        }

        if let Err(e) = self.flush().await {
            error!(component = "chain", event = "final_flush_failed", error = %e);
        }
        info!(component = "chain", event = "stopped", "chain synchronizer stopped");
    }

    /// One full round: read, reconcile, append.
    pub async fn tick(&self) -> Result<TickReport, ChainError> {
        let mut state = self.state.lock().await;
        let mut report = TickReport::default();

        let previously_seen = state.last_seen;
        report.reset = self.catch_up(&mut state).await?;

        let pending = dedup_intents(self.reconciler.take_pending_intents());
        let local_wins: HashSet<&str> = pending.iter().map(|i| i.service.as_str()).collect();
        let local = self.reconciler.local_view();

        let targets: Vec<(String, Desired, u64)> = state
            .view
            .iter()
            .filter(|(service, _, _)| !local_wins.contains(service))
            .map(|(s, d, h)| (s.to_string(), d, h))
            .collect();

        for (service, desired, height) in targets {
            let here = local.get(&service).copied().unwrap_or_default();
            match desired {
                Desired::Active if here.live == 0 && !here.failed => {
                    match self.reconciler.resurrect(&service).await {
                        Ok(()) => report.resurrected.push(service),
                        Err(e) => warn!(
                            component = "chain",
                            event = "resurrect_failed",
                            service = %service,
                            error = %e
                        ),
                    }
                }
                Desired::Inactive if here.live > 0 && height > previously_seen => {
                    match self.reconciler.deactivate(&service).await {
                        Ok(()) => report.deactivated.push(service),
                        Err(e) => warn!(
                            component = "chain",
                            event = "deactivate_failed",
                            service = %service,
                            error = %e
                        ),
                    }
                }
                _ => {}
            }
        }
        metrics::add_chain_reconcile(
            report.resurrected.len() as u64,
            report.deactivated.len() as u64,
        );

        report.appended = self.append_pending(&mut state, pending).await?;
        report.height = state.last_seen;
        Ok(report)
    }

    /// Appends pending intents without reconciling.
    pub async fn flush(&self) -> Result<Option<u64>, ChainError> {
        let mut state = self.state.lock().await;
        self.catch_up(&mut state).await?;
        let pending = dedup_intents(self.reconciler.take_pending_intents());
        self.append_pending(&mut state, pending).await
    }

    /// Folds blocks above `last_seen` into the view. Re-initializes a
    /// missing or corrupt record. Returns whether a reset happened.
    async fn catch_up(&self, state: &mut SyncState) -> Result<bool, ChainError> {
        let mut reset = false;
        let head = match self.blocking(|log| log.head()).await {
            Ok(head) => head,
            Err(e) if e.needs_reset() => {
                self.reinitialize(state, &e).await?;
                reset = true;
                self.blocking(|log| log.head()).await?
            }
            Err(e) => return Err(e),
        };

        if head < state.last_seen {
            // The record was replaced underneath us; rebuild from scratch.
            warn!(
                component = "chain",
                event = "head_regressed",
                head,
                last_seen = state.last_seen
            );
            state.view.clear();
            state.last_seen = 0;
        }

        if head > state.last_seen {
            let from = state.last_seen + 1;
            let blocks = self.blocking(move |log| log.read_from(from)).await?;
            for block in &blocks {
                state.view.apply(block);
            }
            state.last_seen = state.view.height();
            debug!(component = "chain", event = "caught_up", height = state.last_seen);
        }

        metrics::set_chain_height(state.last_seen);
        *self.published.lock() = state.view.clone();
        Ok(reset)
    }

    /// Replaces an unusable record with a genesis block built from what runs here.
    async fn reinitialize(&self, state: &mut SyncState, cause: &ChainError) -> Result<(), ChainError> {
        let intents: Vec<Intent> = self
            .reconciler
            .local_view()
            .into_iter()
            .filter(|(_, s)| s.live > 0)
            .map(|(service, _)| Intent::active(service))
            .collect();

        let genesis = if intents.is_empty() {
            Vec::new()
        } else {
            vec![Block::new(1, self.cfg.node_id.clone(), intents)]
        };
        warn!(
            component = "chain",
            event = "reinitialized",
            cause = %cause,
            genesis_intents = genesis.first().map(|b| b.intents.len()).unwrap_or(0),
            "chain record re-initialized from local registry"
        );
        match self.blocking(move |log| log.reset(genesis)).await {
            Ok(()) => {}
            Err(ChainError::Conflict { actual, .. }) => {
                debug!(component = "chain", event = "repaired_by_peer", head = actual);
            }
            Err(e) => return Err(e),
        }
        state.view.clear();
        state.last_seen = 0;
        Ok(())
    }

    /// Appends `pending` as one block, retrying lost races.
    async fn append_pending(
        &self,
        state: &mut SyncState,
        pending: Vec<Intent>,
    ) -> Result<Option<u64>, ChainError> {
        let mut attempts = 0usize;
        loop {
            let fresh: Vec<Intent> = pending
                .iter()
                .filter(|i| state.view.get(&i.service).map(|(d, _)| d) != Some(i.desired))
                .cloned()
                .collect();
            if fresh.is_empty() {
                return Ok(None);
            }

            let expected = state.last_seen;
            let block = Block::new(expected + 1, self.cfg.node_id.clone(), fresh);
            let appended = block.clone();
            match self.blocking(move |log| log.append(expected, block)).await {
                Ok(head) => {
                    state.view.apply(&appended);
                    state.last_seen = head;
                    metrics::add_chain_append();
                    metrics::set_chain_height(head);
                    *self.published.lock() = state.view.clone();
                    info!(
                        component = "chain",
                        event = "appended",
                        height = head,
                        intents = appended.intents.len()
                    );
                    return Ok(Some(head));
                }
                Err(ChainError::Conflict { expected, actual }) => {
                    metrics::add_chain_conflict();
                    attempts += 1;
                    debug!(
                        component = "chain",
                        event = "append_conflict",
                        expected,
                        actual,
                        attempt = attempts
                    );
                    if attempts > self.cfg.max_append_retries {
                        warn!(
                            component = "chain",
                            event = "append_deferred",
                            attempts,
                            "append lost every race this tick, retrying next tick"
                        );
                        self.reconciler.restore_pending_intents(pending);
                        return Ok(None);
                    }
                    if let Err(e) = self.catch_up(state).await {
                        self.reconciler.restore_pending_intents(pending);
                        return Err(e);
                    }
                }
                Err(e) => {
                    self.reconciler.restore_pending_intents(pending);
                    return Err(e);
                }
            }
        }
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T, ChainError>
    where
        T: Send + 'static,
        F: FnOnce(&dyn ChainLog) -> Result<T, ChainError> + Send + 'static,
    {
        let log = self.log.clone();
        tokio::task::spawn_blocking(move || f(log.as_ref()))
            .await
            .map_err(|e| ChainError::Io(std::io::Error::other(e)))?
    }
}
