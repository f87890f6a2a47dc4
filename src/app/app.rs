// Orchestrator node application.

use anyhow::{Context, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::chain::{ChainSynchronizer, FileChainLog};
use crate::config::{Config, ConfigTrait};
use crate::health::NetProber;
use crate::liveness;
use crate::manifest::Manifest;
use crate::orchestrator::Orchestrator;
use crate::registry::dumper::reap_orphans;
use crate::registry::RegistryDumper;
use crate::shutdown::GracefulShutdown;

use super::server::HttpServer;

const DEFAULT_SNAPSHOT_INTERVAL: Duration = Duration::from_secs(10);

/// One orchestrator node: the facade plus its background tasks and API.
pub struct App {
    cfg: Config,
    shutdown_token: CancellationToken,
    orchestrator: Arc<Orchestrator>,
    synchronizer: Option<Arc<ChainSynchronizer>>,
    dumper: Option<Arc<RegistryDumper>>,
    server: Arc<HttpServer>,
    background: parking_lot::Mutex<Vec<JoinHandle<()>>>,
    had_failures: AtomicBool,
}

impl App {
    /// Wires the node together. Nothing is spawned yet.
    pub fn new(
        shutdown_token: CancellationToken,
        cfg: Config,
        manifest: Manifest,
        probe: Arc<liveness::Probe>,
    ) -> Result<Self> {
        let orchestrator = Arc::new(Orchestrator::new(&cfg, manifest, Arc::new(NetProber::new())));

        let chain = cfg.chain();
        let synchronizer = chain.enabled.then(|| {
            let log = Arc::new(FileChainLog::new(chain.path.clone()));
            Arc::new(ChainSynchronizer::new(chain.clone(), log, orchestrator.clone()))
        });

        let dumper = cfg
            .registry()
            .and_then(|r| r.snapshot_path.clone())
            .map(|path| {
                Arc::new(RegistryDumper::new(
                    path,
                    chain.node_id.clone(),
                    orchestrator.registry().clone(),
                ))
            });

        let server = Arc::new(HttpServer::new(
            shutdown_token.clone(),
            cfg.clone(),
            orchestrator.clone(),
            synchronizer.clone(),
            probe,
        )?);

        Ok(Self {
            cfg,
            shutdown_token,
            orchestrator,
            synchronizer,
            dumper,
            server,
            background: parking_lot::Mutex::new(Vec::new()),
            had_failures: AtomicBool::new(false),
        })
    }

    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }

    /// The API router, for in-process requests.
    pub fn router(&self) -> axum::Router {
        self.server.router()
    }

    /// Reaps processes left by a previous run, then deploys the manifest.
    pub async fn start(&self) -> Result<()> {
        self.reap_previous_run();

        let started = self
            .orchestrator
            .deploy_all()
            .await
            .context("initial deployment failed")?;

        info!(
            component = "app",
            event = "deployed",
            instances = started.len(),
            services = self.orchestrator.manifest().len(),
            "manifest deployed"
        );
        Ok(())
    }

    /// Starts background tasks and the API server.
    ///
    /// When the server stops, the node is closed and `gsh` is told.
    pub fn serve(self: &Arc<Self>, gsh: GracefulShutdown) {
        {
            let mut background = self.background.lock();
            if let Some(sync) = &self.synchronizer {
                background.push(tokio::spawn(sync.clone().run(self.shutdown_token.clone())));
            }
            if let Some(dumper) = &self.dumper {
                let interval = self
                    .cfg
                    .registry()
                    .and_then(|r| r.snapshot_interval)
                    .unwrap_or(DEFAULT_SNAPSHOT_INTERVAL);
                background.push(tokio::spawn(
                    dumper.clone().run(self.shutdown_token.clone(), interval),
                ));
            }
        }

        let app = self.clone();
        tokio::spawn(async move {
            if let Err(e) = app.server.listen_and_serve().await {
                error!(
                    component = "app",
                    scope = "server",
                    event = "serve_failed",
                    error = %e,
                    "server failed to serve"
                );
            }

            app.close().await;
            gsh.done();
        });

        info!(component = "app", event = "started", "application lifecycle");
    }

    /// Whether any instance was `Failed` when the node closed.
    pub fn had_failures(&self) -> bool {
        self.had_failures.load(Ordering::SeqCst)
    }

    /// Stops background tasks, then every managed instance.
    pub async fn close(&self) {
        self.shutdown_token.cancel();

        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.background.lock());
        for task in tasks {
            if let Err(e) = task.await {
                error!(component = "app", event = "task_join_failed", error = %e);
            }
        }

        if self.orchestrator.has_failures() {
            self.had_failures.store(true, Ordering::SeqCst);
            for report in self.orchestrator.failures() {
                warn!(
                    component = "app",
                    event = "failed_at_shutdown",
                    service = %report.service,
                    instance_id = %report.instance_id,
                    restart_count = report.restart_count,
                    reason = %report.reason
                );
            }
        }

        self.orchestrator.shutdown().await;

        // Nothing runs anymore; leave an empty table for the next start.
        if let Some(dumper) = &self.dumper {
            if let Err(e) = dumper.dump() {
                error!(component = "app", scope = "registry", event = "close_failed", error = %e);
            }
        }

        info!(component = "app", event = "stopped", "application lifecycle");
    }

    fn reap_previous_run(&self) {
        let Some(registry) = self.cfg.registry() else {
            return;
        };
        let (Some(path), true) = (registry.snapshot_path.as_deref(), registry.reap_orphans) else {
            return;
        };

        match RegistryDumper::load(path) {
            Ok(Some(snapshot)) => {
                let reaped = reap_orphans(&snapshot);
                info!(
                    component = "app",
                    event = "previous_run_checked",
                    snapshot_node = %snapshot.node_id,
                    reaped,
                );
            }
            Ok(None) => {}
            Err(e) => warn!(component = "app", event = "snapshot_unreadable", error = %e),
        }
    }
}

impl liveness::Service for App {
    fn is_alive(&self, _timeout: Duration) -> bool {
        if !self.server.is_alive() {
            warn!(
                component = "app",
                scope = "http_server",
                event = "gone_away",
                "http server has gone away"
            );
            return false;
        }
        true
    }
}
