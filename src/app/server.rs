// HTTP server for the orchestrator application.

use anyhow::Result;
use axum::Router;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::chain::ChainSynchronizer;
use crate::config::Config;
use crate::controller;
use crate::http::{Controller, Middleware};
use crate::liveness;
use crate::middleware::{TimeoutMiddleware, TraceMiddleware};
use crate::orchestrator::Orchestrator;

/// API server with its controllers and middlewares wired in.
pub struct HttpServer {
    server: Arc<crate::http::HttpServer>,
    is_server_alive: Arc<AtomicBool>,
}

impl HttpServer {
    pub fn new(
        ctx: CancellationToken,
        cfg: Config,
        orchestrator: Arc<Orchestrator>,
        synchronizer: Option<Arc<ChainSynchronizer>>,
        probe: Arc<liveness::Probe>,
    ) -> Result<Self> {
        let controllers = Self::controllers(orchestrator, synchronizer, probe);
        let server = crate::http::HttpServer::new(ctx, cfg, controllers, Self::middlewares())?;

        Ok(Self {
            server,
            is_server_alive: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Returns true while the listener is serving.
    pub fn is_alive(&self) -> bool {
        self.is_server_alive.load(Ordering::Relaxed)
    }

    pub fn router(&self) -> Router {
        self.server.router()
    }

    /// Serves until cancelled.
    pub async fn listen_and_serve(&self) -> Result<()> {
        self.is_server_alive.store(true, Ordering::Relaxed);
        let result = self.server.listen_and_serve().await;
        self.is_server_alive.store(false, Ordering::Relaxed);
        result
    }

    fn controllers(
        orchestrator: Arc<Orchestrator>,
        synchronizer: Option<Arc<ChainSynchronizer>>,
        probe: Arc<liveness::Probe>,
    ) -> Vec<Box<dyn Controller>> {
        vec![
            // Healthcheck probe endpoint
            Box::new(controller::LivenessProbeController::new(probe)),
            // Metrics endpoint
            Box::new(controller::PrometheusMetricsController::new(orchestrator.clone())),
            // Instance table and failure reports
            Box::new(controller::StatusController::new(orchestrator.clone())),
            // Deploy, scale and stop services
            Box::new(controller::DeployController::new(orchestrator.clone())),
            // Stop single instances, read their probe samples
            Box::new(controller::InstanceController::new(orchestrator)),
            // Mesh-wide intents
            Box::new(controller::ChainController::new(synchronizer)),
        ]
    }

    /// Returns the request middlewares, first one outermost.
    fn middlewares() -> Vec<Box<dyn Middleware>> {
        vec![
            Box::new(TraceMiddleware),
            Box::new(TimeoutMiddleware::default()),
        ]
    }
}
