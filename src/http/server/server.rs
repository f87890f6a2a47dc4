//! HTTP server implementation.

use anyhow::{Context, Result};
use axum::Router;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::{Config, ConfigTrait};
use crate::controller::controller::Controller;
use crate::middleware::middleware::Middleware;

pub const DEFAULT_NAME: &str = "meshd";
pub const DEFAULT_PORT: &str = "8030";

/// Server trait for HTTP server operations.
#[async_trait::async_trait]
pub trait Server: Send + Sync {
    /// Serves until the shutdown token is cancelled.
    async fn listen_and_serve(&self) -> Result<()>;
}

/// HTTP server implementation.
pub struct HttpServer {
    shutdown_token: CancellationToken,
    config: Config,
    router: Router,
}

impl HttpServer {
    /// Creates a new HTTP server.
    pub fn new(
        shutdown_token: CancellationToken,
        config: Config,
        controllers: Vec<Box<dyn Controller>>,
        middlewares: Vec<Box<dyn Middleware>>,
    ) -> Result<Arc<Self>> {
        let router = Self::build_router(controllers);
        let router = Self::merge_middlewares(router, middlewares);

        Ok(Arc::new(Self {
            shutdown_token,
            config,
            router,
        }))
    }

    /// The composed router, for in-process requests.
    pub fn router(&self) -> Router {
        self.router.clone()
    }

    /// Address the server binds, from the `api` config section.
    pub fn addr(&self) -> Result<SocketAddr> {
        let port = self
            .config
            .api()
            .and_then(|api| api.port.as_deref())
            .unwrap_or(DEFAULT_PORT);
        let port = port.trim_start_matches(':');

        format!("0.0.0.0:{port}")
            .parse()
            .with_context(|| format!("failed to parse server address from port {port:?}"))
    }

    /// Starts the HTTP server (async version).
    pub async fn listen_and_serve(&self) -> Result<()> {
        let name = self
            .config
            .api()
            .and_then(|api| api.name.as_deref())
            .unwrap_or(DEFAULT_NAME);
        let addr = self.addr()?;

        let listener = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("failed to bind TCP listener on {addr}"))?;

        info!(
            component = "server",
            event = "started",
            name = name,
            addr = %addr,
            "server started"
        );

        let shutdown_token = self.shutdown_token.clone();
        let serve_future =
            axum::serve(listener, self.router.clone()).with_graceful_shutdown(async move {
                shutdown_token.cancelled().await;
            });

        if let Err(e) = serve_future.await {
            error!(
                component = "server",
                event = "listen_and_serve_failed",
                name = name,
                addr = %addr,
                error = %e,
                "server failed to listen and serve"
            );
            return Err(e.into());
        }

        info!(
            component = "server",
            event = "stopped",
            name = name,
            addr = %addr,
            "server stopped"
        );

        Ok(())
    }

    /// Builds the router with all controllers.
    fn build_router(controllers: Vec<Box<dyn Controller>>) -> Router {
        controllers
            .iter()
            .fold(Router::new(), |router, controller| controller.add_route(router))
    }

    /// Merges middlewares into the router.
    fn merge_middlewares(router: Router, middlewares: Vec<Box<dyn Middleware>>) -> Router {
        // Last middleware wraps first.
        middlewares
            .iter()
            .rev()
            .fold(router, |router, middleware| middleware.apply(router))
    }
}

#[async_trait::async_trait]
impl Server for HttpServer {
    async fn listen_and_serve(&self) -> Result<()> {
        HttpServer::listen_and_serve(self).await
    }
}
