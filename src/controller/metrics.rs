//! Metrics controller.

use axum::{http::StatusCode, response::IntoResponse, routing::get, Router};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use metrics_process::Collector;
use std::sync::{Arc, OnceLock};

use crate::http::Controller;
use crate::orchestrator::Orchestrator;

pub const PROMETHEUS_METRICS_PATH: &str = "/metrics";

/// Global Prometheus handle for rendering metrics.
static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Installs the Prometheus recorder as the global `metrics` recorder.
///
/// Call once, before the runtime starts. Later calls fail.
pub fn init_prometheus_exporter() -> anyhow::Result<()> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| anyhow::anyhow!("failed to install Prometheus recorder: {e}"))?;

    PROMETHEUS_HANDLE
        .set(handle)
        .map_err(|_| anyhow::anyhow!("Prometheus handle already initialized"))?;

    Collector::default().describe();
    crate::metrics::describe();
    Ok(())
}

/// PrometheusMetricsController renders the node's metrics.
///
/// Instance and process gauges are refreshed on every scrape.
#[derive(Clone)]
pub struct PrometheusMetricsController {
    orchestrator: Arc<Orchestrator>,
    collector: Arc<Collector>,
}

impl PrometheusMetricsController {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self {
            orchestrator,
            collector: Arc::new(Collector::default()),
        }
    }

    async fn get_metrics(&self) -> impl IntoResponse {
        let Some(handle) = PROMETHEUS_HANDLE.get() else {
            return (
                StatusCode::SERVICE_UNAVAILABLE,
                [("content-type", "text/plain; charset=utf-8")],
                "# metrics recorder is not installed\n".to_string(),
            );
        };

        self.orchestrator.publish_metrics();
        self.collector.collect();
        (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            handle.render(),
        )
    }
}

impl Controller for PrometheusMetricsController {
    fn add_route(&self, router: Router) -> Router {
        let controller = self.clone();
        router.route(
            PROMETHEUS_METRICS_PATH,
            get(move || {
                let controller = controller.clone();
                async move { controller.get_metrics().await }
            }),
        )
    }
}
