//! Instance status and failure reports.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use std::sync::Arc;

use super::controller::error_response;
use crate::http::Controller;
use crate::orchestrator::Orchestrator;

pub const STATUS_PATH: &str = "/status";
pub const FAILURES_PATH: &str = "/failures";

/// StatusController reports what the node runs.
pub struct StatusController {
    orchestrator: Arc<Orchestrator>,
}

impl StatusController {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self { orchestrator }
    }

    async fn all(State(orchestrator): State<Arc<Orchestrator>>) -> Response {
        (StatusCode::OK, Json(orchestrator.status())).into_response()
    }

    async fn service(
        State(orchestrator): State<Arc<Orchestrator>>,
        Path(service): Path<String>,
    ) -> Response {
        match orchestrator.status_of(&service) {
            Ok(instances) => (StatusCode::OK, Json(instances)).into_response(),
            Err(e) => error_response(&e),
        }
    }

    /// Instances that exhausted their restart budget.
    async fn failures(State(orchestrator): State<Arc<Orchestrator>>) -> Response {
        (StatusCode::OK, Json(orchestrator.failures())).into_response()
    }
}

impl Controller for StatusController {
    fn add_route(&self, router: Router) -> Router {
        router
            .route(STATUS_PATH, get(Self::all).with_state(self.orchestrator.clone()))
            .route(
                "/status/:service",
                get(Self::service).with_state(self.orchestrator.clone()),
            )
            .route(
                FAILURES_PATH,
                get(Self::failures).with_state(self.orchestrator.clone()),
            )
    }
}
