//! Deploy, scale and service termination endpoints.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

use super::controller::{error_response, json_error};
use crate::http::Controller;
use crate::model::InstanceId;
use crate::orchestrator::Orchestrator;

#[derive(Serialize)]
struct Deployed {
    #[serde(rename = "instanceID")]
    instance_id: InstanceId,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ServiceStopped {
    service: String,
    stopped: Vec<InstanceId>,
}

/// Query parameters for scale endpoint.
#[derive(Deserialize)]
struct ScaleQuery {
    to: Option<String>,
}

/// DeployController changes how many instances of a service run.
pub struct DeployController {
    orchestrator: Arc<Orchestrator>,
}

impl DeployController {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self { orchestrator }
    }

    async fn deploy(
        State(orchestrator): State<Arc<Orchestrator>>,
        Path(service): Path<String>,
    ) -> Response {
        match orchestrator.deploy(&service).await {
            Ok(instance_id) => {
                info!(component = "api", event = "deploy", service = %service, instance_id = %instance_id);
                (StatusCode::ACCEPTED, Json(Deployed { instance_id })).into_response()
            }
            Err(e) => error_response(&e),
        }
    }

    async fn terminate(
        State(orchestrator): State<Arc<Orchestrator>>,
        Path(service): Path<String>,
    ) -> Response {
        match orchestrator.terminate_service(&service).await {
            Ok(stopped) => (StatusCode::OK, Json(ServiceStopped { service, stopped })).into_response(),
            Err(e) => error_response(&e),
        }
    }

    async fn scale(
        State(orchestrator): State<Arc<Orchestrator>>,
        Path(service): Path<String>,
        Query(params): Query<ScaleQuery>,
    ) -> Response {
        let to = match params.to.as_deref().map(str::parse::<u32>) {
            Some(Ok(n)) => n,
            Some(Err(_)) => {
                return json_error(StatusCode::BAD_REQUEST, "invalid_query", "invalid 'to' parameter")
            }
            None => {
                return json_error(StatusCode::BAD_REQUEST, "invalid_query", "missing 'to' parameter")
            }
        };

        match orchestrator.scale(&service, to).await {
            Ok(report) => (StatusCode::OK, Json(report)).into_response(),
            Err(e) => error_response(&e),
        }
    }
}

impl Controller for DeployController {
    fn add_route(&self, router: Router) -> Router {
        router
            .route(
                "/deploy/:service",
                post(Self::deploy).with_state(self.orchestrator.clone()),
            )
            .route(
                "/service/:service",
                delete(Self::terminate).with_state(self.orchestrator.clone()),
            )
            .route(
                "/scale/:service",
                post(Self::scale).with_state(self.orchestrator.clone()),
            )
    }
}
