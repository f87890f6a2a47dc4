//! Single instance endpoints.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get},
    Json, Router,
};
use serde::Serialize;
use std::sync::Arc;

use super::controller::error_response;
use crate::http::Controller;
use crate::model::{HealthSample, InstanceId};
use crate::orchestrator::Orchestrator;

#[derive(Serialize)]
struct Terminated {
    #[serde(rename = "instanceID")]
    instance_id: InstanceId,
    terminated: bool,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Health {
    #[serde(rename = "instanceID")]
    instance_id: InstanceId,
    samples: Vec<HealthSample>,
}

pub struct InstanceController {
    orchestrator: Arc<Orchestrator>,
}

impl InstanceController {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self { orchestrator }
    }

    async fn terminate(
        State(orchestrator): State<Arc<Orchestrator>>,
        Path(id): Path<String>,
    ) -> Response {
        let instance_id = InstanceId::from(id);
        match orchestrator.terminate_instance(&instance_id).await {
            Ok(()) => (
                StatusCode::OK,
                Json(Terminated {
                    instance_id,
                    terminated: true,
                }),
            )
                .into_response(),
            Err(e) => error_response(&e),
        }
    }

    async fn health(
        State(orchestrator): State<Arc<Orchestrator>>,
        Path(id): Path<String>,
    ) -> Response {
        let instance_id = InstanceId::from(id);
        match orchestrator.samples(&instance_id) {
            Ok(samples) => (
                StatusCode::OK,
                Json(Health {
                    instance_id,
                    samples,
                }),
            )
                .into_response(),
            Err(e) => error_response(&e),
        }
    }
}

impl Controller for InstanceController {
    fn add_route(&self, router: Router) -> Router {
        router
            .route(
                "/instance/:id",
                delete(Self::terminate).with_state(self.orchestrator.clone()),
            )
            .route(
                "/instance/:id/health",
                get(Self::health).with_state(self.orchestrator.clone()),
            )
    }
}
