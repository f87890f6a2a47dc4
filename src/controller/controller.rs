// HTTP controller trait for route registration.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json, Router,
};
use serde::Serialize;

use crate::orchestrator::OrchestratorError;

/// Trait for adding routes to the HTTP server.
pub trait Controller: Send + Sync {
    /// Adds routes to the router.
    ///
    /// Commonly may be represented as:
    /// ```rust
    /// # use axum::{Router, routing::get};
    /// # async fn handler() -> &'static str { "ok" }
    /// let router: Router<()> = Router::new().route("/path", get(handler));
    /// # let _ = router;
    /// ```
    fn add_route(&self, router: Router) -> Router;
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    error: &'a str,
    message: String,
}

/// Maps a facade error onto a status code and a JSON body.
pub fn error_response(err: &OrchestratorError) -> Response {
    let (status, kind) = match err {
        OrchestratorError::UnknownService(_) => (StatusCode::NOT_FOUND, "unknown_service"),
        OrchestratorError::UnknownInstance(_) => (StatusCode::NOT_FOUND, "unknown_instance"),
        OrchestratorError::AlreadyAtDesired { .. } => (StatusCode::CONFLICT, "already_at_desired"),
        OrchestratorError::SpawnFailed { .. } => (StatusCode::UNPROCESSABLE_ENTITY, "spawn_failed"),
        OrchestratorError::PortPoolExhausted { .. } => {
            (StatusCode::SERVICE_UNAVAILABLE, "port_pool_exhausted")
        }
        OrchestratorError::ShuttingDown => (StatusCode::SERVICE_UNAVAILABLE, "shutting_down"),
        OrchestratorError::DependencyNotReady { .. } => {
            (StatusCode::SERVICE_UNAVAILABLE, "dependency_not_ready")
        }
        OrchestratorError::RestartBudgetExceeded { .. } => {
            (StatusCode::CONFLICT, "restart_budget_exceeded")
        }
        OrchestratorError::CyclicDependency { .. } => {
            (StatusCode::INTERNAL_SERVER_ERROR, "cyclic_dependency")
        }
        OrchestratorError::Manifest(_) => (StatusCode::INTERNAL_SERVER_ERROR, "manifest"),
    };
    json_error(status, kind, err.to_string())
}

pub fn json_error(status: StatusCode, kind: &str, message: impl Into<String>) -> Response {
    (
        status,
        Json(ErrorBody {
            error: kind,
            message: message.into(),
        }),
    )
        .into_response()
}
