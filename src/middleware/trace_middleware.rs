//! Request tracing and timeout layers.

use axum::Router;
use std::time::Duration;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tracing::Level;

use super::middleware::Middleware;

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Opens a span per request and logs the response status and latency.
pub struct TraceMiddleware;

impl Middleware for TraceMiddleware {
    fn apply(&self, router: Router) -> Router {
        router.layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::DEBUG))
                .on_response(DefaultOnResponse::new().level(Level::DEBUG)),
        )
    }
}

/// Answers 408 when a handler runs longer than the timeout.
///
/// Scale and deploy calls wait for spawn checks, so the timeout must exceed
/// the supervisor's spawn check window.
pub struct TimeoutMiddleware {
    timeout: Duration,
}

impl TimeoutMiddleware {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for TimeoutMiddleware {
    fn default() -> Self {
        Self::new(DEFAULT_REQUEST_TIMEOUT)
    }
}

impl Middleware for TimeoutMiddleware {
    fn apply(&self, router: Router) -> Router {
        router.layer(TimeoutLayer::new(self.timeout))
    }
}
