// Middleware interface for the API router.

use axum::Router;

/// Wraps the whole router in a layer.
///
/// The server applies middlewares in reverse order, so the first one in the
/// list ends up outermost.
pub trait Middleware: Send + Sync {
    fn apply(&self, router: Router) -> Router;
}
