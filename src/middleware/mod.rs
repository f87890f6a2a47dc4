// HTTP middlewares applied around every controller route.

pub mod middleware;
pub mod trace_middleware;

pub use middleware::Middleware;
pub use trace_middleware::{TimeoutMiddleware, TraceMiddleware};
