//! Hyper HTTP client used by health probes.
//!
//! Probes only talk plain HTTP/1.1 to loopback, so the pool is small:
//! - Max idle connections per host: 4
//! - Max idle connection duration: 30s
//! - Connection timeout: 1s
//! - TCP_NODELAY: enabled

use bytes::Bytes;
use http_body_util::Empty;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::time::Duration;

/// Connection pool configuration constants.
pub const CONNS_PER_HOST: usize = 4;
pub const MAX_IDLE_CONN_DURATION: Duration = Duration::from_secs(30);
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(1);

pub type HyperClient = Client<HttpConnector, Empty<Bytes>>;

/// Creates the probe client.
///
/// Requests carry no body, responses are read as `Incoming` and dropped
/// after the status line is inspected.
pub fn create_client() -> HyperClient {
    let mut http_connector = HttpConnector::new();
    http_connector.set_nodelay(true);
    http_connector.set_connect_timeout(Some(CONNECT_TIMEOUT));

    Client::builder(TokioExecutor::new())
        .pool_idle_timeout(MAX_IDLE_CONN_DURATION)
        .pool_max_idle_per_host(CONNS_PER_HOST)
        .build(http_connector)
}
