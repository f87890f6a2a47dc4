// Health probes: descriptor parsing and the network prober.

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::Empty;
use std::net::{Ipv4Addr, SocketAddr};
use tokio::net::TcpStream;

use crate::http::client::{create_client, HyperClient};
use crate::model::ProbeResult;

const LOOPBACK: Ipv4Addr = Ipv4Addr::LOCALHOST;

/// What a probe talks to, parsed from a manifest `health_check` descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeTarget {
    /// TCP connect to the instance port.
    Tcp,
    /// HTTP GET of a path on the instance port.
    HttpPath(String),
    /// HTTP GET of a full URL; `{port}` is substituted.
    HttpUrl(String),
}

impl ProbeTarget {
    pub fn parse(descriptor: &str) -> Result<Self, ProbeError> {
        let d = descriptor.trim();
        if d.eq_ignore_ascii_case("tcp") {
            Ok(Self::Tcp)
        } else if d.starts_with('/') {
            Ok(Self::HttpPath(d.to_string()))
        } else if d.starts_with("http://") {
            Ok(Self::HttpUrl(d.to_string()))
        } else {
            Err(ProbeError::InvalidDescriptor(descriptor.to_string()))
        }
    }

    /// The URL an HTTP probe requests for an instance on `port`.
    pub fn url(&self, port: u16) -> Option<String> {
        match self {
            Self::Tcp => None,
            Self::HttpPath(path) => Some(format!("http://{LOOPBACK}:{port}{path}")),
            Self::HttpUrl(url) => Some(url.replace("{port}", &port.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProbeError {
    #[error("invalid health check descriptor {0:?}")]
    InvalidDescriptor(String),
    #[error("probe timed out")]
    Timeout,
    #[error("unreachable: {0}")]
    Unreachable(String),
    #[error("unhealthy response status {0}")]
    Status(u16),
    #[error("probe error: {0}")]
    Request(String),
}

impl ProbeError {
    /// Sample classification of this failure.
    pub fn result(&self) -> ProbeResult {
        match self {
            Self::Timeout => ProbeResult::Timeout,
            Self::Unreachable(_) => ProbeResult::Unreachable,
            Self::InvalidDescriptor(_) | Self::Status(_) | Self::Request(_) => ProbeResult::Error,
        }
    }
}

/// Checks one instance once. Callers bound each call with their own timeout.
#[async_trait]
pub trait Prober: Send + Sync {
    async fn probe(&self, target: &ProbeTarget, port: u16) -> Result<(), ProbeError>;
}

/// Probes over the loopback network: TCP connect or HTTP GET.
pub struct NetProber {
    client: HyperClient,
}

impl NetProber {
    pub fn new() -> Self {
        Self {
            client: create_client(),
        }
    }

    async fn probe_tcp(&self, port: u16) -> Result<(), ProbeError> {
        TcpStream::connect(SocketAddr::from((LOOPBACK, port)))
            .await
            .map(|_| ())
            .map_err(|e| ProbeError::Unreachable(e.to_string()))
    }

    async fn probe_http(&self, url: &str) -> Result<(), ProbeError> {
        let uri = url
            .parse::<hyper::Uri>()
            .map_err(|e| ProbeError::Request(e.to_string()))?;
        let req = hyper::Request::get(uri)
            .header(hyper::header::USER_AGENT, "meshd-probe")
            .body(Empty::<Bytes>::new())
            .map_err(|e| ProbeError::Request(e.to_string()))?;

        let resp = self.client.request(req).await.map_err(|e| {
            if e.is_connect() {
                ProbeError::Unreachable(e.to_string())
            } else {
                ProbeError::Request(e.to_string())
            }
        })?;

        let status = resp.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(ProbeError::Status(status.as_u16()))
        }
    }
}

impl Default for NetProber {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Prober for NetProber {
    async fn probe(&self, target: &ProbeTarget, port: u16) -> Result<(), ProbeError> {
        match target.url(port) {
            None => self.probe_tcp(port).await,
            Some(url) => self.probe_http(&url).await,
        }
    }
}
