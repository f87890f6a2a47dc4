// Health probe samples.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProbeResult {
    #[serde(rename = "OK")]
    Ok,
    Timeout,
    Error,
    Unreachable,
}

impl ProbeResult {
    pub fn is_ok(&self) -> bool {
        matches!(self, ProbeResult::Ok)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ProbeResult::Ok => "ok",
            ProbeResult::Timeout => "timeout",
            ProbeResult::Error => "error",
            ProbeResult::Unreachable => "unreachable",
        }
    }
}

/// A single probe observation. Only kept in a short rolling window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthSample {
    #[serde(rename = "instanceID")]
    pub instance_id: super::InstanceId,
    pub timestamp: DateTime<Utc>,
    pub result: ProbeResult,
    pub latency_ms: u64,
}
