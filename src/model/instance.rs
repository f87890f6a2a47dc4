// Managed service instances and their lifecycle states.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;

static SEQ: AtomicU64 = AtomicU64::new(0);
static NODE_SALT: OnceLock<String> = OnceLock::new();

/// Globally unique identifier of one instance. Never reused.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceId(String);

impl InstanceId {
    /// Generates a fresh id for the given service.
    ///
    /// The id combines a per-process random salt, the wall clock in millis and
    /// a process-wide sequence, so ids never repeat within a process and do not
    /// collide across nodes.
    pub fn generate(service: &str) -> Self {
        let salt = NODE_SALT.get_or_init(|| hex::encode(rand::random::<[u8; 3]>()));
        let seq = SEQ.fetch_add(1, Ordering::Relaxed);
        let millis = Utc::now().timestamp_millis();
        Self(format!("{service}-{salt}{millis:x}-{seq}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for InstanceId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for InstanceId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InstanceStatus {
    Pending,
    Starting,
    Running,
    Unhealthy,
    Restarting,
    Terminated,
    Failed,
}

impl InstanceStatus {
    pub const ALL: [InstanceStatus; 7] = [
        InstanceStatus::Pending,
        InstanceStatus::Starting,
        InstanceStatus::Running,
        InstanceStatus::Unhealthy,
        InstanceStatus::Restarting,
        InstanceStatus::Terminated,
        InstanceStatus::Failed,
    ];

    /// Whether the instance still occupies a replica slot.
    pub fn is_live(&self) -> bool {
        !matches!(self, InstanceStatus::Terminated | InstanceStatus::Failed)
    }

    /// Whether the instance counts as up for drift repair.
    pub fn is_up(&self) -> bool {
        matches!(self, InstanceStatus::Starting | InstanceStatus::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceStatus::Pending => "Pending",
            InstanceStatus::Starting => "Starting",
            InstanceStatus::Running => "Running",
            InstanceStatus::Unhealthy => "Unhealthy",
            InstanceStatus::Restarting => "Restarting",
            InstanceStatus::Terminated => "Terminated",
            InstanceStatus::Failed => "Failed",
        }
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One running (or starting/stopping/dead) copy of a manifest entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instance {
    pub id: InstanceId,
    pub service: String,
    pub port: u16,
    pub status: InstanceStatus,
    pub started_at: DateTime<Utc>,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    pub restart_count: u32,
    pub pid: Option<u32>,
}

impl Instance {
    pub fn new(id: InstanceId, service: impl Into<String>, port: u16, pid: Option<u32>) -> Self {
        Self {
            id,
            service: service.into(),
            port,
            status: InstanceStatus::Pending,
            started_at: Utc::now(),
            last_heartbeat_at: None,
            restart_count: 0,
            pid,
        }
    }

    pub fn uptime_seconds(&self, now: DateTime<Utc>) -> u64 {
        (now - self.started_at).num_seconds().max(0) as u64
    }

    pub fn summary(&self, now: DateTime<Utc>) -> InstanceSummary {
        InstanceSummary {
            instance_id: self.id.clone(),
            service_name: self.service.clone(),
            port: self.port,
            status: self.status,
            uptime_seconds: if self.status.is_live() {
                self.uptime_seconds(now)
            } else {
                0
            },
            restart_count: self.restart_count,
        }
    }
}

/// Public view of an instance exposed by the status API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceSummary {
    #[serde(rename = "instanceID")]
    pub instance_id: InstanceId,
    pub service_name: String,
    pub port: u16,
    pub status: InstanceStatus,
    pub uptime_seconds: u64,
    pub restart_count: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_generated_ids_are_unique() {
        let ids: HashSet<_> = (0..1000).map(|_| InstanceId::generate("api")).collect();
        assert_eq!(ids.len(), 1000);
        assert!(ids.iter().all(|id| id.as_str().starts_with("api-")));
    }

    #[test]
    fn test_summary_serializes_with_api_field_names() {
        let mut inst = Instance::new(InstanceId::from("api-1"), "api", 8001, Some(42));
        inst.status = InstanceStatus::Running;
        inst.restart_count = 2;

        let json = serde_json::to_value(inst.summary(Utc::now())).unwrap();
        assert_eq!(json["instanceID"], "api-1");
        assert_eq!(json["serviceName"], "api");
        assert_eq!(json["port"], 8001);
        assert_eq!(json["status"], "Running");
        assert_eq!(json["restartCount"], 2);
        assert!(json.get("uptimeSeconds").is_some());
    }

    #[test]
    fn test_live_and_up_classification() {
        assert!(InstanceStatus::Unhealthy.is_live());
        assert!(!InstanceStatus::Unhealthy.is_up());
        assert!(InstanceStatus::Starting.is_up());
        assert!(!InstanceStatus::Failed.is_live());
        assert!(!InstanceStatus::Terminated.is_live());
    }
}
