use serde::{Deserialize, Serialize};
use serde_json::json;

use hmq_utils::{timestamp_millis, TimestampMillis};

pub type NodeId = u64;

/// Identity of this broker instance, surfaced through the InstanceList
/// introspection payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub name: String,
    start_time: TimestampMillis,
}

impl Default for Node {
    fn default() -> Self {
        Self { id: 1, name: "hmq".into(), start_time: timestamp_millis() }
    }
}

impl Node {
    pub fn new(id: NodeId, name: impl Into<String>) -> Self {
        Self { id, name: name.into(), start_time: timestamp_millis() }
    }

    #[inline]
    pub fn id(&self) -> NodeId {
        self.id
    }

    #[inline]
    pub fn uptime_secs(&self) -> i64 {
        (timestamp_millis() - self.start_time) / 1000
    }

    pub fn to_json(&self) -> serde_json::Value {
        json!({
            "id": self.id,
            "name": self.name,
            "uptime_secs": self.uptime_secs(),
        })
    }
}
