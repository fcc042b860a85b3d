use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Logical session key supplied by the submitting layer. Work for one
/// session sticks to the device that first claims it (session affinity).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(String);

impl SessionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Identity of a claimer: the execution unit (or node assignment) that
/// polls the queue. Opaque to the queue itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceId(Uuid);

impl DeviceId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }
}

impl Default for DeviceId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ItemId(Uuid);

impl ItemId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ItemId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ItemId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// One pending submission bound to a session.
///
/// A claim is final: once `claimed` is true and `device` is set, both
/// are immutable for the lifetime of the item. Re-submission creates a
/// new item.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkItem {
    pub item_id: ItemId,
    pub session_id: SessionId,
    pub payload: Value,
    pub device: Option<DeviceId>,
    pub claimed: bool,
    pub timestamp: DateTime<Utc>,
}

impl WorkItem {
    pub fn new(session_id: SessionId, payload: Value) -> Self {
        Self {
            item_id: ItemId::new(),
            session_id,
            payload,
            device: None,
            claimed: false,
            timestamp: Utc::now(),
        }
    }
}

/// One unit of produced output, appended by execution units and polled
/// incrementally by the submitting layer. `sequence` is monotonic per
/// session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub session_id: SessionId,
    pub sequence: u64,
    pub body: Value,
}
