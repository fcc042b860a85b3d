use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::NodeId;
use crate::queue::DeviceId;

/// Opaque identifier for one execution unit (sandboxed kernel).
/// Generated by the resident broker when the unit starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UnitId(Uuid);

impl UnitId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for UnitId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for UnitId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl From<UnitId> for DeviceId {
    fn from(id: UnitId) -> Self {
        DeviceId::from_uuid(id.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnitState {
    Starting,
    Running,
    Interrupting,
    Restarting,
    Terminated,
}

impl std::fmt::Display for UnitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UnitState::Starting => write!(f, "starting"),
            UnitState::Running => write!(f, "running"),
            UnitState::Interrupting => write!(f, "interrupting"),
            UnitState::Restarting => write!(f, "restarting"),
            UnitState::Terminated => write!(f, "terminated"),
        }
    }
}

/// Data-plane coordinates for one unit, reported by the resident broker
/// when the unit starts. The key is the shared secret for signing
/// data-plane traffic; the four ports are the unit's channel endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitConnection {
    pub ip: String,
    pub key: String,
    pub shell_port: u16,
    pub stdin_port: u16,
    pub iopub_port: u16,
    pub hb_port: u16,
}

/// One sandboxed execution unit placed on a compute node.
///
/// `node_id` is immutable after placement; a restart keeps the unit id
/// and ports but replaces the connection record.
#[derive(Debug, Clone)]
pub struct ExecutionUnit {
    pub unit_id: UnitId,
    pub node_id: NodeId,
    pub connection: UnitConnection,
    pub state: UnitState,
}
