use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque identifier for a registered compute node. Generated by the
/// fleet manager when the node is added; never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeId(Uuid);

impl NodeId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Configuration for one compute node.
///
/// The `account` is a restricted login on `host` that the bootstrap
/// transport can reach without a password; everything the node runs
/// (the resident broker and all execution units) lives under it, so a
/// process-group sweep of that account is a complete cleanup.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Hostname or address of the compute node
    pub host: String,
    /// Restricted account the broker and units run under
    pub account: String,
    /// Command executed remotely to start the resident broker
    pub broker_command: String,
    /// Maximum number of execution units placed on this node
    pub capacity_max: usize,
    /// Resource limits applied to each unit (resource name -> limit)
    pub resource_limits: HashMap<String, u64>,
    /// Expected spacing between liveness pulses
    pub beat_interval: Duration,
    /// Grace period before the first pulse is expected
    pub first_beat: Duration,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            account: String::new(),
            broker_command: "kernelfleet-broker".to_string(),
            capacity_max: 10,
            resource_limits: HashMap::new(),
            beat_interval: Duration::from_secs(3),
            first_beat: Duration::from_secs(5),
        }
    }
}

impl NodeConfig {
    pub fn new(host: impl Into<String>, account: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            account: account.into(),
            ..Default::default()
        }
    }

    pub fn with_capacity(mut self, capacity_max: usize) -> Self {
        self.capacity_max = capacity_max;
        self
    }

    pub fn with_resource_limit(mut self, resource: impl Into<String>, limit: u64) -> Self {
        self.resource_limits.insert(resource.into(), limit);
        self
    }
}

/// Parameters for remote broker bootstrap and port discovery.
#[derive(Debug, Clone)]
pub struct BootstrapConfig {
    /// Number of times the broker's output channel is polled for the port line
    pub attempts: u32,
    /// Spacing between polling attempts
    pub poll_delay: Duration,
}

impl Default for BootstrapConfig {
    fn default() -> Self {
        Self {
            attempts: 10,
            poll_delay: Duration::from_secs(2),
        }
    }
}

/// Fleet-wide settings shared by all node controllers.
#[derive(Debug, Clone)]
pub struct FleetConfig {
    pub bootstrap: BootstrapConfig,
    /// Bound on every control-channel request; an expired timeout is
    /// reported as the node being unreachable, never as a hang
    pub command_timeout: Duration,
    /// A liveness window is `beat_interval * beat_multiplier`
    pub beat_multiplier: u32,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            bootstrap: BootstrapConfig::default(),
            command_timeout: Duration::from_secs(10),
            beat_multiplier: 2,
        }
    }
}
