use thiserror::Error;

use crate::config::NodeId;
use crate::unit::UnitId;

#[derive(Error, Debug)]
pub enum FleetError {
    #[error("bootstrap failed for node {0}: {1}")]
    BootstrapFailed(NodeId, String),

    #[error("node {0} is at capacity")]
    CapacityExceeded(NodeId),

    #[error("no node in the fleet has spare capacity")]
    NoCapacity,

    #[error("node unreachable: {0}")]
    NodeUnreachable(String),

    #[error("work queue storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("node already removed: {0}")]
    AlreadyRemoved(NodeId),

    #[error("unknown unit: {0}")]
    UnknownUnit(UnitId),

    #[error("unknown node: {0}")]
    UnknownNode(NodeId),

    #[error("command rejected by resident broker: {0}")]
    CommandFailed(String),
}

impl FleetError {
    /// True for failures worth retrying with backoff. Everything else is
    /// either fatal to the target or a caller error.
    pub fn is_transient(&self) -> bool {
        matches!(self, FleetError::StorageUnavailable(_))
    }
}

pub type Result<T> = std::result::Result<T, FleetError>;
