//! kernelfleet: orchestration for sandboxed code-execution kernels on a
//! fleet of untrusted compute nodes.
//!
//! A trusted orchestrator registers compute nodes, bootstraps one
//! resident broker per node over ssh, and places execution units
//! (sandboxed kernels) across the fleet. Work reaches the units through
//! a session-sticky queue; liveness is tracked per node and dead nodes
//! are written off without further communication.

pub mod bootstrap;
pub mod channel;
pub mod config;
pub mod controller;
pub mod error;
pub mod fleet;
pub mod heartbeat;
pub mod placement;
pub mod queue;
pub mod shutdown;
pub mod unit;

pub use config::{FleetConfig, NodeConfig, NodeId};
pub use error::{FleetError, Result};
pub use fleet::FleetManager;
pub use queue::WorkQueue;
pub use unit::{ExecutionUnit, UnitConnection, UnitId};
