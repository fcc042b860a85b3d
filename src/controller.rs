//! Per-node control: one `NodeController` owns one compute node's
//! resident broker, its control channel, and the set of units placed on
//! the node.
//!
//! All command-issuing operations take the ops mutex, so commands to one
//! node are serialized end to end: the broker never sees interleaved
//! requests and capacity accounting cannot race with unit creation. The
//! heartbeat monitor sits behind its own lock so liveness checks are
//! never blocked by an in-flight command.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::Mutex;

use crate::bootstrap::{discover_port, BrokerProcess, Launcher};
use crate::channel::ControlChannel;
use crate::config::{FleetConfig, NodeConfig, NodeId};
use crate::error::{FleetError, Result};
use crate::heartbeat::{HeartbeatMonitor, Liveness};
use crate::unit::{ExecutionUnit, UnitConnection, UnitId, UnitState};

/// Why a controller no longer accepts commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Defunct {
    /// Torn down by an operator; reported as `AlreadyRemoved`
    Removed,
    /// Declared dead by the liveness watchdog; reported as unreachable
    Dead,
}

struct Ops {
    channel: Option<Arc<ControlChannel>>,
    broker: Option<Box<dyn BrokerProcess>>,
    units: HashMap<UnitId, ExecutionUnit>,
    defunct: Option<Defunct>,
    /// Unit ids written off but not yet swept out of the fleet's global
    /// index
    lost: Vec<UnitId>,
}

pub struct NodeController {
    node_id: NodeId,
    config: NodeConfig,
    /// Set once by the first teardown; later teardowns are no-ops
    torn_down: AtomicBool,
    ops: Mutex<Ops>,
    monitor: Mutex<HeartbeatMonitor>,
}

impl NodeController {
    /// Launch the node's resident broker, discover its control port,
    /// connect, and verify the handshake. Any failure terminates the
    /// broker (if it got that far) and surfaces as `BootstrapFailed`;
    /// a controller that exists has a working channel behind it.
    pub async fn bootstrap(
        node_id: NodeId,
        config: NodeConfig,
        fleet: &FleetConfig,
        launcher: &dyn Launcher,
    ) -> Result<Self> {
        let failed = |msg: String| FleetError::BootstrapFailed(node_id, msg);

        let mut broker = launcher
            .launch(&config)
            .await
            .map_err(|e| failed(format!("broker launch: {e}")))?;

        let port = match discover_port(broker.as_mut(), &fleet.bootstrap).await {
            Ok(port) => port,
            Err(e) => {
                if let Err(term) = broker.terminate().await {
                    tracing::warn!(node_id = %node_id, error = %term, "Broker cleanup after failed bootstrap");
                }
                return Err(failed(format!("port discovery: {e}")));
            }
        };

        let peer = format!("{}:{}", config.host, port);
        let channel = match ControlChannel::connect(&peer, fleet.command_timeout).await {
            Ok(channel) => channel,
            Err(e) => {
                if let Err(term) = broker.terminate().await {
                    tracing::warn!(node_id = %node_id, error = %term, "Broker cleanup after failed bootstrap");
                }
                return Err(failed(e.to_string()));
            }
        };
        if let Err(e) = channel.handshake().await {
            if let Err(term) = broker.terminate().await {
                tracing::warn!(node_id = %node_id, error = %term, "Broker cleanup after failed bootstrap");
            }
            return Err(failed(format!("handshake: {e}")));
        }

        tracing::info!(node_id = %node_id, peer = %peer, "Node bootstrapped");
        let monitor = HeartbeatMonitor::new(config.beat_interval, config.first_beat, Instant::now())
            .with_multiplier(fleet.beat_multiplier);
        Ok(Self {
            node_id,
            config,
            torn_down: AtomicBool::new(false),
            ops: Mutex::new(Ops {
                channel: Some(Arc::new(channel)),
                broker: Some(broker),
                units: HashMap::new(),
                defunct: None,
                lost: Vec::new(),
            }),
            monitor: Mutex::new(monitor),
        })
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    fn check_usable(&self, ops: &Ops) -> Result<Arc<ControlChannel>> {
        match ops.defunct {
            Some(Defunct::Removed) => Err(FleetError::AlreadyRemoved(self.node_id)),
            Some(Defunct::Dead) => Err(FleetError::NodeUnreachable(format!(
                "node {} declared dead",
                self.node_id
            ))),
            None => ops
                .channel
                .clone()
                .ok_or_else(|| FleetError::AlreadyRemoved(self.node_id)),
        }
    }

    /// Write the node off as unreachable: refuse further commands, reap
    /// the broker handle, and move every unit into the lost set for
    /// index cleanup. The heartbeat monitor is forced to Dead so
    /// liveness queries agree.
    async fn write_off_locked(&self, ops: &mut Ops) {
        if ops.defunct.is_none() {
            ops.defunct = Some(Defunct::Dead);
            tracing::error!(node_id = %self.node_id, units = ops.units.len(), "Node written off as unreachable");
        }
        ops.channel = None;
        if let Some(mut broker) = ops.broker.take() {
            if let Err(e) = broker.terminate().await {
                tracing::debug!(node_id = %self.node_id, error = %e, "Broker cleanup for dead node");
            }
        }
        for unit in ops.units.values_mut() {
            unit.state = UnitState::Terminated;
        }
        let drained: Vec<UnitId> = ops.units.drain().map(|(id, _)| id).collect();
        ops.lost.extend(drained);
        self.monitor.lock().await.kill();
    }

    /// Route a failed channel call: a transport failure means the
    /// stream is poisoned and the node is gone, so it is written off on
    /// the spot.
    async fn fail_command<T>(&self, ops: &mut Ops, error: FleetError) -> Result<T> {
        if matches!(error, FleetError::NodeUnreachable(_)) {
            self.write_off_locked(ops).await;
        }
        Err(error)
    }

    /// Unit ids written off since the last call. The fleet sweeps these
    /// out of its global index.
    pub async fn take_lost_units(&self) -> Vec<UnitId> {
        std::mem::take(&mut self.ops.lock().await.lost)
    }

    /// Start one execution unit on this node. Fails with
    /// `CapacityExceeded` before touching the wire if the node is full.
    pub async fn start_unit(&self) -> Result<ExecutionUnit> {
        let mut ops = self.ops.lock().await;
        let channel = self.check_usable(&ops)?;
        if ops.units.len() >= self.config.capacity_max {
            return Err(FleetError::CapacityExceeded(self.node_id));
        }

        let started = match channel.start_unit(self.config.resource_limits.clone()).await {
            Ok(started) => started,
            Err(e) => return self.fail_command(&mut ops, e).await,
        };
        let unit = ExecutionUnit {
            unit_id: started.unit_id,
            node_id: self.node_id,
            connection: started.connection,
            state: UnitState::Running,
        };
        tracing::info!(node_id = %self.node_id, unit_id = %unit.unit_id, "Unit started");
        ops.units.insert(unit.unit_id, unit.clone());
        Ok(unit)
    }

    pub async fn kill_unit(&self, unit_id: UnitId) -> Result<()> {
        let mut ops = self.ops.lock().await;
        let channel = self.check_usable(&ops)?;
        if !ops.units.contains_key(&unit_id) {
            return Err(FleetError::UnknownUnit(unit_id));
        }
        match channel.kill_unit(unit_id).await {
            Ok(()) => {
                ops.units.remove(&unit_id);
                tracing::info!(node_id = %self.node_id, unit_id = %unit_id, "Unit killed");
                Ok(())
            }
            Err(e) => self.fail_command(&mut ops, e).await,
        }
    }

    pub async fn interrupt_unit(&self, unit_id: UnitId) -> Result<()> {
        let mut ops = self.ops.lock().await;
        let channel = self.check_usable(&ops)?;
        if !ops.units.contains_key(&unit_id) {
            return Err(FleetError::UnknownUnit(unit_id));
        }
        if let Some(unit) = ops.units.get_mut(&unit_id) {
            unit.state = UnitState::Interrupting;
        }
        let result = channel.interrupt_unit(unit_id).await;
        if let Some(unit) = ops.units.get_mut(&unit_id) {
            unit.state = UnitState::Running;
        }
        match result {
            Ok(()) => Ok(()),
            Err(e) => self.fail_command(&mut ops, e).await,
        }
    }

    /// Restart a unit in place: same unit id, same ports, fresh
    /// connection record. Returns the reissued connection.
    pub async fn restart_unit(&self, unit_id: UnitId) -> Result<UnitConnection> {
        let mut ops = self.ops.lock().await;
        let channel = self.check_usable(&ops)?;
        if !ops.units.contains_key(&unit_id) {
            return Err(FleetError::UnknownUnit(unit_id));
        }
        if let Some(unit) = ops.units.get_mut(&unit_id) {
            unit.state = UnitState::Restarting;
        }
        match channel.restart_unit(unit_id).await {
            Ok(connection) => {
                if let Some(unit) = ops.units.get_mut(&unit_id) {
                    unit.connection = connection.clone();
                    unit.state = UnitState::Running;
                }
                tracing::info!(node_id = %self.node_id, unit_id = %unit_id, "Unit restarted");
                Ok(connection)
            }
            Err(e) => {
                if let Some(unit) = ops.units.get_mut(&unit_id) {
                    unit.state = UnitState::Running;
                }
                self.fail_command(&mut ops, e).await
            }
        }
    }

    /// Kill every unit on the node. Local accounting is cleared even
    /// when the broker reports a failure, so capacity is reclaimed
    /// unconditionally; the command error still propagates and the
    /// cleared ids stay retrievable via `take_lost_units` so the
    /// fleet's index drops them too.
    pub async fn purge(&self) -> Result<Vec<UnitId>> {
        let mut ops = self.ops.lock().await;
        let channel = self.check_usable(&ops)?;
        let result = channel.purge_all().await;
        let cleared: Vec<UnitId> = ops.units.drain().map(|(id, _)| id).collect();
        tracing::info!(node_id = %self.node_id, count = cleared.len(), "Node purged");
        match result {
            Ok(_) => Ok(cleared),
            Err(e) => {
                ops.lost.extend(cleared);
                self.fail_command(&mut ops, e).await
            }
        }
    }

    /// Remove the node from service: best-effort purge, terminate the
    /// broker, refuse all further commands. Idempotent; the second and
    /// later calls return an empty list without touching the node.
    pub async fn teardown(&self) -> Result<Vec<UnitId>> {
        if self.torn_down.swap(true, Ordering::SeqCst) {
            return Ok(Vec::new());
        }
        let mut ops = self.ops.lock().await;

        if ops.defunct.is_none() {
            if let Some(channel) = ops.channel.as_ref() {
                if let Err(e) = channel.purge_all().await {
                    tracing::warn!(node_id = %self.node_id, error = %e, "Purge during teardown failed");
                }
            }
        }
        ops.defunct = Some(Defunct::Removed);
        ops.channel = None;
        if let Some(mut broker) = ops.broker.take() {
            if let Err(e) = broker.terminate().await {
                tracing::warn!(node_id = %self.node_id, error = %e, "Broker termination failed");
            }
        }
        let mut cleared: Vec<UnitId> = ops.units.drain().map(|(id, _)| id).collect();
        cleared.extend(std::mem::take(&mut ops.lost));
        tracing::info!(node_id = %self.node_id, units = cleared.len(), "Node torn down");
        Ok(cleared)
    }

    /// Declare the node dead (missed liveness windows or a command-time
    /// transport failure). No further communication is attempted; the
    /// written-off unit ids are returned for index cleanup.
    pub async fn mark_dead(&self) -> Vec<UnitId> {
        let mut ops = self.ops.lock().await;
        self.write_off_locked(&mut ops).await;
        std::mem::take(&mut ops.lost)
    }

    pub async fn pulse(&self) {
        self.monitor.lock().await.pulse(Instant::now());
    }

    /// Advance the liveness state machine; returns a transition if one
    /// occurred.
    pub async fn check_liveness(&self) -> Option<Liveness> {
        self.monitor.lock().await.check(Instant::now())
    }

    pub async fn liveness(&self) -> Liveness {
        self.monitor.lock().await.state()
    }

    pub async fn unit(&self, unit_id: UnitId) -> Option<ExecutionUnit> {
        self.ops.lock().await.units.get(&unit_id).cloned()
    }

    pub async fn unit_count(&self) -> usize {
        self.ops.lock().await.units.len()
    }

    pub async fn unit_ids(&self) -> Vec<UnitId> {
        self.ops.lock().await.units.keys().copied().collect()
    }

    /// True while the node can accept placement attempts.
    pub async fn is_available(&self) -> bool {
        self.ops.lock().await.defunct.is_none()
    }
}
