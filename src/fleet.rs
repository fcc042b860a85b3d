//! Fleet-wide orchestration: node registry, unit placement, liveness
//! watchdogs, and the global unit index.
//!
//! The manager owns one [`NodeController`] per registered node and a
//! global map from unit id to the node hosting it. Per-unit operations
//! resolve through that index and delegate to the owning controller;
//! placement snapshots the load of every available node and walks the
//! candidates in policy order.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::bootstrap::Launcher;
use crate::config::{FleetConfig, NodeConfig, NodeId};
use crate::controller::NodeController;
use crate::error::{FleetError, Result};
use crate::heartbeat::Liveness;
use crate::placement::{NodeLoad, PlacementPolicy, RandomizedFirstFit};
use crate::unit::{ExecutionUnit, UnitConnection, UnitId};

pub struct FleetManager {
    config: FleetConfig,
    launcher: Arc<dyn Launcher>,
    policy: Box<dyn PlacementPolicy>,
    nodes: RwLock<HashMap<NodeId, Arc<NodeController>>>,
    /// Which node hosts each live unit. Shared with the watchdog tasks
    /// so a dead node's units disappear from lookups immediately.
    units: Arc<RwLock<HashMap<UnitId, NodeId>>>,
    token: CancellationToken,
}

impl FleetManager {
    pub fn new(config: FleetConfig, launcher: Arc<dyn Launcher>) -> Self {
        Self {
            config,
            launcher,
            policy: Box::new(RandomizedFirstFit),
            nodes: RwLock::new(HashMap::new()),
            units: Arc::new(RwLock::new(HashMap::new())),
            token: CancellationToken::new(),
        }
    }

    pub fn with_policy(mut self, policy: Box<dyn PlacementPolicy>) -> Self {
        self.policy = policy;
        self
    }

    /// Register a compute node: bootstrap its resident broker and start
    /// a liveness watchdog for it. On bootstrap failure the node is not
    /// registered and the error carries the assigned id for log
    /// correlation.
    pub async fn add_node(&self, node_config: NodeConfig) -> Result<NodeId> {
        let node_id = NodeId::new();
        let controller = Arc::new(
            NodeController::bootstrap(node_id, node_config, &self.config, self.launcher.as_ref())
                .await?,
        );

        self.spawn_watchdog(controller.clone());
        self.nodes.write().await.insert(node_id, controller);
        tracing::info!(node_id = %node_id, "Node registered");
        Ok(node_id)
    }

    fn spawn_watchdog(&self, controller: Arc<NodeController>) {
        let units = self.units.clone();
        let token = self.token.child_token();
        let beat_interval = controller.config().beat_interval;
        tokio::spawn(async move {
            let node_id = controller.node_id();
            let mut ticker = tokio::time::interval(beat_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                // Teardown or a command-time write-off ends the watch.
                if !controller.is_available().await {
                    break;
                }
                match controller.check_liveness().await {
                    Some(Liveness::Suspect) => {
                        tracing::warn!(node_id = %node_id, "Node missed a liveness window");
                    }
                    Some(Liveness::Dead) => {
                        let lost = controller.mark_dead().await;
                        let mut index = units.write().await;
                        for unit_id in &lost {
                            index.remove(unit_id);
                        }
                        break;
                    }
                    _ => {}
                }
            }
        });
    }

    /// Place one execution unit somewhere in the fleet. Nodes that turn
    /// out to be full or unreachable are skipped; a broker that actively
    /// rejects the command fails the placement. `NoCapacity` when every
    /// candidate is exhausted.
    pub async fn start_unit(&self) -> Result<ExecutionUnit> {
        let nodes = self.nodes.read().await.clone();

        let mut candidates = Vec::new();
        let mut by_id = HashMap::new();
        for (node_id, controller) in nodes {
            if !controller.is_available().await {
                continue;
            }
            let load = NodeLoad {
                node_id,
                used: controller.unit_count().await,
                capacity_max: controller.config().capacity_max,
            };
            if load.has_room() {
                candidates.push(load);
                by_id.insert(node_id, controller);
            }
        }
        self.policy.order(&mut candidates);

        for candidate in candidates {
            let controller = match by_id.get(&candidate.node_id) {
                Some(c) => c,
                None => continue,
            };
            match controller.start_unit().await {
                Ok(unit) => {
                    self.units.write().await.insert(unit.unit_id, unit.node_id);
                    if controller.is_available().await {
                        return Ok(unit);
                    }
                    // A teardown or write-off raced the placement and
                    // already drained this unit; the index entry must
                    // not outlive it.
                    self.units.write().await.remove(&unit.unit_id);
                    tracing::debug!(node_id = %candidate.node_id, "Placement candidate lost mid-flight");
                }
                Err(
                    e @ (FleetError::CapacityExceeded(_)
                    | FleetError::NodeUnreachable(_)
                    | FleetError::AlreadyRemoved(_)),
                ) => {
                    self.sweep_lost_units(controller).await;
                    tracing::debug!(node_id = %candidate.node_id, error = %e, "Placement candidate skipped");
                }
                Err(e) => return Err(e),
            }
        }
        Err(FleetError::NoCapacity)
    }

    /// Remove units the controller has written off from the global
    /// index. Called after any failed delegate call; a no-op when
    /// nothing was lost.
    async fn sweep_lost_units(&self, controller: &Arc<NodeController>) {
        let lost = controller.take_lost_units().await;
        if lost.is_empty() {
            return;
        }
        let mut index = self.units.write().await;
        for unit_id in lost {
            index.remove(&unit_id);
        }
    }

    async fn controller_for_unit(&self, unit_id: UnitId) -> Result<Arc<NodeController>> {
        let node_id = {
            let index = self.units.read().await;
            *index.get(&unit_id).ok_or(FleetError::UnknownUnit(unit_id))?
        };
        let nodes = self.nodes.read().await;
        nodes
            .get(&node_id)
            .cloned()
            .ok_or(FleetError::UnknownUnit(unit_id))
    }

    pub async fn kill_unit(&self, unit_id: UnitId) -> Result<()> {
        let controller = self.controller_for_unit(unit_id).await?;
        match controller.kill_unit(unit_id).await {
            Ok(()) => {
                self.units.write().await.remove(&unit_id);
                Ok(())
            }
            Err(e) => {
                self.sweep_lost_units(&controller).await;
                Err(e)
            }
        }
    }

    pub async fn interrupt_unit(&self, unit_id: UnitId) -> Result<()> {
        let controller = self.controller_for_unit(unit_id).await?;
        let result = controller.interrupt_unit(unit_id).await;
        if result.is_err() {
            self.sweep_lost_units(&controller).await;
        }
        result
    }

    pub async fn restart_unit(&self, unit_id: UnitId) -> Result<UnitConnection> {
        let controller = self.controller_for_unit(unit_id).await?;
        let result = controller.restart_unit(unit_id).await;
        if result.is_err() {
            self.sweep_lost_units(&controller).await;
        }
        result
    }

    /// Kill every unit on one node, keeping the node in service.
    pub async fn purge_node(&self, node_id: NodeId) -> Result<()> {
        let controller = self
            .nodes
            .read()
            .await
            .get(&node_id)
            .cloned()
            .ok_or(FleetError::UnknownNode(node_id))?;
        match controller.purge().await {
            Ok(purged) => {
                let mut index = self.units.write().await;
                for unit_id in purged {
                    index.remove(&unit_id);
                }
                Ok(())
            }
            Err(e) => {
                // The controller cleared its units even on failure; the
                // index follows suit.
                self.sweep_lost_units(&controller).await;
                Err(e)
            }
        }
    }

    /// Deregister a node and tear it down. Removing a node that is not
    /// registered (or was already removed) is a no-op.
    pub async fn remove_node(&self, node_id: NodeId) -> Result<()> {
        let controller = match self.nodes.write().await.remove(&node_id) {
            Some(controller) => controller,
            None => return Ok(()),
        };
        let cleared = controller.teardown().await?;
        let mut index = self.units.write().await;
        for unit_id in cleared {
            index.remove(&unit_id);
        }
        Ok(())
    }

    /// Tear down every node and stop all watchdogs. Safe to call more
    /// than once.
    pub async fn shutdown(&self) -> Result<()> {
        self.token.cancel();
        let node_ids: Vec<NodeId> = self.nodes.read().await.keys().copied().collect();
        for node_id in node_ids {
            if let Err(e) = self.remove_node(node_id).await {
                tracing::warn!(node_id = %node_id, error = %e, "Node teardown during shutdown failed");
            }
        }
        tracing::info!("Fleet shut down");
        Ok(())
    }

    /// Feed an externally received liveness pulse into the node's
    /// monitor.
    pub async fn record_pulse(&self, node_id: NodeId) -> Result<()> {
        let controller = self
            .nodes
            .read()
            .await
            .get(&node_id)
            .cloned()
            .ok_or(FleetError::UnknownNode(node_id))?;
        controller.pulse().await;
        Ok(())
    }

    pub async fn node_liveness(&self, node_id: NodeId) -> Result<Liveness> {
        let controller = self
            .nodes
            .read()
            .await
            .get(&node_id)
            .cloned()
            .ok_or(FleetError::UnknownNode(node_id))?;
        Ok(controller.liveness().await)
    }

    pub async fn node_ids(&self) -> Vec<NodeId> {
        self.nodes.read().await.keys().copied().collect()
    }

    /// Units currently placed on one node.
    pub async fn unit_ids(&self, node_id: NodeId) -> Result<Vec<UnitId>> {
        let controller = self
            .nodes
            .read()
            .await
            .get(&node_id)
            .cloned()
            .ok_or(FleetError::UnknownNode(node_id))?;
        Ok(controller.unit_ids().await)
    }

    /// Every live unit in the fleet.
    pub async fn all_unit_ids(&self) -> Vec<UnitId> {
        self.units.read().await.keys().copied().collect()
    }

    pub async fn unit(&self, unit_id: UnitId) -> Option<ExecutionUnit> {
        let controller = self.controller_for_unit(unit_id).await.ok()?;
        controller.unit(unit_id).await
    }

    /// Node hosting the given unit, if it is live.
    pub async fn node_for_unit(&self, unit_id: UnitId) -> Option<NodeId> {
        self.units.read().await.get(&unit_id).copied()
    }
}
