//! Placement policies: given the current load of every available node,
//! decide the order in which placement is attempted.

use rand::seq::SliceRandom;
use rand::thread_rng;

use crate::config::NodeId;

/// Load snapshot for one available node at placement time.
#[derive(Debug, Clone)]
pub struct NodeLoad {
    pub node_id: NodeId,
    pub used: usize,
    pub capacity_max: usize,
}

impl NodeLoad {
    pub fn has_room(&self) -> bool {
        self.used < self.capacity_max
    }
}

/// Orders placement candidates; the fleet tries them front to back and
/// takes the first node that accepts the unit.
pub trait PlacementPolicy: Send + Sync {
    fn order(&self, candidates: &mut Vec<NodeLoad>);
}

/// Shuffle candidates uniformly. Spreads load statistically without
/// any coordination and avoids thundering onto one node after it frees
/// capacity.
pub struct RandomizedFirstFit;

impl PlacementPolicy for RandomizedFirstFit {
    fn order(&self, candidates: &mut Vec<NodeLoad>) {
        candidates.shuffle(&mut thread_rng());
    }
}

/// Deterministic alternative: emptiest node first.
pub struct LeastLoaded;

impl PlacementPolicy for LeastLoaded {
    fn order(&self, candidates: &mut Vec<NodeLoad>) {
        candidates.sort_by_key(|c| c.used);
    }
}
