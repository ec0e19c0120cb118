//! Placement Engine - spillover into the earliest open slot
//!
//! # Algorithm
//!
//! 1. Scan the anchor's subtree in ascending `position_number` order and
//!    take the first node with an open child slot.
//! 2. Pick the side: the preferred side if it is open there, else the only
//!    open side, else (both open) the side opposite the fuller leg, Left on
//!    a tie.
//! 3. Claim the slot with the store's conditional write. Losing the race
//!    re-runs the scan, at most `max_attempts` times.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::PlacementConfig;
use crate::core_types::{NodeId, ProspectId};
use crate::error::PowerLineError;
use crate::journal::Journal;
use crate::models::{Position, Side};
use crate::stats::EngineStats;
use crate::store::{Claim, TreeStore};

/// Optional placement inputs
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlacementRequest {
    pub preferred_side: Option<Side>,
    /// Prospect the new position is reserved for
    pub reserved_for: Option<ProspectId>,
}

impl PlacementRequest {
    pub fn prefer(side: Side) -> Self {
        Self {
            preferred_side: Some(side),
            ..Default::default()
        }
    }
}

pub struct PlacementEngine {
    store: Arc<dyn TreeStore>,
    journal: Option<Arc<Journal>>,
    stats: Arc<EngineStats>,
    config: PlacementConfig,
}

impl PlacementEngine {
    pub fn new(
        store: Arc<dyn TreeStore>,
        journal: Option<Arc<Journal>>,
        stats: Arc<EngineStats>,
        config: PlacementConfig,
    ) -> Self {
        Self {
            store,
            journal,
            stats,
            config,
        }
    }

    pub fn place(&self, anchor: &NodeId, preferred_side: Option<Side>) -> Result<Position, PowerLineError> {
        self.place_at(
            anchor,
            PlacementRequest {
                preferred_side,
                reserved_for: None,
            },
            Utc::now(),
        )
    }

    pub fn place_at(
        &self,
        anchor: &NodeId,
        request: PlacementRequest,
        now: DateTime<Utc>,
    ) -> Result<Position, PowerLineError> {
        let anchor_position = self
            .store
            .get(anchor)
            .ok_or_else(|| PowerLineError::PositionNotFound(anchor.clone()))?;

        let max_attempts = self.config.max_attempts.max(1);
        for attempt in 1..=max_attempts {
            if let Some(max_nodes) = self.config.max_nodes
                && self.store.len() >= max_nodes
            {
                return Err(self.no_slot(anchor, "tree size cap reached"));
            }

            let Some(parent) = self
                .store
                .open_slots(&anchor_position.path, self.config.max_depth, 1)
                .into_iter()
                .next()
            else {
                return Err(self.no_slot(anchor, "subtree has no open slot"));
            };

            let side = choose_side(&parent, request.preferred_side);
            let mut child = Position::child_of(&parent, side, now);
            child.reserved_for = request.reserved_for;

            let claim = self.store.claim_child(
                &parent.node_id,
                side,
                child,
                &mut |created: &Position| -> Result<(), PowerLineError> {
                    match &self.journal {
                        Some(journal) => journal
                            .position_created(created, Some(parent.position_number))
                            .map(|_| ()),
                        None => Ok(()),
                    }
                },
            )?;

            match claim {
                Claim::Claimed(position) => {
                    self.stats.record_placement();
                    info!(
                        node_id = %position.node_id,
                        parent = %parent.node_id,
                        side = %side,
                        level = position.level(),
                        position_number = position.position_number,
                        "Position placed"
                    );
                    return Ok(position);
                }
                Claim::Taken => {
                    self.stats.record_placement_conflict();
                    debug!(
                        anchor = %anchor,
                        parent = %parent.node_id,
                        side = %side,
                        attempt,
                        "Slot claimed concurrently, rescanning"
                    );
                }
            }
        }

        self.stats.record_placement_failure();
        warn!(anchor = %anchor, attempts = max_attempts, "Placement gave up after repeated conflicts");
        Err(PowerLineError::ConcurrentPlacementConflict {
            anchor: anchor.clone(),
            attempts: max_attempts,
        })
    }

    fn no_slot(&self, anchor: &NodeId, reason: &str) -> PowerLineError {
        self.stats.record_placement_failure();
        debug!(anchor = %anchor, reason, "No available slot");
        PowerLineError::NoAvailableSlot {
            anchor: anchor.clone(),
        }
    }
}

/// Side to fill under `parent`
pub fn choose_side(parent: &Position, preferred: Option<Side>) -> Side {
    if let Some(side) = preferred
        && parent.is_open(side)
    {
        return side;
    }
    match (parent.is_open(Side::Left), parent.is_open(Side::Right)) {
        (true, true) => parent.weaker_leg(),
        (false, true) => Side::Right,
        // Full or left-only; a full parent loses the claim and is rescanned
        _ => Side::Left,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryTreeStore;
    use chrono::TimeZone;
    use std::collections::HashSet;
    use std::thread;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 2, 9, 0, 0).unwrap()
    }

    fn setup(config: PlacementConfig) -> (Arc<MemoryTreeStore>, PlacementEngine) {
        let store = Arc::new(MemoryTreeStore::new());
        store.init_root(NodeId::from("ROOT"), t0()).unwrap();
        let engine = PlacementEngine::new(store.clone(), None, Arc::new(EngineStats::new()), config);
        (store, engine)
    }

    fn root() -> NodeId {
        NodeId::from("ROOT")
    }

    #[test]
    fn test_spillover_order_from_root() {
        let (_store, engine) = setup(PlacementConfig::default());
        let paths: Vec<String> = (0..3)
            .map(|_| engine.place(&root(), None).unwrap().path.to_string())
            .collect();
        assert_eq!(paths, vec!["L", "R", "LL"]);
    }

    #[test]
    fn test_position_numbers_follow_creation() {
        let (_store, engine) = setup(PlacementConfig::default());
        let a = engine.place(&root(), None).unwrap();
        let b = engine.place(&root(), None).unwrap();
        assert_eq!(a.position_number, 2);
        assert_eq!(b.position_number, 3);
        assert_eq!(a.node_id.as_str(), "ROOT_Left");
        assert_eq!(a.parent, Some(root()));
    }

    #[test]
    fn test_preferred_side_honoured_when_open() {
        let (_store, engine) = setup(PlacementConfig::default());
        let first = engine.place(&root(), Some(Side::Right)).unwrap();
        assert_eq!(first.path.to_string(), "R");
        // Right is taken now; preference falls back to the open side
        let second = engine.place(&root(), Some(Side::Right)).unwrap();
        assert_eq!(second.path.to_string(), "L");
    }

    #[test]
    fn test_both_open_goes_opposite_fuller_leg() {
        let (store, engine) = setup(PlacementConfig::default());
        store
            .update(&root(), &mut |p: &mut Position| -> Result<(), PowerLineError> {
                p.left_leg_volume = 500;
                Ok(())
            })
            .unwrap();
        assert_eq!(engine.place(&root(), None).unwrap().side, Some(Side::Right));
    }

    #[test]
    fn test_anchor_scopes_the_scan() {
        let (_store, engine) = setup(PlacementConfig::default());
        engine.place(&root(), None).unwrap();
        let right = engine.place(&root(), None).unwrap();
        let under_right = engine.place(&right.node_id, None).unwrap();
        assert_eq!(under_right.path.to_string(), "RL");
    }

    #[test]
    fn test_unknown_anchor() {
        let (_store, engine) = setup(PlacementConfig::default());
        let err = engine.place(&NodeId::from("GHOST"), None).unwrap_err();
        assert_eq!(err, PowerLineError::PositionNotFound(NodeId::from("GHOST")));
    }

    #[test]
    fn test_max_depth_exhausts_slots() {
        let config = PlacementConfig {
            max_depth: Some(1),
            ..Default::default()
        };
        let (_store, engine) = setup(config);
        engine.place(&root(), None).unwrap();
        engine.place(&root(), None).unwrap();
        let err = engine.place(&root(), None).unwrap_err();
        assert!(matches!(err, PowerLineError::NoAvailableSlot { .. }));
    }

    #[test]
    fn test_max_nodes_cap() {
        let config = PlacementConfig {
            max_nodes: Some(2),
            ..Default::default()
        };
        let (store, engine) = setup(config);
        engine.place(&root(), None).unwrap();
        assert!(matches!(
            engine.place(&root(), None),
            Err(PowerLineError::NoAvailableSlot { .. })
        ));
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_concurrent_placements_get_distinct_slots() {
        let config = PlacementConfig {
            max_attempts: 1000,
            ..Default::default()
        };
        let (store, engine) = setup(config);
        let engine = Arc::new(engine);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let engine = engine.clone();
                thread::spawn(move || {
                    (0..25)
                        .map(|_| engine.place(&NodeId::from("ROOT"), None).unwrap())
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        let placed: Vec<Position> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();

        assert_eq!(placed.len(), 200);
        let ids: HashSet<_> = placed.iter().map(|p| p.node_id.clone()).collect();
        let numbers: HashSet<_> = placed.iter().map(|p| p.position_number).collect();
        assert_eq!(ids.len(), 200);
        assert_eq!(numbers.len(), 200);
        assert_eq!(store.len(), 201);

        // Complete tree: 201 nodes fill levels 0..=6 (127) plus 74 on level 7
        let deepest = placed.iter().map(|p| p.level()).max().unwrap();
        assert_eq!(deepest, 7);
    }
}
