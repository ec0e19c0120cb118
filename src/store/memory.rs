//! In-memory tree store.
//!
//! Nodes live in a `DashMap` of per-node cells; each cell is the node's
//! exclusive section. Two ordered indexes serve range scans:
//! - `by_path`: materialized path → node id (subtree / downline scans)
//! - `open`: position number → (node id, path) for nodes with an open slot
//! - `open_by_path`: path → position number for the same nodes, so an
//!   anchored scan only visits its own subtree
//!
//! # Lock order
//!
//! node cell → index locks. Index locks are never held while taking a node
//! cell; scans copy ids out of the index first, then lock nodes one by one.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use super::{Claim, CommitHook, TreeStore};
use crate::core_types::{NodeId, PositionNumber};
use crate::error::PowerLineError;
use crate::models::{Position, Side, TreePath};

type NodeCell = Arc<Mutex<Position>>;

/// Candidates pulled from the open-slot index per scan round
const OPEN_SCAN_BATCH: usize = 64;

pub struct MemoryTreeStore {
    nodes: DashMap<NodeId, NodeCell>,
    by_path: RwLock<BTreeMap<TreePath, NodeId>>,
    open: RwLock<BTreeMap<PositionNumber, (NodeId, TreePath)>>,
    open_by_path: RwLock<BTreeMap<TreePath, (PositionNumber, NodeId)>>,
    root_id: RwLock<Option<NodeId>>,
    /// Next position number; root gets 1
    next_position_number: AtomicU64,
}

impl MemoryTreeStore {
    pub fn new() -> Self {
        Self {
            nodes: DashMap::new(),
            by_path: RwLock::new(BTreeMap::new()),
            open: RwLock::new(BTreeMap::new()),
            open_by_path: RwLock::new(BTreeMap::new()),
            root_id: RwLock::new(None),
            next_position_number: AtomicU64::new(1),
        }
    }

    fn cell(&self, node_id: &NodeId) -> Option<NodeCell> {
        self.nodes.get(node_id).map(|entry| Arc::clone(entry.value()))
    }

    fn lock(cell: &NodeCell) -> MutexGuard<'_, Position> {
        cell.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn snapshot(&self, node_id: &NodeId) -> Option<Position> {
        self.cell(node_id).map(|cell| Self::lock(&cell).clone())
    }

    fn index_node(&self, position: &Position) {
        self.by_path
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(position.path.clone(), position.node_id.clone());
        if position.has_open_slot() {
            self.open
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(
                    position.position_number,
                    (position.node_id.clone(), position.path.clone()),
                );
            self.open_by_path
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(
                    position.path.clone(),
                    (position.position_number, position.node_id.clone()),
                );
        }
    }

    fn unindex_open(&self, position: &Position) {
        self.open
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&position.position_number);
        self.open_by_path
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&position.path);
    }

    /// Open nodes of the whole tree, walked in position-number order
    fn open_slots_global(&self, max_parent_level: Option<u32>, limit: usize) -> Vec<Position> {
        let mut found = Vec::new();
        let mut cursor: PositionNumber = 0;

        while found.len() < limit {
            // Copy a batch of candidates out of the index, then release it
            let batch: Vec<(PositionNumber, NodeId)> = {
                let open = self.open.read().unwrap_or_else(PoisonError::into_inner);
                open.range(cursor..)
                    .filter(|(_, (_, path))| max_parent_level.is_none_or(|max| path.level() < max))
                    .take(OPEN_SCAN_BATCH)
                    .map(|(number, (node_id, _))| (*number, node_id.clone()))
                    .collect()
            };
            let Some(&(last, _)) = batch.last() else {
                break;
            };

            self.collect_open(batch, &mut found, limit);
            cursor = last + 1;
        }

        found
    }

    /// Open nodes under `anchor`, range-scanned by path then put in
    /// position-number order
    fn open_slots_under(
        &self,
        anchor: &TreePath,
        max_parent_level: Option<u32>,
        limit: usize,
    ) -> Vec<Position> {
        let mut candidates: Vec<(PositionNumber, NodeId)> = {
            let open = self.open_by_path.read().unwrap_or_else(PoisonError::into_inner);
            open.range(anchor.clone()..)
                .take_while(|(path, _)| path.starts_with(anchor))
                .filter(|(path, _)| max_parent_level.is_none_or(|max| path.level() < max))
                .map(|(_, (number, node_id))| (*number, node_id.clone()))
                .collect()
        };
        candidates.sort_unstable_by_key(|(number, _)| *number);

        let mut found = Vec::new();
        self.collect_open(candidates, &mut found, limit);
        found
    }

    fn collect_open(&self, candidates: Vec<(PositionNumber, NodeId)>, found: &mut Vec<Position>, limit: usize) {
        for (_, node_id) in candidates {
            if found.len() == limit {
                break;
            }
            if let Some(position) = self.snapshot(&node_id)
                && position.has_open_slot()
            {
                found.push(position);
            }
        }
    }

    /// Shape fields belong to placement; `update` must not touch them
    fn shape_unchanged(before: &Position, after: &Position) -> bool {
        before.node_id == after.node_id
            && before.path == after.path
            && before.position_number == after.position_number
            && before.parent == after.parent
            && before.left_child == after.left_child
            && before.right_child == after.right_child
    }
}

impl Default for MemoryTreeStore {
    fn default() -> Self {
        Self::new()
    }
}

impl TreeStore for MemoryTreeStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn init_root(&self, root_id: NodeId, now: DateTime<Utc>) -> Result<Position, PowerLineError> {
        let mut root_slot = self.root_id.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = root_slot.as_ref() {
            return self.snapshot(existing).ok_or_else(|| {
                PowerLineError::InternalConsistency(format!(
                    "root id {existing} registered but node missing"
                ))
            });
        }

        let number = self.next_position_number.fetch_add(1, Ordering::SeqCst);
        let root = Position::root(root_id.clone(), number, now);
        self.nodes
            .insert(root_id.clone(), Arc::new(Mutex::new(root.clone())));
        self.index_node(&root);
        *root_slot = Some(root_id);
        Ok(root)
    }

    fn root(&self) -> Option<Position> {
        let root_id = self
            .root_id
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()?;
        self.snapshot(&root_id)
    }

    fn get(&self, node_id: &NodeId) -> Option<Position> {
        self.snapshot(node_id)
    }

    fn get_by_path(&self, path: &TreePath) -> Option<Position> {
        let node_id = self
            .by_path
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(path)
            .cloned()?;
        self.snapshot(&node_id)
    }

    fn len(&self) -> u64 {
        self.nodes.len() as u64
    }

    fn peek_position_number(&self) -> PositionNumber {
        self.next_position_number.load(Ordering::SeqCst)
    }

    fn claim_child(
        &self,
        parent: &NodeId,
        side: Side,
        mut child: Position,
        on_commit: CommitHook<'_>,
    ) -> Result<Claim, PowerLineError> {
        let cell = self
            .cell(parent)
            .ok_or_else(|| PowerLineError::PositionNotFound(parent.clone()))?;
        let mut guard = Self::lock(&cell);

        if !guard.is_open(side) {
            return Ok(Claim::Taken);
        }

        if child.parent.as_ref() != Some(&guard.node_id) || child.path != guard.path.child(side) {
            return Err(PowerLineError::InternalConsistency(format!(
                "child {} does not descend from {} on {}",
                child.node_id, guard.node_id, side
            )));
        }
        if self.nodes.contains_key(&child.node_id) {
            return Err(PowerLineError::InternalConsistency(format!(
                "open slot {} of {} but node {} already exists",
                side, guard.node_id, child.node_id
            )));
        }

        child.position_number = self.next_position_number.fetch_add(1, Ordering::SeqCst);
        on_commit(&child)?;

        self.nodes
            .insert(child.node_id.clone(), Arc::new(Mutex::new(child.clone())));
        self.index_node(&child);

        *guard.child_slot_mut(side) = Some(child.node_id.clone());
        if !guard.has_open_slot() {
            self.unindex_open(&guard);
        }

        Ok(Claim::Claimed(child))
    }

    fn update(
        &self,
        node_id: &NodeId,
        f: &mut dyn FnMut(&mut Position) -> Result<(), PowerLineError>,
    ) -> Result<Position, PowerLineError> {
        let cell = self
            .cell(node_id)
            .ok_or_else(|| PowerLineError::PositionNotFound(node_id.clone()))?;
        let mut guard = Self::lock(&cell);

        let mut draft = guard.clone();
        f(&mut draft)?;

        if !Self::shape_unchanged(&guard, &draft) {
            return Err(PowerLineError::InternalConsistency(format!(
                "update attempted to change tree shape of {node_id}"
            )));
        }

        *guard = draft.clone();
        Ok(draft)
    }

    fn open_slots(
        &self,
        anchor: &TreePath,
        max_parent_level: Option<u32>,
        limit: usize,
    ) -> Vec<Position> {
        if anchor.is_root() {
            self.open_slots_global(max_parent_level, limit)
        } else {
            self.open_slots_under(anchor, max_parent_level, limit)
        }
    }

    fn descendants(&self, anchor: &TreePath, max_levels: Option<u32>) -> Vec<Position> {
        let max_level = max_levels.map(|levels| anchor.level().saturating_add(levels));
        let ids: Vec<NodeId> = {
            let by_path = self.by_path.read().unwrap_or_else(PoisonError::into_inner);
            by_path
                .range(anchor.clone()..)
                .take_while(|(path, _)| path.starts_with(anchor))
                .filter(|(path, _)| {
                    path.level() > anchor.level() && max_level.is_none_or(|max| path.level() <= max)
                })
                .map(|(_, node_id)| node_id.clone())
                .collect()
        };

        ids.iter().filter_map(|id| self.snapshot(id)).collect()
    }

    fn all(&self) -> Vec<Position> {
        let ids: Vec<NodeId> = self.nodes.iter().map(|entry| entry.key().clone()).collect();
        let mut positions: Vec<Position> = ids.iter().filter_map(|id| self.snapshot(id)).collect();
        positions.sort_by_key(|p| p.position_number);
        positions
    }

    fn restore(
        &self,
        positions: Vec<Position>,
        next_position_number: PositionNumber,
    ) -> Result<(), PowerLineError> {
        let mut root_slot = self.root_id.write().unwrap_or_else(PoisonError::into_inner);
        self.nodes.clear();
        self.by_path
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.open.write().unwrap_or_else(PoisonError::into_inner).clear();
        self.open_by_path
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        *root_slot = None;

        for position in positions {
            if position.path.is_root() {
                if let Some(existing) = root_slot.as_ref() {
                    return Err(PowerLineError::InternalConsistency(format!(
                        "two roots in recovered state: {existing} and {}",
                        position.node_id
                    )));
                }
                *root_slot = Some(position.node_id.clone());
            }
            self.index_node(&position);
            self.nodes
                .insert(position.node_id.clone(), Arc::new(Mutex::new(position)));
        }

        self.next_position_number
            .store(next_position_number, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn no_hook() -> impl FnMut(&Position) -> Result<(), PowerLineError> {
        |_| Ok(())
    }

    fn store_with_root() -> (MemoryTreeStore, Position) {
        let store = MemoryTreeStore::new();
        let root = store.init_root(NodeId::from("ROOT"), Utc::now()).unwrap();
        (store, root)
    }

    #[test]
    fn test_init_root_is_idempotent() {
        let (store, root) = store_with_root();
        assert_eq!(root.position_number, 1);
        let again = store.init_root(NodeId::from("OTHER"), Utc::now()).unwrap();
        assert_eq!(again.node_id, root.node_id);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_claim_links_child_and_assigns_number() {
        let (store, root) = store_with_root();
        let child = Position::child_of(&root, Side::Left, Utc::now());
        let claim = store
            .claim_child(&root.node_id, Side::Left, child, &mut no_hook())
            .unwrap();

        let Claim::Claimed(child) = claim else {
            panic!("expected claim");
        };
        assert_eq!(child.position_number, 2);
        assert_eq!(
            store.get(&root.node_id).unwrap().left_child,
            Some(child.node_id.clone())
        );
        assert_eq!(
            store.get_by_path(&"L".parse().unwrap()).unwrap().node_id,
            child.node_id
        );
    }

    #[test]
    fn test_claim_taken_slot() {
        let (store, root) = store_with_root();
        let child = Position::child_of(&root, Side::Left, Utc::now());
        store
            .claim_child(&root.node_id, Side::Left, child.clone(), &mut no_hook())
            .unwrap();
        let second = store
            .claim_child(&root.node_id, Side::Left, child, &mut no_hook())
            .unwrap();
        assert_eq!(second, Claim::Taken);
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_failed_hook_aborts_claim() {
        let (store, root) = store_with_root();
        let child = Position::child_of(&root, Side::Right, Utc::now());
        let mut failing = |_: &Position| -> Result<(), PowerLineError> {
            Err(PowerLineError::Journal("disk full".into()))
        };
        let result = store.claim_child(&root.node_id, Side::Right, child, &mut failing);
        assert!(matches!(result, Err(PowerLineError::Journal(_))));
        assert!(store.get(&root.node_id).unwrap().right_child.is_none());
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_update_discards_on_error() {
        let (store, root) = store_with_root();
        let result = store.update(&root.node_id, &mut |p| {
            p.personal_volume = 999;
            Err(PowerLineError::NegativeVolume(-1))
        });
        assert!(result.is_err());
        assert_eq!(store.get(&root.node_id).unwrap().personal_volume, 0);
    }

    #[test]
    fn test_update_rejects_shape_change() {
        let (store, root) = store_with_root();
        let result = store.update(&root.node_id, &mut |p| {
            p.left_child = Some(NodeId::from("ghost"));
            Ok(())
        });
        assert!(matches!(
            result,
            Err(PowerLineError::InternalConsistency(_))
        ));
    }

    #[test]
    fn test_open_slots_drop_full_nodes() {
        let (store, root) = store_with_root();
        for side in [Side::Left, Side::Right] {
            let child = Position::child_of(&root, side, Utc::now());
            store
                .claim_child(&root.node_id, side, child, &mut no_hook())
                .unwrap();
        }
        let open = store.open_slots(&TreePath::root(), None, 10);
        let numbers: Vec<_> = open.iter().map(|p| p.position_number).collect();
        assert_eq!(numbers, vec![2, 3]);

        let capped = store.open_slots(&TreePath::root(), Some(1), 10);
        assert!(capped.is_empty());
    }

    #[test]
    fn test_open_slots_anchored_to_subtree() {
        let (store, root) = store_with_root();
        let mut claimed = Vec::new();
        for (parent, side) in [(root.clone(), Side::Left), (root.clone(), Side::Right)] {
            let child = Position::child_of(&parent, side, Utc::now());
            let Claim::Claimed(child) = store
                .claim_child(&parent.node_id, side, child, &mut no_hook())
                .unwrap()
            else {
                panic!("expected claim");
            };
            claimed.push(child);
        }
        let left = claimed[0].clone();
        let ll = Position::child_of(&left, Side::Left, Utc::now());
        store
            .claim_child(&left.node_id, Side::Left, ll, &mut no_hook())
            .unwrap();

        let under_left: Vec<(String, u64)> = store
            .open_slots(&left.path, None, 10)
            .iter()
            .map(|p| (p.path.to_string(), p.position_number))
            .collect();
        assert_eq!(
            under_left,
            vec![("L".to_string(), 2), ("LL".to_string(), 4)]
        );

        // Root left the index once both slots were taken
        let all: Vec<u64> = store
            .open_slots(&TreePath::root(), None, 10)
            .iter()
            .map(|p| p.position_number)
            .collect();
        assert_eq!(all, vec![2, 3, 4]);

        let right = store.open_slots(&"R".parse().unwrap(), None, 10);
        assert_eq!(right.len(), 1);
        assert_eq!(store.open_slots(&left.path, Some(2), 10).len(), 1);
    }

    #[test]
    fn test_descendants_range_scan() {
        let (store, root) = store_with_root();
        let left = Position::child_of(&root, Side::Left, Utc::now());
        let Claim::Claimed(left) = store
            .claim_child(&root.node_id, Side::Left, left, &mut no_hook())
            .unwrap()
        else {
            panic!("expected claim");
        };
        let right = Position::child_of(&root, Side::Right, Utc::now());
        store
            .claim_child(&root.node_id, Side::Right, right, &mut no_hook())
            .unwrap();
        let ll = Position::child_of(&left, Side::Left, Utc::now());
        store
            .claim_child(&left.node_id, Side::Left, ll, &mut no_hook())
            .unwrap();

        let under_left: Vec<String> = store
            .descendants(&left.path, None)
            .iter()
            .map(|p| p.path.to_string())
            .collect();
        assert_eq!(under_left, vec!["LL"]);

        let one_level: Vec<String> = store
            .descendants(&TreePath::root(), Some(1))
            .iter()
            .map(|p| p.path.to_string())
            .collect();
        assert_eq!(one_level, vec!["L", "R"]);
    }

    #[test]
    fn test_concurrent_claims_single_winner() {
        let (store, root) = store_with_root();
        let store = Arc::new(store);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = Arc::clone(&store);
                let root = root.clone();
                thread::spawn(move || {
                    let child = Position::child_of(&root, Side::Left, Utc::now());
                    let mut hook = |_: &Position| -> Result<(), PowerLineError> { Ok(()) };
                    store
                        .claim_child(&root.node_id, Side::Left, child, &mut hook)
                        .unwrap()
                })
            })
            .collect();

        let claimed = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|c| matches!(c, Claim::Claimed(_)))
            .count();
        assert_eq!(claimed, 1);
        assert_eq!(store.len(), 2);
    }
}
