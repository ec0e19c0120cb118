//! Tree Store
//!
//! Repository of tree nodes keyed by node id and by materialized path.
//!
//! # Contract
//!
//! - Point lookups return snapshots (clones); callers never hold references
//!   into the store.
//! - `claim_child` is the ONLY way to create a non-root node. Checking the
//!   slot, assigning the position number and linking the child happen in one
//!   exclusive section on the parent.
//! - `update` runs a closure inside the node's exclusive section. The closure
//!   works on a copy; the copy is committed only if the closure returns `Ok`.
//! - The position counter is owned by the store and never reused.

pub mod memory;

pub use memory::MemoryTreeStore;

use chrono::{DateTime, Utc};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::core_types::{NodeId, PositionNumber};
use crate::error::PowerLineError;
use crate::models::{Position, Side, TreePath};

/// Outcome of a conditional child-slot claim
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Claim {
    /// Slot was empty and now holds the returned child
    Claimed(Position),
    /// Another writer filled the slot first
    Taken,
}

/// Hook invoked inside an exclusive section before a change becomes visible
pub type CommitHook<'a> = &'a mut dyn FnMut(&Position) -> Result<(), PowerLineError>;

/// Storage seam for the PowerLine engines
pub trait TreeStore: Send + Sync {
    /// Store name for logging
    fn name(&self) -> &'static str;

    /// Create the root if the store is empty; returns the (possibly existing) root
    fn init_root(&self, root_id: NodeId, now: DateTime<Utc>) -> Result<Position, PowerLineError>;

    fn root(&self) -> Option<Position>;

    fn get(&self, node_id: &NodeId) -> Option<Position>;

    fn get_by_path(&self, path: &TreePath) -> Option<Position>;

    /// Number of positions in the tree
    fn len(&self) -> u64;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Next position number that will be assigned (does not consume it)
    fn peek_position_number(&self) -> PositionNumber;

    /// Atomically link `child` into `parent`'s `side` slot if still empty.
    ///
    /// `on_commit` runs under the parent's section after the position number
    /// is assigned and before the child is visible; an error aborts the claim.
    fn claim_child(
        &self,
        parent: &NodeId,
        side: Side,
        child: Position,
        on_commit: CommitHook<'_>,
    ) -> Result<Claim, PowerLineError>;

    /// Mutate one node inside its exclusive section, returning the committed state
    fn update(
        &self,
        node_id: &NodeId,
        f: &mut dyn FnMut(&mut Position) -> Result<(), PowerLineError>,
    ) -> Result<Position, PowerLineError>;

    /// Nodes with at least one open child slot under `anchor` (inclusive),
    /// ascending by position number. Nodes at or beyond `max_parent_level`
    /// are skipped.
    fn open_slots(
        &self,
        anchor: &TreePath,
        max_parent_level: Option<u32>,
        limit: usize,
    ) -> Vec<Position>;

    /// Path-prefix range scan: strict descendants of `anchor`, at most
    /// `max_levels` below it, in path order.
    fn descendants(&self, anchor: &TreePath, max_levels: Option<u32>) -> Vec<Position>;

    /// Every position, ascending by position number
    fn all(&self) -> Vec<Position>;

    /// Replace the whole tree with recovered state
    fn restore(
        &self,
        positions: Vec<Position>,
        next_position_number: PositionNumber,
    ) -> Result<(), PowerLineError>;
}

// ============================================================
// MUTATION GATE
// ============================================================

/// Gate separating in-flight mutations from consistent snapshots.
///
/// Mutations (placement claims, volume propagation, enrollment) enter
/// concurrently; a snapshot freezes the gate so no half-applied
/// propagation can be observed.
#[derive(Debug, Default)]
pub struct MutationGate(RwLock<()>);

impl MutationGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Shared entry for a mutation
    pub fn enter(&self) -> RwLockReadGuard<'_, ()> {
        self.0.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Exclusive entry for a consistent read
    pub fn freeze(&self) -> RwLockWriteGuard<'_, ()> {
        self.0.write().unwrap_or_else(PoisonError::into_inner)
    }
}
