// models.rs - Tree position and commission types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::core_types::{Amount, NodeId, PositionNumber, PromoterId, ProspectId, SeqNum, Volume};
use crate::error::PowerLineError;

/// Side of a node relative to its parent.
///
/// Ordered `Left < Right` so that path sequences sort in pre-order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Side {
    Left,
    Right,
}

impl Side {
    #[inline]
    pub fn opposite(self) -> Side {
        match self {
            Side::Left => Side::Right,
            Side::Right => Side::Left,
        }
    }

    /// Single-character path marker
    #[inline]
    pub fn marker(self) -> char {
        match self {
            Side::Left => 'L',
            Side::Right => 'R',
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Side::Left => "Left",
            Side::Right => "Right",
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Side {
    type Err = PowerLineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "L" | "Left" | "left" => Ok(Side::Left),
            "R" | "Right" | "right" => Ok(Side::Right),
            other => Err(PowerLineError::InvalidPath(format!(
                "unknown side marker: {other}"
            ))),
        }
    }
}

// ============================================================
// TREE PATH
// ============================================================

/// Materialized path from the root: one side marker per level.
///
/// Ordering is lexicographic over `Side`, so every descendant of `p` sorts
/// after `p` and before the next non-descendant. Subtree scans are a
/// `BTreeMap` range starting at `p`, taken while `starts_with(p)` holds.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TreePath(Vec<Side>);

impl TreePath {
    pub fn root() -> Self {
        Self(Vec::new())
    }

    #[inline]
    pub fn level(&self) -> u32 {
        self.0.len() as u32
    }

    #[inline]
    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    pub fn sides(&self) -> &[Side] {
        &self.0
    }

    /// Path of the child on `side`
    pub fn child(&self, side: Side) -> Self {
        let mut sides = Vec::with_capacity(self.0.len() + 1);
        sides.extend_from_slice(&self.0);
        sides.push(side);
        Self(sides)
    }

    /// Parent path and the side taken from it; `None` at the root
    pub fn split_last(&self) -> Option<(TreePath, Side)> {
        let (last, rest) = self.0.split_last()?;
        Some((TreePath(rest.to_vec()), *last))
    }

    pub fn last(&self) -> Option<Side> {
        self.0.last().copied()
    }

    pub fn starts_with(&self, prefix: &TreePath) -> bool {
        self.0.starts_with(&prefix.0)
    }

    /// Side of `self` under `ancestor`, i.e. the marker right after the prefix
    pub fn side_under(&self, ancestor: &TreePath) -> Option<Side> {
        if self.0.len() <= ancestor.0.len() || !self.starts_with(ancestor) {
            return None;
        }
        Some(self.0[ancestor.0.len()])
    }
}

impl fmt::Display for TreePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for side in &self.0 {
            write!(f, "{}", side.marker())?;
        }
        Ok(())
    }
}

impl FromStr for TreePath {
    type Err = PowerLineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.chars()
            .map(|c| match c {
                'L' => Ok(Side::Left),
                'R' => Ok(Side::Right),
                other => Err(PowerLineError::InvalidPath(format!(
                    "invalid marker '{other}' in path \"{s}\""
                ))),
            })
            .collect::<Result<Vec<_>, _>>()
            .map(TreePath)
    }
}

// ============================================================
// OCCUPANT
// ============================================================

/// How the occupant arrived in this position
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PlacementMethod {
    /// Automatic placement into the next open slot
    Spillover,
    /// Sponsor-chosen placement
    Direct,
}

/// Enrolled promoter holding a position
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Occupant {
    pub promoter_id: PromoterId,
    pub placed_at: DateTime<Utc>,
    pub is_active: bool,
    pub placement_method: PlacementMethod,
}

// ============================================================
// POSITION
// ============================================================

/// Per-window cycle bookkeeping used by the cycle cap
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QualificationWindow {
    pub window_start: DateTime<Utc>,
    pub cycles_in_window: u32,
}

/// A node of the PowerLine tree.
///
/// # Field ownership:
/// - Shape (`left_child`, `right_child`): PlacementEngine
/// - `personal_volume`, leg volumes: VolumeAggregator
/// - Leg deductions, `cycles_completed`, `window`: QualificationEngine
/// - `occupant`, `subtree_size`: enrollment
///
/// `total_group_volume` and `lesser_leg_volume` are never stored; they are
/// always derived from the leg volumes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    pub node_id: NodeId,
    pub path: TreePath,
    pub position_number: PositionNumber,
    pub side: Option<Side>,
    pub parent: Option<NodeId>,
    pub left_child: Option<NodeId>,
    pub right_child: Option<NodeId>,
    pub occupant: Option<Occupant>,
    pub reserved_for: Option<ProspectId>,
    pub personal_volume: Volume,
    pub left_leg_volume: Volume,
    pub right_leg_volume: Volume,
    pub subtree_size: u64,
    pub cycles_completed: u64,
    pub window: Option<QualificationWindow>,
    pub created_at: DateTime<Utc>,
}

impl Position {
    /// Root position (level 0, no parent)
    pub fn root(node_id: NodeId, position_number: PositionNumber, now: DateTime<Utc>) -> Self {
        Self {
            node_id,
            path: TreePath::root(),
            position_number,
            side: None,
            parent: None,
            left_child: None,
            right_child: None,
            occupant: None,
            reserved_for: None,
            personal_volume: 0,
            left_leg_volume: 0,
            right_leg_volume: 0,
            subtree_size: 0,
            cycles_completed: 0,
            window: None,
            created_at: now,
        }
    }

    /// New vacant child of `parent` on `side`. The position number is
    /// assigned by the store when the slot is claimed.
    pub fn child_of(parent: &Position, side: Side, now: DateTime<Utc>) -> Self {
        Self {
            node_id: Self::child_id(&parent.node_id, side),
            path: parent.path.child(side),
            position_number: 0,
            side: Some(side),
            parent: Some(parent.node_id.clone()),
            left_child: None,
            right_child: None,
            occupant: None,
            reserved_for: None,
            personal_volume: 0,
            left_leg_volume: 0,
            right_leg_volume: 0,
            subtree_size: 0,
            cycles_completed: 0,
            window: None,
            created_at: now,
        }
    }

    /// Deterministic child id: `{parent}_{Left|Right}`
    pub fn child_id(parent: &NodeId, side: Side) -> NodeId {
        NodeId::new(format!("{}_{}", parent, side))
    }

    #[inline]
    pub fn level(&self) -> u32 {
        self.path.level()
    }

    #[inline]
    pub fn is_vacant(&self) -> bool {
        self.occupant.is_none()
    }

    #[inline]
    pub fn total_group_volume(&self) -> Volume {
        self.personal_volume
            .saturating_add(self.left_leg_volume)
            .saturating_add(self.right_leg_volume)
    }

    #[inline]
    pub fn lesser_leg_volume(&self) -> Volume {
        self.left_leg_volume.min(self.right_leg_volume)
    }

    #[inline]
    pub fn leg_volume(&self, side: Side) -> Volume {
        match side {
            Side::Left => self.left_leg_volume,
            Side::Right => self.right_leg_volume,
        }
    }

    pub fn leg_volume_mut(&mut self, side: Side) -> &mut Volume {
        match side {
            Side::Left => &mut self.left_leg_volume,
            Side::Right => &mut self.right_leg_volume,
        }
    }

    #[inline]
    pub fn child(&self, side: Side) -> Option<&NodeId> {
        match side {
            Side::Left => self.left_child.as_ref(),
            Side::Right => self.right_child.as_ref(),
        }
    }

    pub fn child_slot_mut(&mut self, side: Side) -> &mut Option<NodeId> {
        match side {
            Side::Left => &mut self.left_child,
            Side::Right => &mut self.right_child,
        }
    }

    #[inline]
    pub fn is_open(&self, side: Side) -> bool {
        self.child(side).is_none()
    }

    #[inline]
    pub fn has_open_slot(&self) -> bool {
        self.left_child.is_none() || self.right_child.is_none()
    }

    /// Leg currently holding less volume; Left on a tie
    pub fn weaker_leg(&self) -> Side {
        if self.right_leg_volume < self.left_leg_volume {
            Side::Right
        } else {
            Side::Left
        }
    }
}

// ============================================================
// COMMISSION EVENTS
// ============================================================

/// Commission type emitted by the core
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CommissionType {
    /// Matched-volume cycle on a binary position
    BinaryCycle,
}

impl CommissionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommissionType::BinaryCycle => "BINARY_CYCLE",
        }
    }
}

/// Commission event identity: `(node_id, cycle_number)`.
///
/// `cycle_number` is `cycles_completed` after the increment that produced
/// the event, so the same cycle always maps to the same id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CommissionId {
    pub node_id: NodeId,
    pub cycle_number: u64,
}

impl fmt::Display for CommissionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.node_id, self.cycle_number)
    }
}

/// Emitted commission, persisted by the CommissionLedger
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommissionEvent {
    pub id: CommissionId,
    pub recipient: PromoterId,
    pub amount: Amount,
    pub commission_type: CommissionType,
    pub created_at: DateTime<Utc>,
    /// Ledger append sequence (0 until appended)
    pub seq: SeqNum,
}

impl CommissionEvent {
    #[inline]
    pub fn node_id(&self) -> &NodeId {
        &self.id.node_id
    }
}
