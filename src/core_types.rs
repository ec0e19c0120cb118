//! Core types used throughout the system
//!
//! These are fundamental identifiers and amount aliases used by all modules.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Position number - global creation sequence.
///
/// # Constraints:
/// - **Immutable**: Once assigned, NEVER changes
/// - **Monotonic**: Strictly increasing with creation order, never reused
/// - Root is always 1
pub type PositionNumber = u64;

/// Promoter ID - enrolled member owning at most one position.
pub type PromoterId = u64;

/// Volume in integer minor units (cents).
pub type Volume = u64;

/// Commission amount in integer minor units (cents).
pub type Amount = u64;

/// Sequence number for ordering (ledger appends, journal entries)
pub type SeqNum = u64;

/// Prospect ID - pending occupant awaiting enrollment
pub type ProspectId = uuid::Uuid;

/// Node ID - unique position identifier.
///
/// Derived deterministically from the parent's id and the side taken:
/// `ROOT` → `ROOT_Left` → `ROOT_Left_Right`. Never reassigned.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for NodeId {
    fn from(s: String) -> Self {
        Self(s)
    }
}
