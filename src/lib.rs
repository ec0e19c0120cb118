//! PowerLine - binary-tree placement and compensation ledger
//!
//! New participants spill into a globally shared binary tree, sales volume
//! propagates up the ancestor chain, and matched volume on both legs of a
//! position is converted into commission cycles.
//!
//! # Modules
//!
//! - [`core_types`] - Identifiers and amount aliases (NodeId, Volume, etc.)
//! - [`models`] - Position, TreePath and commission types
//! - [`store`] - TreeStore seam and the in-memory store
//! - [`placement`] - Spillover placement with bounded conflict retry
//! - [`volume`] - Volume propagation up the ancestor chain
//! - [`qualification`] - Binary cycle detection and consumption
//! - [`ledger`] - Append-only commission ledger
//! - [`journal`] - Write-ahead journal and recovery
//! - [`powerline`] - In-process facade
//! - [`csv_io`] - Command scripts and snapshot dumps

// Core types - must be first!
pub mod core_types;

pub mod config;
pub mod error;
pub mod logging;
pub mod models;

// Tree engines
pub mod ledger;
pub mod placement;
pub mod qualification;
pub mod stats;
pub mod store;
pub mod volume;

pub mod csv_io;
pub mod journal;
pub mod powerline;

// Convenient re-exports at crate root
pub use config::AppConfig;
pub use core_types::{Amount, NodeId, PositionNumber, PromoterId, ProspectId, SeqNum, Volume};
pub use error::PowerLineError;
pub use ledger::{CommissionFilter, CommissionLedger, CommissionPage, CommissionSummary};
pub use models::{
    CommissionEvent, CommissionId, CommissionType, Occupant, PlacementMethod, Position, Side,
    TreePath,
};
pub use placement::{PlacementEngine, PlacementRequest};
pub use powerline::{
    InvariantReport, LegSummary, PlacementReceipt, PowerLine, SpilloverOpportunity, TeamStats,
    TreeFragment, VolumeReceipt,
};
pub use qualification::{PotentialEarnings, QualificationEngine, QualificationSummary};
pub use stats::{EngineStats, EngineStatsSnapshot};
pub use store::{MemoryTreeStore, MutationGate, TreeStore};
pub use volume::{VolumeAggregator, VolumePropagation};
