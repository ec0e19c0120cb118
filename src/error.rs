//! PowerLine Error Types
//!
//! One error enum for the whole core. Codes are stable strings for the
//! surrounding service; `http_status` is a hint for the HTTP layer.

use thiserror::Error;

use crate::core_types::NodeId;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PowerLineError {
    // === Lookup Errors ===
    #[error("Position not found: {0}")]
    PositionNotFound(NodeId),

    // === Business Conditions ===
    #[error("No available slot under {anchor}")]
    NoAvailableSlot { anchor: NodeId },

    #[error("Position already occupied: {0}")]
    AlreadyOccupied(NodeId),

    #[error("Position is vacant: {0}")]
    VacantPosition(NodeId),

    #[error("Promoter {promoter_id} already holds {node_id}")]
    PromoterAlreadyPlaced { promoter_id: u64, node_id: NodeId },

    // === Transient ===
    #[error("Placement under {anchor} lost the slot race {attempts} times")]
    ConcurrentPlacementConflict { anchor: NodeId, attempts: u32 },

    // === Caller Errors ===
    #[error("Volume must not be negative: {0}")]
    NegativeVolume(i64),

    #[error("Volume would overflow at {0}")]
    VolumeOverflow(NodeId),

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // === Idempotency ===
    #[error("Commission already recorded: {0}")]
    QualificationReplay(String),

    // === System Errors ===
    #[error("Internal consistency failure: {0}")]
    InternalConsistency(String),

    #[error("Journal error: {0}")]
    Journal(String),
}

impl PowerLineError {
    /// Get the error code for API responses
    pub fn code(&self) -> &'static str {
        match self {
            PowerLineError::PositionNotFound(_) => "POSITION_NOT_FOUND",
            PowerLineError::NoAvailableSlot { .. } => "NO_AVAILABLE_SLOT",
            PowerLineError::AlreadyOccupied(_) => "ALREADY_OCCUPIED",
            PowerLineError::VacantPosition(_) => "POSITION_VACANT",
            PowerLineError::PromoterAlreadyPlaced { .. } => "PROMOTER_ALREADY_PLACED",
            PowerLineError::ConcurrentPlacementConflict { .. } => "CONCURRENT_PLACEMENT_CONFLICT",
            PowerLineError::NegativeVolume(_) => "NEGATIVE_VOLUME",
            PowerLineError::VolumeOverflow(_) => "VOLUME_OVERFLOW",
            PowerLineError::InvalidPath(_) => "INVALID_PATH",
            PowerLineError::InvalidConfig(_) => "INVALID_CONFIG",
            PowerLineError::QualificationReplay(_) => "QUALIFICATION_REPLAY",
            PowerLineError::InternalConsistency(_) => "INTERNAL_CONSISTENCY",
            PowerLineError::Journal(_) => "JOURNAL_ERROR",
        }
    }

    /// Get HTTP status code suggestion
    pub fn http_status(&self) -> u16 {
        match self {
            PowerLineError::PositionNotFound(_) => 404,
            PowerLineError::NegativeVolume(_)
            | PowerLineError::VolumeOverflow(_)
            | PowerLineError::InvalidPath(_)
            | PowerLineError::InvalidConfig(_) => 400,
            PowerLineError::AlreadyOccupied(_)
            | PowerLineError::VacantPosition(_)
            | PowerLineError::PromoterAlreadyPlaced { .. }
            | PowerLineError::ConcurrentPlacementConflict { .. } => 409,
            PowerLineError::NoAvailableSlot { .. } => 422,
            PowerLineError::QualificationReplay(_) => 200,
            PowerLineError::InternalConsistency(_) | PowerLineError::Journal(_) => 500,
        }
    }

    /// Transient errors the caller may retry
    pub fn is_retryable(&self) -> bool {
        matches!(self, PowerLineError::ConcurrentPlacementConflict { .. })
    }
}

impl From<std::io::Error> for PowerLineError {
    fn from(e: std::io::Error) -> Self {
        PowerLineError::Journal(e.to_string())
    }
}

impl From<bincode::Error> for PowerLineError {
    fn from(e: bincode::Error) -> Self {
        PowerLineError::Journal(e.to_string())
    }
}
