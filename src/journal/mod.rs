//! Journal - durable record of every tree mutation
//!
//! The in-memory store is the working state; the journal is what survives a
//! restart. Every mutation is journaled inside the same exclusive section
//! that applies it, before the change becomes visible:
//!
//! ```text
//! place()        → PositionCreated   (under parent section)
//! enroll()       → OccupantAssigned  (under node section)
//! set_active()   → ActiveChanged     (under node section)
//! apply_volume() → VolumeApplied     (before propagation starts)
//! evaluate()     → CycleCompleted    (under node section, per cycle)
//! ```
//!
//! Recovery folds the records back into node states (see [`recovery`]).

pub mod recovery;
pub mod wal;

pub use recovery::{JournalRecovery, RecoveredState};
pub use wal::{JournalEntryType, JournalReader, JournalWriter};

use serde::Serialize;
use std::fs::{File, OpenOptions};
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use crate::core_types::{PositionNumber, SeqNum, Volume};
use crate::error::PowerLineError;
use crate::models::{CommissionEvent, Occupant, Position, QualificationWindow};
use wal::{
    ActiveChangedPayload, CycleCompletedPayload, OccupantAssignedPayload, PositionCreatedPayload,
    VolumeAppliedPayload,
};

pub const JOURNAL_FILE: &str = "current.journal";

/// Thread-safe journal appender
pub struct Journal {
    writer: Mutex<JournalWriter<BufWriter<File>>>,
    path: PathBuf,
}

impl Journal {
    /// Open the journal for appending after recovery.
    ///
    /// `valid_len` comes from recovery; anything after it (a torn record)
    /// is cut off before the first append.
    pub fn open(
        data_dir: impl AsRef<Path>,
        epoch: u32,
        next_seq: SeqNum,
        valid_len: u64,
    ) -> Result<Self, PowerLineError> {
        std::fs::create_dir_all(data_dir.as_ref())?;
        let path = data_dir.as_ref().join(JOURNAL_FILE);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;
        if file.metadata()?.len() > valid_len {
            tracing::warn!(
                path = %path.display(),
                valid_len,
                "Truncating torn journal tail"
            );
            file.set_len(valid_len)?;
        }

        Ok(Self {
            writer: Mutex::new(JournalWriter::new(BufWriter::new(file), epoch, next_seq)),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn next_seq(&self) -> SeqNum {
        self.writer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .next_seq()
    }

    fn append<T: Serialize>(
        &self,
        entry_type: JournalEntryType,
        payload: &T,
    ) -> Result<SeqNum, PowerLineError> {
        let bytes = bincode::serialize(payload)?;
        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(writer.write_entry(entry_type, &bytes)?)
    }

    /// Record a claimed node. `parent_number` is required for every
    /// non-root position.
    pub fn position_created(
        &self,
        position: &Position,
        parent_number: Option<PositionNumber>,
    ) -> Result<SeqNum, PowerLineError> {
        let (parent, root_id) = match (position.side, parent_number) {
            (Some(side), Some(number)) => (Some((number, side)), None),
            (None, None) => (None, Some(position.node_id.clone())),
            _ => {
                return Err(PowerLineError::InternalConsistency(format!(
                    "cannot journal {}: parent link and side disagree",
                    position.node_id
                )));
            }
        };
        self.append(
            JournalEntryType::PositionCreated,
            &PositionCreatedPayload {
                position_number: position.position_number,
                parent,
                root_id,
                reserved_for: position.reserved_for,
                created_at: position.created_at,
            },
        )
    }

    pub fn occupant_assigned(
        &self,
        position_number: PositionNumber,
        occupant: &Occupant,
    ) -> Result<SeqNum, PowerLineError> {
        self.append(
            JournalEntryType::OccupantAssigned,
            &OccupantAssignedPayload {
                position_number,
                occupant: occupant.clone(),
            },
        )
    }

    pub fn active_changed(
        &self,
        position_number: PositionNumber,
        is_active: bool,
    ) -> Result<SeqNum, PowerLineError> {
        self.append(
            JournalEntryType::ActiveChanged,
            &ActiveChangedPayload {
                position_number,
                is_active,
            },
        )
    }

    pub fn volume_applied(
        &self,
        position_number: PositionNumber,
        delta: Volume,
    ) -> Result<SeqNum, PowerLineError> {
        self.append(
            JournalEntryType::VolumeApplied,
            &VolumeAppliedPayload {
                position_number,
                delta,
            },
        )
    }

    /// Record one cycle of `event` (already sequenced by the ledger)
    pub fn cycle_completed(
        &self,
        event: &CommissionEvent,
        position_number: PositionNumber,
        cycle_volume: Volume,
        window: Option<QualificationWindow>,
    ) -> Result<SeqNum, PowerLineError> {
        self.append(
            JournalEntryType::CycleCompleted,
            &CycleCompletedPayload {
                position_number,
                cycle_number: event.id.cycle_number,
                recipient: event.recipient,
                amount: event.amount,
                commission_type: event.commission_type,
                created_at: event.created_at,
                seq: event.seq,
                cycle_volume,
                window,
            },
        )
    }
}
