//! Journal Recovery
//!
//! Rebuilds tree and ledger state from the journal.
//!
//! Recovery flow:
//! 1. Read every verified record; a torn trailing record ends the scan
//! 2. Rebuild positions from `PositionCreated` claims (ids and paths follow
//!    from the parent chain), linking child pointers as they appear
//! 3. Apply occupant / active changes
//! 4. Fold all `VolumeApplied` deltas (personal + every ancestor leg)
//! 5. Deduct matched volume of every `CycleCompleted`, rebuild the ledger
//! 6. Recompute subtree sizes from occupancy
//!
//! Volume increments and cycle deductions commute, so step 4 and 5 are
//! folded rather than replayed in journal order. A cycle can only be
//! journaled after the volume that enabled it, so the final legs never go
//! negative on a healthy journal.

use rustc_hash::FxHashMap;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use super::JOURNAL_FILE;
use super::wal::{
    ActiveChangedPayload, CycleCompletedPayload, JournalEntryType, JournalReader,
    OccupantAssignedPayload, PositionCreatedPayload, VolumeAppliedPayload,
};
use crate::core_types::{PositionNumber, SeqNum, Volume};
use crate::error::PowerLineError;
use crate::models::{CommissionEvent, CommissionId, Position, Side};

// ============================================================
// Recovery State
// ============================================================

#[derive(Debug, Default)]
pub struct RecoveredState {
    /// Ascending by position number
    pub positions: Vec<Position>,
    pub next_position_number: PositionNumber,
    /// Ascending by ledger sequence
    pub commissions: Vec<CommissionEvent>,
    /// Next journal sequence id
    pub next_seq: SeqNum,
    pub last_epoch: u32,
    /// Length of the verified journal prefix
    pub valid_len: u64,
    pub entries_replayed: u64,
}

pub struct JournalRecovery {
    data_dir: PathBuf,
}

impl JournalRecovery {
    pub fn new(data_dir: impl AsRef<Path>) -> Self {
        Self {
            data_dir: data_dir.as_ref().to_path_buf(),
        }
    }

    pub fn recover(&self) -> Result<RecoveredState, PowerLineError> {
        let journal_file = self.data_dir.join(JOURNAL_FILE);
        if !journal_file.exists() {
            tracing::info!(dir = %self.data_dir.display(), "No journal found, cold start");
            return Ok(RecoveredState {
                next_position_number: 1,
                next_seq: 1,
                ..Default::default()
            });
        }

        let mut reader = JournalReader::new(BufReader::new(File::open(&journal_file)?));
        let mut fold = Fold::default();
        let mut next_seq: SeqNum = 1;
        let mut last_epoch = 0;
        let mut entries_replayed = 0u64;

        while let Some(entry) = reader.read_entry()? {
            let header = entry.header;
            let seq_id = header.seq_id;
            let epoch = header.epoch;
            let entry_type = JournalEntryType::try_from(header.entry_type)?;
            fold.apply(entry_type, &entry.payload)?;
            next_seq = seq_id + 1;
            last_epoch = last_epoch.max(epoch);
            entries_replayed += 1;
        }

        if reader.torn_tail() {
            tracing::warn!(
                valid_len = reader.valid_len(),
                "Journal ends with an incomplete record, ignoring it"
            );
        }

        let (positions, commissions) = fold.finish()?;
        let next_position_number = positions
            .last()
            .map(|p| p.position_number + 1)
            .unwrap_or(1);

        tracing::info!(
            positions = positions.len(),
            commissions = commissions.len(),
            entries_replayed,
            "Recovered PowerLine state from journal"
        );

        Ok(RecoveredState {
            positions,
            next_position_number,
            commissions,
            next_seq,
            last_epoch,
            valid_len: reader.valid_len(),
            entries_replayed,
        })
    }
}

// ============================================================
// Fold
// ============================================================

#[derive(Default)]
struct Fold {
    positions: FxHashMap<PositionNumber, Position>,
    /// child → (parent, side taken from the parent)
    links: FxHashMap<PositionNumber, (PositionNumber, Side)>,
    volumes: Vec<VolumeAppliedPayload>,
    cycles: Vec<CycleCompletedPayload>,
}

impl Fold {
    fn apply(&mut self, entry_type: JournalEntryType, payload: &[u8]) -> Result<(), PowerLineError> {
        match entry_type {
            JournalEntryType::PositionCreated => {
                let p: PositionCreatedPayload = bincode::deserialize(payload)?;
                self.create(p)?;
            }
            JournalEntryType::OccupantAssigned => {
                let p: OccupantAssignedPayload = bincode::deserialize(payload)?;
                self.position_mut(p.position_number)?.occupant = Some(p.occupant);
            }
            JournalEntryType::ActiveChanged => {
                let p: ActiveChangedPayload = bincode::deserialize(payload)?;
                if let Some(occupant) = self.position_mut(p.position_number)?.occupant.as_mut() {
                    occupant.is_active = p.is_active;
                }
            }
            JournalEntryType::VolumeApplied => {
                self.volumes.push(bincode::deserialize(payload)?);
            }
            JournalEntryType::CycleCompleted => {
                self.cycles.push(bincode::deserialize(payload)?);
            }
        }
        Ok(())
    }

    /// Rebuild a node from its claim; the parent's record always precedes it
    fn create(&mut self, p: PositionCreatedPayload) -> Result<(), PowerLineError> {
        if self.positions.contains_key(&p.position_number) {
            return Err(PowerLineError::InternalConsistency(format!(
                "position number {} created twice in journal",
                p.position_number
            )));
        }

        let mut position = match (p.parent, p.root_id) {
            (Some((parent_number, side)), None) => {
                let parent = self.position_mut(parent_number)?;
                if !parent.is_open(side) {
                    return Err(PowerLineError::InternalConsistency(format!(
                        "{} {} slot claimed twice in journal",
                        parent.node_id, side
                    )));
                }
                let child = Position::child_of(parent, side, p.created_at);
                *parent.child_slot_mut(side) = Some(child.node_id.clone());
                self.links.insert(p.position_number, (parent_number, side));
                child
            }
            (None, Some(root_id)) => {
                if self.positions.values().any(|existing| existing.path.is_root()) {
                    return Err(PowerLineError::InternalConsistency(format!(
                        "second root {root_id} in journal"
                    )));
                }
                Position::root(root_id, p.position_number, p.created_at)
            }
            _ => {
                return Err(PowerLineError::InternalConsistency(format!(
                    "position number {} has a malformed creation record",
                    p.position_number
                )));
            }
        };
        position.position_number = p.position_number;
        position.reserved_for = p.reserved_for;
        self.positions.insert(p.position_number, position);
        Ok(())
    }

    fn position_mut(&mut self, number: PositionNumber) -> Result<&mut Position, PowerLineError> {
        self.positions.get_mut(&number).ok_or_else(|| {
            PowerLineError::InternalConsistency(format!(
                "journal references unknown position number {number}"
            ))
        })
    }

    fn finish(mut self) -> Result<(Vec<Position>, Vec<CommissionEvent>), PowerLineError> {
        for volume in std::mem::take(&mut self.volumes) {
            self.fold_volume(volume.position_number, volume.delta)?;
        }

        let mut cycles = std::mem::take(&mut self.cycles);
        cycles.sort_by_key(|c| c.seq);
        let mut commissions = Vec::with_capacity(cycles.len());
        for cycle in cycles {
            let position = self.position_mut(cycle.position_number)?;
            let id = CommissionId {
                node_id: position.node_id.clone(),
                cycle_number: cycle.cycle_number,
            };
            for leg in [&mut position.left_leg_volume, &mut position.right_leg_volume] {
                *leg = leg.checked_sub(cycle.cycle_volume).ok_or_else(|| {
                    PowerLineError::InternalConsistency(format!(
                        "cycle {id} deducts more than the node holds"
                    ))
                })?;
            }
            if cycle.cycle_number > position.cycles_completed {
                position.cycles_completed = cycle.cycle_number;
                position.window = cycle.window;
            }
            commissions.push(CommissionEvent {
                id,
                recipient: cycle.recipient,
                amount: cycle.amount,
                commission_type: cycle.commission_type,
                created_at: cycle.created_at,
                seq: cycle.seq,
            });
        }

        let occupied: Vec<PositionNumber> = self
            .positions
            .values()
            .filter(|p| !p.is_vacant())
            .map(|p| p.position_number)
            .collect();
        for number in occupied {
            let mut cursor = number;
            while let Some(&(parent, _)) = self.links.get(&cursor) {
                self.position_mut(parent)?.subtree_size += 1;
                cursor = parent;
            }
        }

        let mut positions: Vec<Position> = self.positions.into_values().collect();
        positions.sort_by_key(|p| p.position_number);
        Ok((positions, commissions))
    }

    fn fold_volume(&mut self, number: PositionNumber, delta: Volume) -> Result<(), PowerLineError> {
        let target = self.position_mut(number)?;
        target.personal_volume = target
            .personal_volume
            .checked_add(delta)
            .ok_or_else(|| PowerLineError::VolumeOverflow(target.node_id.clone()))?;

        let mut cursor = number;
        while let Some(&(parent_number, side)) = self.links.get(&cursor) {
            let parent = self.position_mut(parent_number)?;
            let parent_id = parent.node_id.clone();
            let leg = parent.leg_volume_mut(side);
            *leg = leg
                .checked_add(delta)
                .ok_or(PowerLineError::VolumeOverflow(parent_id))?;
            cursor = parent_number;
        }
        Ok(())
    }
}
