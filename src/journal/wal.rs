//! Journal record format
//!
//! Binary, type-extensible records with:
//! - 20-byte naturally aligned header
//! - CRC32 checksum for integrity
//! - Epoch per process start
//! - bincode serialization for payloads
//!
//! # Header Layout (20 bytes)
//!
//! ```text
//! ┌────────────┬───────────┬────────────────────────────────────┐
//! │ payload_len│ 2 bytes   │ Payload size (max 64KB)            │
//! │ entry_type │ 1 byte    │ Event type (PositionCreated/...)   │
//! │ version    │ 1 byte    │ Payload format version (0-255)     │
//! │ epoch      │ 4 bytes   │ Process start counter              │
//! │ seq_id     │ 8 bytes   │ Monotonic sequence across epochs   │
//! │ checksum   │ 4 bytes   │ CRC32 of payload                   │
//! └────────────┴───────────┴────────────────────────────────────┘
//! ```

use chrono::{DateTime, Utc};
use crc32fast::Hasher;
use serde::{Deserialize, Serialize};
use std::io::{self, Read, Write};

use crate::core_types::{Amount, NodeId, PositionNumber, PromoterId, ProspectId, SeqNum, Volume};
use crate::models::{CommissionType, Occupant, QualificationWindow, Side};

/// Header size in bytes
pub const JOURNAL_HEADER_SIZE: usize = 20;

// ============================================================
// HEADER
// ============================================================

/// Decoded record header; fields are written little-endian in the order
/// of the layout table above.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JournalHeader {
    pub payload_len: u16,
    pub entry_type: u8,
    pub version: u8,
    pub epoch: u32,
    pub seq_id: SeqNum,
    pub checksum: u32,
}

impl JournalHeader {
    pub fn new(entry_type: JournalEntryType, epoch: u32, seq_id: SeqNum, payload: &[u8]) -> Self {
        Self {
            payload_len: payload.len() as u16,
            entry_type: entry_type as u8,
            version: 0,
            epoch,
            seq_id,
            checksum: crc32_checksum(payload),
        }
    }

    pub fn to_bytes(&self) -> [u8; JOURNAL_HEADER_SIZE] {
        let mut buf = [0u8; JOURNAL_HEADER_SIZE];
        let fields: [&[u8]; 6] = [
            &self.payload_len.to_le_bytes(),
            &[self.entry_type],
            &[self.version],
            &self.epoch.to_le_bytes(),
            &self.seq_id.to_le_bytes(),
            &self.checksum.to_le_bytes(),
        ];
        let mut at = 0;
        for field in fields {
            buf[at..at + field.len()].copy_from_slice(field);
            at += field.len();
        }
        buf
    }

    pub fn from_bytes(buf: &[u8; JOURNAL_HEADER_SIZE]) -> Self {
        fn take<const N: usize>(buf: &[u8], at: &mut usize) -> [u8; N] {
            let mut out = [0u8; N];
            out.copy_from_slice(&buf[*at..*at + N]);
            *at += N;
            out
        }

        let mut at = 0;
        Self {
            payload_len: u16::from_le_bytes(take(buf, &mut at)),
            entry_type: take::<1>(buf, &mut at)[0],
            version: take::<1>(buf, &mut at)[0],
            epoch: u32::from_le_bytes(take(buf, &mut at)),
            seq_id: u64::from_le_bytes(take(buf, &mut at)),
            checksum: u32::from_le_bytes(take(buf, &mut at)),
        }
    }

    pub fn verify_checksum(&self, payload: &[u8]) -> bool {
        self.checksum == crc32_checksum(payload)
    }
}

// ============================================================
// ENTRY TYPES
// ============================================================

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JournalEntryType {
    PositionCreated = 1,
    OccupantAssigned = 2,
    ActiveChanged = 3,
    VolumeApplied = 4,
    CycleCompleted = 5,
}

impl TryFrom<u8> for JournalEntryType {
    type Error = io::Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::PositionCreated),
            2 => Ok(Self::OccupantAssigned),
            3 => Ok(Self::ActiveChanged),
            4 => Ok(Self::VolumeApplied),
            5 => Ok(Self::CycleCompleted),
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("Unknown JournalEntryType: {}", value),
            )),
        }
    }
}

// ============================================================
// PAYLOADS
// ============================================================

/// entry_type = 1: the claim that created a node.
///
/// Records reference nodes by position number; ids and paths are derived
/// from the parent chain on recovery, so record size does not grow with depth.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PositionCreatedPayload {
    pub position_number: PositionNumber,
    /// Parent's position number and the slot taken; `None` for the root
    pub parent: Option<(PositionNumber, Side)>,
    /// Root only
    pub root_id: Option<NodeId>,
    pub reserved_for: Option<ProspectId>,
    pub created_at: DateTime<Utc>,
}

/// entry_type = 2
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OccupantAssignedPayload {
    pub position_number: PositionNumber,
    pub occupant: Occupant,
}

/// entry_type = 3
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ActiveChangedPayload {
    pub position_number: PositionNumber,
    pub is_active: bool,
}

/// entry_type = 4: written before the delta is propagated
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VolumeAppliedPayload {
    pub position_number: PositionNumber,
    pub delta: Volume,
}

/// entry_type = 5: one matched cycle and the commission it paid
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CycleCompletedPayload {
    pub position_number: PositionNumber,
    pub cycle_number: u64,
    pub recipient: PromoterId,
    pub amount: Amount,
    pub commission_type: CommissionType,
    pub created_at: DateTime<Utc>,
    /// Ledger sequence of the commission
    pub seq: SeqNum,
    pub cycle_volume: Volume,
    pub window: Option<QualificationWindow>,
}

#[inline]
pub fn crc32_checksum(data: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(data);
    hasher.finalize()
}

// ============================================================
// WRITER
// ============================================================

pub struct JournalWriter<W: Write> {
    writer: W,
    epoch: u32,
    next_seq: SeqNum,
}

impl<W: Write> JournalWriter<W> {
    pub fn new(writer: W, epoch: u32, start_seq: SeqNum) -> Self {
        Self {
            writer,
            epoch,
            next_seq: start_seq,
        }
    }

    /// Write one record and flush it
    pub fn write_entry(
        &mut self,
        entry_type: JournalEntryType,
        payload: &[u8],
    ) -> io::Result<SeqNum> {
        if payload.len() > u16::MAX as usize {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("journal payload too large: {} bytes", payload.len()),
            ));
        }

        let seq_id = self.next_seq;
        let header = JournalHeader::new(entry_type, self.epoch, seq_id, payload);
        self.writer.write_all(&header.to_bytes())?;
        self.writer.write_all(payload)?;
        self.writer.flush()?;
        self.next_seq += 1;

        Ok(seq_id)
    }

    pub fn epoch(&self) -> u32 {
        self.epoch
    }

    pub fn next_seq(&self) -> SeqNum {
        self.next_seq
    }
}

// ============================================================
// READER
// ============================================================

pub struct JournalReader<R: Read> {
    reader: R,
    /// Bytes consumed by complete, verified records
    valid_len: u64,
    torn_tail: bool,
}

#[derive(Debug)]
pub struct JournalEntry {
    pub header: JournalHeader,
    pub payload: Vec<u8>,
}

impl<R: Read> JournalReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            valid_len: 0,
            torn_tail: false,
        }
    }

    /// Read the next record; `None` at EOF or at a torn trailing record
    pub fn read_entry(&mut self) -> io::Result<Option<JournalEntry>> {
        let mut header_buf = [0u8; JOURNAL_HEADER_SIZE];
        match read_full(&mut self.reader, &mut header_buf)? {
            0 => return Ok(None),
            n if n < JOURNAL_HEADER_SIZE => {
                self.torn_tail = true;
                return Ok(None);
            }
            _ => {}
        }

        let header = JournalHeader::from_bytes(&header_buf);

        let mut payload = vec![0u8; header.payload_len as usize];
        if read_full(&mut self.reader, &mut payload)? < payload.len() {
            self.torn_tail = true;
            return Ok(None);
        }

        if !header.verify_checksum(&payload) {
            let seq_id = header.seq_id;
            let expected = header.checksum;
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "CRC32 checksum mismatch at seq_id={}, expected={}, got={}",
                    seq_id,
                    expected,
                    crc32_checksum(&payload)
                ),
            ));
        }

        self.valid_len += (JOURNAL_HEADER_SIZE + payload.len()) as u64;
        Ok(Some(JournalEntry { header, payload }))
    }

    pub fn valid_len(&self) -> u64 {
        self.valid_len
    }

    /// Whether reading stopped at an incomplete trailing record
    pub fn torn_tail(&self) -> bool {
        self.torn_tail
    }
}

/// Read until `buf` is full or EOF; returns bytes read
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_header_layout() {
        let header = JournalHeader::new(JournalEntryType::CycleCompleted, 3, 0x0102, b"abc");
        let bytes = header.to_bytes();
        assert_eq!(&bytes[0..2], &3u16.to_le_bytes());
        assert_eq!(bytes[2], 5);
        assert_eq!(&bytes[4..8], &3u32.to_le_bytes());
        assert_eq!(&bytes[8..16], &0x0102u64.to_le_bytes());
        assert_eq!(&bytes[16..20], &crc32_checksum(b"abc").to_le_bytes());
        assert_eq!(JournalHeader::from_bytes(&bytes), header);
    }

    #[test]
    fn test_write_then_read_volume_entries() {
        let mut buffer = Vec::new();
        {
            let mut writer = JournalWriter::new(&mut buffer, 1, 1);
            let payload = bincode::serialize(&VolumeAppliedPayload {
                position_number: 2,
                delta: 100,
            })
            .unwrap();
            assert_eq!(
                writer
                    .write_entry(JournalEntryType::VolumeApplied, &payload)
                    .unwrap(),
                1
            );
            assert_eq!(writer.next_seq(), 2);
        }

        let mut reader = JournalReader::new(Cursor::new(&buffer));
        let entry = reader.read_entry().unwrap().expect("entry");
        assert_eq!(entry.header.entry_type, JournalEntryType::VolumeApplied as u8);
        let decoded: VolumeAppliedPayload = bincode::deserialize(&entry.payload).unwrap();
        assert_eq!(decoded.delta, 100);
        assert!(reader.read_entry().unwrap().is_none());
        assert!(!reader.torn_tail());
        assert_eq!(reader.valid_len(), buffer.len() as u64);
    }

    #[test]
    fn test_corrupted_checksum_detection() {
        let mut buffer = Vec::new();
        {
            let mut writer = JournalWriter::new(&mut buffer, 1, 1);
            writer
                .write_entry(JournalEntryType::ActiveChanged, b"payload")
                .unwrap();
        }
        buffer[JOURNAL_HEADER_SIZE] ^= 0xFF;

        let mut reader = JournalReader::new(Cursor::new(&buffer));
        let err = reader.read_entry().unwrap_err();
        assert!(err.to_string().contains("CRC32 checksum mismatch"));
    }

    #[test]
    fn test_torn_tail_is_not_an_error() {
        let mut buffer = Vec::new();
        {
            let mut writer = JournalWriter::new(&mut buffer, 1, 1);
            writer
                .write_entry(JournalEntryType::ActiveChanged, b"first")
                .unwrap();
            writer
                .write_entry(JournalEntryType::ActiveChanged, b"second")
                .unwrap();
        }
        let complete_first = (JOURNAL_HEADER_SIZE + 5) as u64;
        buffer.truncate(buffer.len() - 3);

        let mut reader = JournalReader::new(Cursor::new(&buffer));
        assert!(reader.read_entry().unwrap().is_some());
        assert!(reader.read_entry().unwrap().is_none());
        assert!(reader.torn_tail());
        assert_eq!(reader.valid_len(), complete_first);
    }

    #[test]
    fn test_unknown_entry_type() {
        assert!(JournalEntryType::try_from(0).is_err());
        assert_eq!(
            JournalEntryType::try_from(5).unwrap(),
            JournalEntryType::CycleCompleted
        );
    }
}
