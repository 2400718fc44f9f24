//! Crash log recovery
//!
//! Undoes an interrupted batch at startup.

use std::fs;
use std::path::Path;

use crate::error::{FlatError, Result};
use crate::heap::{HeapAllocator, HeapWriter};

use super::{Frame, LogEntry, LogOp, LOG_FILENAME};

/// Handles crash log replay on open
pub struct LogRecovery;

/// Result of a recovery operation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Slot writes undone
    pub entries_replayed: u64,

    /// Whether a partially written final frame was discarded
    pub torn_tail: bool,

    /// Batch number from the `Begin` entry, if it was written
    pub batch: Option<u64>,
}

impl LogRecovery {
    /// Read every valid entry of a log file
    ///
    /// A torn or corrupt final frame is dropped: its mutation was never
    /// applied. A corrupt frame followed by more data is fatal.
    pub fn read(path: &Path) -> Result<(Vec<LogEntry>, bool)> {
        let data = fs::read(path)?;
        let mut entries = Vec::new();
        let mut pos = 0;
        let mut torn_tail = false;

        while pos < data.len() {
            match LogEntry::decode(&data[pos..]) {
                Frame::Entry(entry, len) => {
                    if entry.seq != entries.len() as u64 {
                        return Err(FlatError::Corruption(format!(
                            "crash log entry {} out of sequence (expected {})",
                            entry.seq,
                            entries.len()
                        )));
                    }
                    entries.push(entry);
                    pos += len;
                }
                Frame::Torn => {
                    torn_tail = true;
                    break;
                }
                Frame::Invalid { len } if pos + len == data.len() => {
                    torn_tail = true;
                    break;
                }
                Frame::Invalid { .. } => {
                    return Err(FlatError::Corruption(format!(
                        "crash log frame at byte {} fails its checksum",
                        pos
                    )));
                }
            }
        }

        if let Some(first) = entries.first() {
            if !matches!(first.op, LogOp::Begin { .. }) {
                return Err(FlatError::Corruption(
                    "crash log does not start with a batch marker".into(),
                ));
            }
        }
        Ok((entries, torn_tail))
    }

    /// Undo the batch recorded in `dir`, if any
    ///
    /// Restores every logged slot word in reverse order, syncs the heap and
    /// deletes the log. Safe to repeat if interrupted.
    pub fn replay(
        dir: &Path,
        heap: &HeapAllocator,
        writer: &mut HeapWriter,
    ) -> Result<Option<RecoveryReport>> {
        let path = dir.join(LOG_FILENAME);
        if !path.exists() {
            return Ok(None);
        }

        let (entries, torn_tail) = Self::read(&path)?;
        let mut report = RecoveryReport {
            torn_tail,
            ..RecoveryReport::default()
        };

        for entry in entries.iter().rev() {
            match entry.op {
                LogOp::Begin { batch } => report.batch = Some(batch),
                LogOp::SlotWrite {
                    slot,
                    field,
                    previous,
                } => {
                    heap.store_slot_word(writer, slot, field, previous)?;
                    report.entries_replayed += 1;
                }
            }
        }

        heap.sync()?;
        fs::remove_file(&path)?;

        tracing::info!(
            entries = report.entries_replayed,
            torn_tail = report.torn_tail,
            batch = ?report.batch,
            "Rolled back interrupted batch"
        );
        Ok(Some(report))
    }
}
