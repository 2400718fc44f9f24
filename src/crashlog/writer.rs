//! Crash log writer
//!
//! Brackets one batch of slot mutations. Every undo entry reaches the file
//! before the slot word it describes is overwritten.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::config::LogSyncStrategy;
use crate::error::{FlatError, Result};
use crate::heap::{SlotField, SlotIndex};
use crate::index::SlotJournal;

use super::{LogEntry, LogOp, LOG_FILENAME};

/// Undo log of the batch in flight
pub struct CrashLog {
    path: PathBuf,

    /// Open only between `begin` and `end`
    file: Option<File>,

    sync_strategy: LogSyncStrategy,

    next_seq: u64,
    batches: u64,
    unsynced: usize,
}

impl CrashLog {
    pub fn new(dir: &Path, sync_strategy: LogSyncStrategy) -> Self {
        Self {
            path: dir.join(LOG_FILENAME),
            file: None,
            sync_strategy,
            next_seq: 0,
            batches: 0,
            unsynced: 0,
        }
    }

    /// Open a log for a new batch
    pub fn begin(&mut self) -> Result<()> {
        if self.file.is_some() {
            return Err(FlatError::NestedBatch);
        }

        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&self.path)?;
        let batch = self.batches + 1;
        let frame = LogEntry::new(0, LogOp::Begin { batch }).encode()?;
        file.write_all(&frame)?;
        // The log must exist on disk before the first mutation
        file.sync_data()?;

        // Only a fully written Begin opens the batch
        self.file = Some(file);
        self.batches = batch;
        self.next_seq = 1;
        self.unsynced = 0;
        tracing::trace!(batch, "Crash log opened");
        Ok(())
    }

    /// Finish the batch and delete the log
    ///
    /// The caller syncs the heap first; once the log is gone the batch can no
    /// longer be undone.
    pub fn end(&mut self) -> Result<()> {
        let file = self.file.take().ok_or(FlatError::NoOpenBatch)?;
        drop(file);
        fs::remove_file(&self.path)?;
        tracing::trace!(
            batch = self.batches,
            entries = self.next_seq,
            "Crash log closed"
        );
        Ok(())
    }

    /// Whether a batch is in flight
    pub fn is_open(&self) -> bool {
        self.file.is_some()
    }

    /// Whether a log file is present on disk
    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Entries written in the current batch, `Begin` included
    pub fn entries(&self) -> u64 {
        self.next_seq
    }

    /// Drop the handle without deleting the file
    ///
    /// The log stays on disk for `LogRecovery::replay`.
    pub fn abandon(&mut self) {
        self.file = None;
    }

    fn append(&mut self, op: LogOp) -> Result<()> {
        let entry = LogEntry::new(self.next_seq, op);
        let frame = entry.encode()?;
        let file = self.file.as_mut().ok_or(FlatError::NoOpenBatch)?;
        file.write_all(&frame)?;
        self.next_seq += 1;
        self.unsynced += 1;

        let due = match self.sync_strategy {
            LogSyncStrategy::EveryEntry => true,
            LogSyncStrategy::EveryNEntries { count } => self.unsynced >= count,
        };
        if due {
            self.sync()?;
        }
        Ok(())
    }

    fn sync(&mut self) -> Result<()> {
        if let Some(file) = self.file.as_mut() {
            file.sync_data()?;
        }
        self.unsynced = 0;
        Ok(())
    }
}

impl SlotJournal for CrashLog {
    fn record(&mut self, slot: SlotIndex, field: SlotField, previous: u64) -> Result<()> {
        self.append(LogOp::SlotWrite {
            slot,
            field,
            previous,
        })
    }
}
