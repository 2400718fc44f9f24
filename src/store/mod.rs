//! Heap Store Module
//!
//! The persistent `Backend`: hash index + heap files + crash log, owned by
//! one process through the directory lock.
//!
//! ## Open Sequence
//! ```text
//! lock .lock ─▶ open aux.kv ─▶ create or open heap.idx/heap.dat
//!                                   │
//!                                   ▼
//!                 check description (migrate v1 when auto_upgrade)
//!                                   │
//!                                   ▼
//!                 heap.log present? ─▶ undo interrupted batch
//!                                   │
//!                                   ▼
//!                 rebuild occupancy ─▶ ready
//! ```
//!
//! ## Concurrency
//! - Reads take the guard's read side, or nothing in `LockFreeReads` mode
//! - Batches, flush and close take the write side
//! - The `HeapWriter` lives inside the guarded state, so holding the write
//!   side is the only way to mutate the heap

mod description;

pub use description::{
    DescriptionSink, HeapDescription, LegacyDescription, StoredDescription, DESCRIPTION_FILENAME,
    DESCRIPTION_KEY, DESCRIPTION_VERSION,
};

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::aux_store::AuxStore;
use crate::backend::{Backend, WriteBatch};
use crate::config::{Config, CreationFlags};
use crate::crashlog::{CrashLog, LogRecovery, RecoveryReport};
use crate::error::{FlatError, Result};
use crate::guard::ConcurrencyGuard;
use crate::hash::{slot_hash, SlotHashFn};
use crate::heap::{HeapAllocator, HeapGeometry, HeapWriter};
use crate::index::{HashIndex, HeapStats, IndexOptions, SlotJournal, Unjournaled};
use crate::lock_file::DirLock;

#[cfg(any(test, feature = "fault-injection"))]
use crate::crashlog::{FailingJournal, FailureTrack};

/// State only the writer touches
struct StoreState {
    writer: HeapWriter,
    log: CrashLog,
    /// Released on close
    lock: Option<DirLock>,
}

/// File-backed hash heap behind the `Backend` contract
///
/// Keys are expected to be content-addressed: a second value for an existing
/// key is ignored (first writer wins).
pub struct HeapStore {
    config: Config,
    index: HashIndex,
    state: ConcurrencyGuard<StoreState>,
    sink: DescriptionSink,
    aux: Option<Arc<AuxStore>>,
    recovery: Option<RecoveryReport>,
    closed: AtomicBool,

    #[cfg(any(test, feature = "fault-injection"))]
    failure: parking_lot::Mutex<Option<FailureTrack>>,
}

impl HeapStore {
    /// Open or create the store in `config.data_dir`
    pub fn open(config: Config) -> Result<Self> {
        Self::open_with_slot_hash(config, slot_hash)
    }

    /// Open with a custom slot hash (tests use it to force collisions)
    pub fn open_with_slot_hash(config: Config, slot_hash: SlotHashFn) -> Result<Self> {
        config.validate()?;
        let dir = config.data_dir.clone();
        let flags = config.flags;

        let lock = DirLock::acquire(&dir)?;

        let aux = if flags.use_db_for_descriptions || flags.support_additional_kv {
            Some(Arc::new(AuxStore::open(&dir, config.read_only)?))
        } else {
            None
        };
        let sink = match &aux {
            Some(aux) if flags.use_db_for_descriptions => DescriptionSink::Aux(Arc::clone(aux)),
            _ => DescriptionSink::File(dir.join(DESCRIPTION_FILENAME)),
        };

        let (heap, mut writer) = if HeapAllocator::exists(&dir) {
            let (heap, writer) = HeapAllocator::open(&dir)?;
            Self::check_description(&config, &sink, heap.geometry())?;
            (heap, writer)
        } else {
            if config.read_only {
                return Err(FlatError::Config(format!(
                    "no heap in {} to open read-only",
                    dir.display()
                )));
            }
            let geometry = HeapGeometry {
                slot_capacity: config.capacity,
                data_capacity: config.planned_heap_bytes(),
                page_size: u64::from(config.page_size),
            };
            // Description first, so heap files never exist without one
            sink.store(&Self::describe(&flags, geometry, 0))?;
            HeapAllocator::create(&dir, geometry)?
        };

        let log = CrashLog::new(&dir, config.log_sync);
        let recovery = if log.exists() {
            if config.read_only {
                return Err(FlatError::Config(
                    "an interrupted batch must be recovered; open read-write first".into(),
                ));
            }
            LogRecovery::replay(&dir, &heap, &mut writer)?
        } else {
            None
        };

        let index = HashIndex::new(heap, IndexOptions::from(&flags)).with_slot_hash(slot_hash);
        let elements = index.rebuild(&mut writer)?;

        tracing::info!(
            path = %dir.display(),
            elements,
            capacity = index.heap().slot_capacity(),
            recovered = recovery.is_some(),
            read_only = config.read_only,
            "Opened heap store"
        );

        Ok(Self {
            state: ConcurrencyGuard::new(
                config.effective_lock_mode(),
                StoreState {
                    writer,
                    log,
                    lock: Some(lock),
                },
            ),
            config,
            index,
            sink,
            aux,
            recovery,
            closed: AtomicBool::new(false),
            #[cfg(any(test, feature = "fault-injection"))]
            failure: parking_lot::Mutex::new(None),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn index(&self) -> &HashIndex {
        &self.index
    }

    /// Aux store opened alongside the heap, if any
    pub fn aux(&self) -> Option<Arc<AuxStore>> {
        self.aux.clone()
    }

    /// What recovery did when this store was opened
    pub fn recovery_report(&self) -> Option<&RecoveryReport> {
        self.recovery.as_ref()
    }

    /// Arm (or disarm with `None`) fault injection for later writes
    #[cfg(any(test, feature = "fault-injection"))]
    pub fn set_failure_track(&self, track: Option<FailureTrack>) {
        *self.failure.lock() = track;
    }

    // =========================================================================
    // Descriptions
    // =========================================================================

    fn describe(flags: &CreationFlags, geometry: HeapGeometry, elements: u64) -> HeapDescription {
        HeapDescription {
            format_bits: flags.format_bits(),
            slot_capacity: geometry.slot_capacity,
            data_capacity: geometry.data_capacity,
            page_size: geometry.page_size as u32,
            elements,
        }
    }

    fn check_description(
        config: &Config,
        sink: &DescriptionSink,
        geometry: HeapGeometry,
    ) -> Result<()> {
        let stored = sink.load()?.ok_or_else(|| {
            FlatError::Corruption("heap files exist but the heap description is missing".into())
        })?;

        let (slot_capacity, data_capacity) = match &stored {
            StoredDescription::Current(d) => (d.slot_capacity, d.data_capacity),
            StoredDescription::Legacy(d) => (d.slot_capacity, d.data_capacity),
        };
        if slot_capacity != geometry.slot_capacity || data_capacity != geometry.data_capacity {
            return Err(FlatError::Corruption(format!(
                "heap description ({} slots, {} bytes) does not match heap files ({} slots, {} bytes)",
                slot_capacity, data_capacity, geometry.slot_capacity, geometry.data_capacity
            )));
        }

        match stored {
            StoredDescription::Current(description) => {
                if u64::from(description.page_size) != geometry.page_size {
                    return Err(FlatError::Corruption(format!(
                        "heap description page size {} does not match heap files ({})",
                        description.page_size, geometry.page_size
                    )));
                }
                let configured = config.flags.format_bits();
                if description.format_bits != configured {
                    return Err(FlatError::Config(format!(
                        "heap was created with format flags {:#x}, configured {:#x}",
                        description.format_bits, configured
                    )));
                }
                Ok(())
            }
            StoredDescription::Legacy(legacy) => {
                if !config.flags.auto_upgrade {
                    return Err(FlatError::Config(
                        "heap description uses format v1; enable auto_upgrade to migrate".into(),
                    ));
                }
                if config.read_only {
                    return Err(FlatError::Config(
                        "cannot migrate a heap description read-only".into(),
                    ));
                }
                sink.store(&Self::describe(&config.flags, geometry, legacy.elements))?;
                tracing::info!(from = 1, to = DESCRIPTION_VERSION, "Upgraded heap description");
                Ok(())
            }
        }
    }

    fn write_description(&self) -> Result<()> {
        let description = Self::describe(
            &self.config.flags,
            self.index.heap().geometry(),
            self.index.element_count(),
        );
        self.sink.store(&description)
    }

    // =========================================================================
    // Batches
    // =========================================================================

    fn apply<J: SlotJournal + ?Sized>(
        &self,
        writer: &mut HeapWriter,
        journal: &mut J,
        batch: &WriteBatch,
    ) -> Result<()> {
        for (key, value) in &batch.writes {
            if !batch.removals.contains(key) {
                self.index
                    .put(writer, journal, key, value)
                    .map_err(|err| err.for_key(key))?;
            }
        }

        if batch.removals.is_empty() {
            return Ok(());
        }
        let options = self.index.options();
        if options.allow_removals {
            for key in &batch.removals {
                self.index.remove(writer, journal, key)?;
            }
        } else if options.support_null_values {
            for key in &batch.removals {
                self.index
                    .put_tombstone(writer, journal, key)
                    .map_err(|err| err.for_key(key))?;
            }
        } else {
            tracing::debug!(
                count = batch.removals.len(),
                "Ignoring removals: heap keeps neither tombstones nor removals"
            );
        }
        Ok(())
    }

    #[cfg(any(test, feature = "fault-injection"))]
    fn apply_logged(&self, state: &mut StoreState, batch: &WriteBatch) -> Result<()> {
        let track = self.failure.lock().clone();
        match track {
            Some(track) => {
                let mut journal = FailingJournal::new(&mut state.log, &track);
                self.apply(&mut state.writer, &mut journal, batch)
            }
            None => self.apply(&mut state.writer, &mut state.log, batch),
        }
    }

    #[cfg(not(any(test, feature = "fault-injection")))]
    fn apply_logged(&self, state: &mut StoreState, batch: &WriteBatch) -> Result<()> {
        self.apply(&mut state.writer, &mut state.log, batch)
    }

    #[cfg(any(test, feature = "fault-injection"))]
    fn failure_point(&self) -> Result<()> {
        match self.failure.lock().as_ref() {
            Some(track) => track.check(),
            None => Ok(()),
        }
    }

    #[cfg(not(any(test, feature = "fault-injection")))]
    fn failure_point(&self) -> Result<()> {
        Ok(())
    }

    /// Undo a failed logged batch in place; returns the error to report
    fn abort_batch(&self, state: &mut StoreState, err: FlatError) -> FlatError {
        if is_injected(&err) {
            // Simulated crash: leave everything for recovery on reopen
            return err;
        }

        state.log.abandon();
        let heap = self.index.heap();
        let rolled_back = LogRecovery::replay(heap.dir(), heap, &mut state.writer)
            .and_then(|_| self.index.rebuild(&mut state.writer));

        match rolled_back {
            Ok(_) => {
                tracing::warn!(error = %err, "Batch failed and was rolled back");
                err
            }
            Err(rollback_err) => {
                tracing::error!(error = %err, rollback_error = %rollback_err, "Batch rollback failed");
                self.closed.store(true, Ordering::Release);
                rollback_err
            }
        }
    }

    /// Sync the heap and write the description; caller holds the write lock
    fn flush_locked(&self) -> Result<()> {
        if self.config.read_only {
            return Ok(());
        }
        let started = Instant::now();
        self.index.sync()?;
        self.failure_point()?;
        self.write_description()?;
        tracing::debug!(
            elements = self.index.element_count(),
            elapsed_us = started.elapsed().as_micros() as u64,
            "Flushed heap store"
        );
        Ok(())
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(FlatError::Closed)
        } else {
            Ok(())
        }
    }

    fn ensure_writable(&self) -> Result<()> {
        self.ensure_open()?;
        if self.config.read_only {
            Err(FlatError::ReadOnlyViolation)
        } else {
            Ok(())
        }
    }
}

#[cfg(any(test, feature = "fault-injection"))]
fn is_injected(err: &FlatError) -> bool {
    matches!(err, FlatError::InjectedFailure)
}

#[cfg(not(any(test, feature = "fault-injection")))]
fn is_injected(_err: &FlatError) -> bool {
    false
}

impl Backend for HeapStore {
    fn name(&self) -> &str {
        "heap"
    }

    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        if self.state.lock_free_reads() {
            self.ensure_open()?;
            return self.index.get(key);
        }
        let _state = self.state.read();
        self.ensure_open()?;
        self.index.get(key)
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        if key.is_empty() {
            return Err(FlatError::InvalidKey);
        }
        let mut batch = WriteBatch::new();
        batch.put(key, value);
        self.update_batch(&batch)
    }

    fn update_batch(&self, batch: &WriteBatch) -> Result<()> {
        batch.validate()?;
        let mut guard = self.state.write();
        self.ensure_writable()?;
        if batch.is_empty() {
            return Ok(());
        }

        let started = Instant::now();
        let state = &mut *guard;
        if self.config.flags.atomic_batches {
            state.log.begin()?;
            let result = self.apply_logged(state, batch).and_then(|()| {
                self.index.sync()?;
                self.failure_point()?;
                state.log.end()
            });
            if let Err(err) = result {
                return Err(self.abort_batch(state, err));
            }
        } else {
            self.apply(&mut state.writer, &mut Unjournaled, batch)?;
        }

        tracing::trace!(
            writes = batch.writes.len(),
            removals = batch.removals.len(),
            elapsed_us = started.elapsed().as_micros() as u64,
            "Applied batch"
        );
        Ok(())
    }

    fn keys(&self) -> Result<BTreeSet<Vec<u8>>> {
        if self.state.lock_free_reads() {
            self.ensure_open()?;
            return self.index.keys();
        }
        let _state = self.state.read();
        self.ensure_open()?;
        self.index.keys()
    }

    fn flush(&self) -> Result<()> {
        let _state = self.state.write();
        self.ensure_open()?;
        self.flush_locked()
    }

    fn close(&self) -> Result<()> {
        let mut state = self.state.write();
        if self.closed.load(Ordering::Acquire) {
            return Ok(());
        }
        self.flush_locked()?;
        if let Some(aux) = &self.aux {
            aux.close()?;
        }
        self.closed.store(true, Ordering::Release);
        state.lock = None;

        tracing::info!(elements = self.index.element_count(), "Closed heap store");
        Ok(())
    }

    fn is_alive(&self) -> bool {
        !self.closed.load(Ordering::Acquire)
    }

    fn keeps_removals(&self) -> bool {
        let options = self.index.options();
        options.allow_removals || options.support_null_values
    }

    fn heap_stats(&self) -> Option<HeapStats> {
        Some(self.index.stats())
    }

    /// Nothing is synced and every later call fails with `Closed`. The
    /// mappings go away when the store is dropped; lock-free readers may still
    /// hold references into them until then.
    #[cfg(any(test, feature = "fault-injection"))]
    fn power_failure(&self) -> Result<()> {
        let mut state = self.state.write();
        self.closed.store(true, Ordering::Release);
        state.log.abandon();
        if let Some(aux) = &self.aux {
            aux.power_failure()?;
        }
        state.lock = None;
        tracing::warn!("Simulated power failure");
        Ok(())
    }
}
