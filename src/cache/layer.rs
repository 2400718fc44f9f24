//! Write-back cache layer
//!
//! Wraps any `Backend`. Writes land in the uncommitted tier and reach the
//! base store as one `update_batch` per flush; reads consult the committed
//! tier, then the uncommitted tier, then the base store.
//!
//! A flush either lands whole or leaves every pending entry staged. When the
//! heap is full, `FlatError::overflowed_key` names the write that did not fit
//! and `discard_pending` drops it so the rest can be flushed.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use parking_lot::Mutex;

use super::{CacheEntry, CacheSnapshot, CacheStats, CommittedCache, StatsSnapshot, SNAPSHOT_FILENAME};
use crate::backend::{Backend, WriteBatch};
use crate::config::Config;
use crate::error::{FlatError, Result};
use crate::guard::ConcurrencyGuard;

/// Both cache tiers
struct Tiers {
    /// `None` when `cache_size` is 0. The mutex lets readers populate it.
    committed: Option<Mutex<CommittedCache>>,
    uncommitted: BTreeMap<Vec<u8>, CacheEntry>,

    /// Flushed deletes the base store did not record
    removed: BTreeSet<Vec<u8>>,
    /// `removed` changed since it was last written out
    removed_dirty: bool,
}

/// Committed/uncommitted cache tiers in front of a base store
pub struct CacheLayer<B: Backend> {
    base: B,
    tiers: ConcurrencyGuard<Tiers>,
    read_only: bool,
    uncommitted_limit: usize,
    stats: CacheStats,
    closed: AtomicBool,

    /// `cache.snap`; `None` for a layer that never touches disk
    snapshot_path: Option<PathBuf>,
    /// Save the committed tier on close
    save_committed: bool,
    /// The base store drops removals, so `removed` must remember them
    track_removals: bool,
}

impl<B: Backend> CacheLayer<B> {
    /// Layer with empty tiers that keeps nothing on disk
    pub fn new(base: B, config: &Config) -> Self {
        let committed = if config.cache_size > 0 {
            Some(Mutex::new(CommittedCache::new(config.cache_size)))
        } else {
            None
        };
        let track_removals = !base.keeps_removals();
        Self {
            base,
            tiers: ConcurrencyGuard::new(
                config.effective_lock_mode(),
                Tiers {
                    committed,
                    uncommitted: BTreeMap::new(),
                    removed: BTreeSet::new(),
                    removed_dirty: false,
                },
            ),
            read_only: config.read_only,
            uncommitted_limit: config.uncommitted_limit,
            stats: CacheStats::new(),
            closed: AtomicBool::new(false),
            snapshot_path: None,
            save_committed: false,
            track_removals,
        }
    }

    /// Layer backed by `cache.snap` in `config.data_dir`
    ///
    /// Restores remembered deletes, and the committed tier when
    /// `cache_snapshot` is on. The committed part is dropped from the file
    /// right away: it only describes the base store as a clean close left it.
    pub fn open(base: B, config: &Config) -> Result<Self> {
        let mut layer = Self::new(base, config);
        let path = config.data_dir.join(SNAPSHOT_FILENAME);

        if let Some(snapshot) = CacheSnapshot::load(&path)? {
            let mut tiers = layer.tiers.write();
            let mut warmed = 0;
            if config.cache_snapshot {
                if let Some(committed) = tiers.committed.as_mut().map(Mutex::get_mut) {
                    for (key, entry) in snapshot.committed {
                        committed.insert(key, entry);
                    }
                    warmed = committed.len();
                }
            }
            tiers.removed = snapshot.removed;
            if !config.read_only {
                CacheSnapshot {
                    committed: Vec::new(),
                    removed: tiers.removed.clone(),
                }
                .store(&path)?;
            }
            tracing::debug!(
                committed = warmed,
                removed = tiers.removed.len(),
                "Loaded cache snapshot"
            );
        }

        layer.snapshot_path = Some(path);
        layer.save_committed = config.cache_snapshot;
        Ok(layer)
    }

    pub fn base(&self) -> &B {
        &self.base
    }

    // =========================================================================
    // Reads
    // =========================================================================

    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let tiers = self.tiers.read();
        self.ensure_open()?;
        self.stats.record_get();

        if let Some(committed) = &tiers.committed {
            if let Some(entry) = committed.lock().get(key) {
                self.stats.record_committed_hit();
                return Ok(entry.value().cloned());
            }
        }
        self.stats.record_committed_miss();

        if let Some(entry) = tiers.uncommitted.get(key) {
            return Ok(entry.value().cloned());
        }
        if tiers.removed.contains(key) {
            return Ok(None);
        }

        self.stats.record_store_get();
        let value = self.base.get(key)?;
        if let (Some(value), Some(committed)) = (&value, &tiers.committed) {
            committed
                .lock()
                .insert(key.to_vec(), CacheEntry::Value(value.clone()));
        }
        Ok(value)
    }

    /// Live keys across the base store and both tiers
    pub fn keys(&self) -> Result<BTreeSet<Vec<u8>>> {
        let tiers = self.tiers.read();
        self.ensure_open()?;

        let mut keys = self.base.keys()?;
        for key in &tiers.removed {
            keys.remove(key);
        }
        if let Some(committed) = &tiers.committed {
            for (key, entry) in committed.lock().iter() {
                match entry {
                    CacheEntry::Value(_) => keys.insert(key.clone()),
                    CacheEntry::Tombstone => keys.remove(key),
                };
            }
        }
        for (key, entry) in &tiers.uncommitted {
            match entry {
                CacheEntry::Value(_) => keys.insert(key.clone()),
                CacheEntry::Tombstone => keys.remove(key),
            };
        }
        Ok(keys)
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Stage a write and return the stored value
    ///
    /// If staging pushes the uncommitted tier past its limit the flush runs
    /// here; when it fails the write stays staged and the error is returned.
    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<Vec<u8>> {
        self.check_writable()?;
        if key.is_empty() {
            return Err(FlatError::InvalidKey);
        }
        let mut tiers = self.tiers.write();
        self.ensure_open()?;
        self.stage_put(&mut tiers, key, value);
        self.flush_if_over_limit_locked(&mut tiers)?;
        Ok(value.to_vec())
    }

    pub fn delete(&self, key: &[u8]) -> Result<()> {
        self.check_writable()?;
        if key.is_empty() {
            return Err(FlatError::InvalidKey);
        }
        let mut tiers = self.tiers.write();
        self.ensure_open()?;
        self.stage_delete(&mut tiers, key);
        self.flush_if_over_limit_locked(&mut tiers)
    }

    /// Stage every write and removal under one write lock
    pub fn update_batch(&self, batch: &WriteBatch) -> Result<()> {
        self.check_writable()?;
        batch.validate()?;
        let mut tiers = self.tiers.write();
        self.ensure_open()?;
        self.stage_batch_locked(&mut tiers, batch);
        self.flush_if_over_limit_locked(&mut tiers)
    }

    /// Stage a whole batch without flushing
    ///
    /// Either every entry is staged or, on error, none is.
    pub(crate) fn stage_batch(&self, batch: &WriteBatch) -> Result<()> {
        self.check_writable()?;
        batch.validate()?;
        let mut tiers = self.tiers.write();
        self.ensure_open()?;
        self.stage_batch_locked(&mut tiers, batch);
        Ok(())
    }

    /// Flush if the uncommitted tier is past its limit
    pub(crate) fn flush_if_over_limit(&self) -> Result<()> {
        let mut tiers = self.tiers.write();
        self.ensure_open()?;
        self.flush_if_over_limit_locked(&mut tiers)
    }

    /// Drop a staged write or delete; returns whether one was pending
    pub fn discard_pending(&self, key: &[u8]) -> Result<bool> {
        let mut tiers = self.tiers.write();
        self.ensure_open()?;
        let discarded = tiers.uncommitted.remove(key).is_some();
        if discarded {
            tracing::debug!(key_len = key.len(), "Discarded pending entry");
        }
        Ok(discarded)
    }

    fn stage_batch_locked(&self, tiers: &mut Tiers, batch: &WriteBatch) {
        for (key, value) in &batch.writes {
            if !batch.removals.contains(key) {
                self.stage_put(tiers, key, value);
            }
        }
        for key in &batch.removals {
            self.stage_delete(tiers, key);
        }
    }

    fn stage_put(&self, tiers: &mut Tiers, key: &[u8], value: &[u8]) {
        self.stats.record_put();

        if let Some(committed) = tiers.committed.as_mut().map(Mutex::get_mut) {
            if let Some(CacheEntry::Value(existing)) = committed.peek(key) {
                if existing.as_slice() == value {
                    return;
                }
            }
            committed.remove(key);
        }

        tiers
            .uncommitted
            .insert(key.to_vec(), CacheEntry::Value(value.to_vec()));
    }

    fn stage_delete(&self, tiers: &mut Tiers, key: &[u8]) {
        // Known absent in the base store
        if tiers.removed.contains(key) && !tiers.uncommitted.contains_key(key) {
            return;
        }
        if let Some(committed) = tiers.committed.as_mut().map(Mutex::get_mut) {
            match committed.peek(key).map(CacheEntry::is_tombstone) {
                Some(true) => return,
                Some(false) => {
                    committed.remove(key);
                }
                None => {}
            }
        }

        tiers.uncommitted.insert(key.to_vec(), CacheEntry::Tombstone);
    }

    fn flush_if_over_limit_locked(&self, tiers: &mut Tiers) -> Result<()> {
        if tiers.uncommitted.len() > self.uncommitted_limit {
            self.flush_locked(tiers)?;
        }
        Ok(())
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Push the uncommitted tier to the base store as one batch
    ///
    /// On error nothing is applied and every entry stays staged.
    pub fn flush(&self) -> Result<()> {
        let mut tiers = self.tiers.write();
        self.ensure_open()?;
        self.flush_locked(&mut tiers)
    }

    fn flush_locked(&self, tiers: &mut Tiers) -> Result<()> {
        if tiers.uncommitted.is_empty() {
            return self.persist_removed(tiers);
        }
        if self.read_only {
            return Err(FlatError::ReadOnlyViolation);
        }

        let started = Instant::now();
        let mut batch = WriteBatch::new();
        for (key, entry) in &tiers.uncommitted {
            match entry {
                CacheEntry::Value(value) => {
                    batch.writes.insert(key.clone(), value.clone());
                }
                CacheEntry::Tombstone => {
                    batch.removals.insert(key.clone());
                }
            }
        }
        self.base.update_batch(&batch)?;

        let flushed = tiers.uncommitted.len();
        let pending = std::mem::take(&mut tiers.uncommitted);
        let mut committed = tiers.committed.as_mut().map(Mutex::get_mut);
        for (key, entry) in pending {
            if self.track_removals {
                let changed = match entry {
                    CacheEntry::Tombstone => tiers.removed.insert(key.clone()),
                    CacheEntry::Value(_) => tiers.removed.remove(&key),
                };
                tiers.removed_dirty |= changed;
                if entry.is_tombstone() {
                    continue;
                }
            }
            if let Some(committed) = committed.as_deref_mut() {
                committed.insert(key, entry);
            }
        }
        self.persist_removed(tiers)?;

        tracing::debug!(
            entries = flushed,
            elapsed_us = started.elapsed().as_micros() as u64,
            "Flushed cache"
        );
        Ok(())
    }

    /// Write remembered deletes out after they change
    fn persist_removed(&self, tiers: &mut Tiers) -> Result<()> {
        if !tiers.removed_dirty {
            return Ok(());
        }
        if let Some(path) = &self.snapshot_path {
            CacheSnapshot {
                committed: Vec::new(),
                removed: tiers.removed.clone(),
            }
            .store(path)?;
        }
        tiers.removed_dirty = false;
        Ok(())
    }

    fn save_snapshot(&self, tiers: &Tiers) -> Result<()> {
        let path = match &self.snapshot_path {
            Some(path) if !self.read_only => path,
            _ => return Ok(()),
        };
        let committed = match &tiers.committed {
            Some(committed) if self.save_committed => committed
                .lock()
                .iter_by_recency()
                .map(|(key, entry)| (key.clone(), entry.clone()))
                .collect(),
            _ => Vec::new(),
        };
        let snapshot = CacheSnapshot {
            committed,
            removed: tiers.removed.clone(),
        };
        snapshot.store(path)?;
        tracing::debug!(
            committed = snapshot.committed.len(),
            removed = snapshot.removed.len(),
            "Saved cache snapshot"
        );
        Ok(())
    }

    /// Flush, save the snapshot, close the base store and drop both tiers
    ///
    /// Resources are released even when the flush fails; the first error is
    /// returned and the writes that could not be flushed are lost.
    pub fn close(&self) -> Result<()> {
        let mut tiers = self.tiers.write();
        if self.closed.load(Ordering::Acquire) {
            return Ok(());
        }
        let flushed = if self.read_only {
            Ok(())
        } else {
            self.flush_locked(&mut tiers)
        };
        if let Err(err) = &flushed {
            tracing::error!(
                error = %err,
                dropped = tiers.uncommitted.len(),
                "Closing with writes that could not be flushed"
            );
        }
        // Written while the base store still holds the directory lock
        let saved = self.save_snapshot(&tiers);
        let base_closed = self.base.close();

        if let Some(committed) = tiers.committed.as_mut().map(Mutex::get_mut) {
            committed.clear();
        }
        tiers.uncommitted.clear();
        tiers.removed.clear();
        self.closed.store(true, Ordering::Release);
        flushed.and(saved).and(base_closed)
    }

    pub fn is_alive(&self) -> bool {
        !self.closed.load(Ordering::Acquire) && self.base.is_alive()
    }

    /// Drop both tiers and stop the base store without flushing
    #[cfg(any(test, feature = "fault-injection"))]
    pub fn power_failure(&self) -> Result<()> {
        let mut tiers = self.tiers.write();
        self.closed.store(true, Ordering::Release);
        if let Some(committed) = tiers.committed.as_mut().map(Mutex::get_mut) {
            committed.clear();
        }
        tiers.uncommitted.clear();
        tiers.removed.clear();
        self.base.power_failure()
    }

    // =========================================================================
    // Statistics
    // =========================================================================

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn reset_stats(&self) -> StatsSnapshot {
        self.stats.reset()
    }

    /// Counter dump including tier sizes
    pub fn stat_lines(&self) -> Vec<String> {
        let tiers = self.tiers.read();
        let (committed_len, committed_max) = match &tiers.committed {
            Some(committed) => {
                let committed = committed.lock();
                (committed.len(), committed.capacity())
            }
            None => (0, 0),
        };
        self.stats
            .stat_lines(committed_len, committed_max, tiers.uncommitted.len())
    }

    /// Log activity counters and reset them
    pub fn emit_stats(&self) {
        self.stats.emit_stats();
    }

    pub fn uncommitted_len(&self) -> usize {
        self.tiers.read().uncommitted.len()
    }

    /// Deleted keys remembered on behalf of the base store
    pub fn removed_len(&self) -> usize {
        self.tiers.read().removed.len()
    }

    /// Fail unless mutations are allowed right now
    pub(crate) fn check_writable(&self) -> Result<()> {
        self.ensure_open()?;
        if self.read_only {
            Err(FlatError::ReadOnlyViolation)
        } else {
            Ok(())
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(FlatError::Closed)
        } else {
            Ok(())
        }
    }
}
