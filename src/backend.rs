//! Base store abstraction
//!
//! The cache layer and the engine work against any `Backend`; the heap store
//! is one implementation, the in-memory map another.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::RwLock;

use crate::error::{FlatError, Result};
use crate::index::HeapStats;

/// A set of writes and removals applied atomically
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteBatch {
    pub writes: BTreeMap<Vec<u8>, Vec<u8>>,
    pub removals: BTreeSet<Vec<u8>>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> &mut Self {
        self.writes.insert(key.into(), value.into());
        self
    }

    pub fn remove(&mut self, key: impl Into<Vec<u8>>) -> &mut Self {
        self.removals.insert(key.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.writes.is_empty() && self.removals.is_empty()
    }

    pub fn len(&self) -> usize {
        self.writes.len() + self.removals.len()
    }

    /// A key both written and removed is removed
    pub fn normalize(&mut self) {
        let removals = &self.removals;
        self.writes.retain(|key, _| !removals.contains(key));
    }

    /// Reject keys no store can hold
    pub fn validate(&self) -> Result<()> {
        if self.writes.keys().any(|k| k.is_empty()) {
            return Err(FlatError::InvalidBatch("empty key in writes".into()));
        }
        if self.removals.iter().any(|k| k.is_empty()) {
            return Err(FlatError::InvalidBatch("empty key in removals".into()));
        }
        Ok(())
    }
}

/// A key-value store the engine can sit on
pub trait Backend: Send + Sync {
    /// Short name for logs
    fn name(&self) -> &str;

    /// Called once before the first operation
    fn init(&self) -> Result<()> {
        Ok(())
    }

    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;

    fn put(&self, key: &[u8], value: &[u8]) -> Result<()>;

    fn delete(&self, key: &[u8]) -> Result<()> {
        let mut batch = WriteBatch::new();
        batch.remove(key);
        self.update_batch(&batch)
    }

    /// Apply a normalized, validated batch atomically
    fn update_batch(&self, batch: &WriteBatch) -> Result<()>;

    /// Point-in-time key set
    fn keys(&self) -> Result<BTreeSet<Vec<u8>>>;

    fn flush(&self) -> Result<()>;

    /// Flush and release resources; later calls fail with `Closed`
    fn close(&self) -> Result<()>;

    fn is_alive(&self) -> bool;

    /// Whether removals survive in the store, as tombstones or physically
    ///
    /// When false the cache layer remembers deleted keys on its own.
    fn keeps_removals(&self) -> bool {
        true
    }

    /// Occupancy statistics, for heap-backed stores
    fn heap_stats(&self) -> Option<HeapStats> {
        None
    }

    /// Stop as if the machine lost power: nothing is flushed
    #[cfg(any(test, feature = "fault-injection"))]
    fn power_failure(&self) -> Result<()> {
        self.close()
    }
}

/// `BTreeMap` backend
///
/// Counts the writes it receives so callers can observe write traffic.
#[derive(Default)]
pub struct MemoryBackend {
    map: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
    writes: AtomicU64,
    closed: AtomicBool,

    /// Drop removals the way a heap without tombstones does
    ignore_removals: bool,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// A backend whose removals are silently dropped
    pub fn ignoring_removals() -> Self {
        Self {
            ignore_removals: true,
            ..Self::default()
        }
    }

    /// Keys written since creation (puts plus batch writes)
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.map.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.read().is_empty()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(FlatError::Closed)
        } else {
            Ok(())
        }
    }
}

impl Backend for MemoryBackend {
    fn name(&self) -> &str {
        "memory"
    }

    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.ensure_open()?;
        Ok(self.map.read().get(key).cloned())
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.ensure_open()?;
        if key.is_empty() {
            return Err(FlatError::InvalidKey);
        }
        self.map.write().insert(key.to_vec(), value.to_vec());
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn update_batch(&self, batch: &WriteBatch) -> Result<()> {
        self.ensure_open()?;
        batch.validate()?;
        let mut map = self.map.write();
        for (key, value) in &batch.writes {
            if !batch.removals.contains(key) {
                map.insert(key.clone(), value.clone());
                self.writes.fetch_add(1, Ordering::Relaxed);
            }
        }
        if !self.ignore_removals {
            for key in &batch.removals {
                map.remove(key);
            }
        }
        Ok(())
    }

    fn keys(&self) -> Result<BTreeSet<Vec<u8>>> {
        self.ensure_open()?;
        Ok(self.map.read().keys().cloned().collect())
    }

    fn flush(&self) -> Result<()> {
        self.ensure_open()
    }

    fn keeps_removals(&self) -> bool {
        !self.ignore_removals
    }

    fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }

    fn is_alive(&self) -> bool {
        !self.closed.load(Ordering::Acquire)
    }
}
