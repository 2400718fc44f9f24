//! Configuration for flatstore
//!
//! Centralized configuration with sensible defaults.

use std::path::PathBuf;

use crate::error::{FlatError, Result};

/// Main configuration for a flatstore instance
#[derive(Debug, Clone)]
pub struct Config {
    // -------------------------------------------------------------------------
    // Storage Configuration
    // -------------------------------------------------------------------------
    /// Root directory for all data files
    /// Internal structure:
    ///   {data_dir}/
    ///     ├── heap.idx     (slot table)
    ///     ├── heap.dat     (record region)
    ///     ├── heap.desc    (description, unless stored in aux.kv)
    ///     ├── heap.log     (crash log, only while a batch is in flight)
    ///     ├── aux.kv       (auxiliary store, optional)
    ///     ├── cache.snap   (cache snapshot, optional)
    ///     └── .lock        (advisory lock)
    pub data_dir: PathBuf,

    /// Maximum number of elements (slot count of the hash index)
    pub capacity: u64,

    /// Expected average record size, used for capacity planning
    pub average_element_size: u64,

    /// Explicit byte size of the record region (overrides planning)
    pub heap_byte_capacity: Option<u64>,

    /// Page size of the heap files (4096 or 16384)
    pub page_size: u32,

    // -------------------------------------------------------------------------
    // Cache Configuration
    // -------------------------------------------------------------------------
    /// Max entries in the committed cache tier (0 disables it)
    pub cache_size: usize,

    /// Uncommitted entries allowed before a put triggers a flush
    pub uncommitted_limit: usize,

    /// Save the committed tier on close and load it on open
    pub cache_snapshot: bool,

    // -------------------------------------------------------------------------
    // Access Configuration
    // -------------------------------------------------------------------------
    /// Reject every mutation
    pub read_only: bool,

    /// Lock discipline for readers and writers
    pub lock_mode: LockMode,

    /// Sync strategy for the crash log
    pub log_sync: LogSyncStrategy,

    /// Feature flags fixed at creation time
    pub flags: CreationFlags,
}

/// Lock discipline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    /// Every operation fully serializes
    Exclusive,

    /// Concurrent readers, exclusive writer
    ReadWrite,

    /// Heap reads take no lock at all (experimental, relies on record write ordering)
    LockFreeReads,
}

/// Crash log sync strategy
///
/// Heap pages are written through a shared mapping, so the kernel may write
/// them back at any moment. Only `EveryEntry` guarantees an undo entry is on
/// disk before the page it covers; `EveryNEntries` survives process crashes
/// but not power loss.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogSyncStrategy {
    /// fsync after every undo entry (survives OS crashes)
    EveryEntry,

    /// fsync after N entries (survives process death, bounded exposure to OS crashes)
    EveryNEntries { count: usize },
}

/// Feature flags of a store
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CreationFlags {
    /// Persist tombstones on disk
    pub support_null_values: bool,

    /// Allow physical removal of records
    pub allow_removals: bool,

    /// Store keys verbatim next to large values so lookups skip rehashing
    pub support_big_values: bool,

    /// Route non-content-addressed pairs to the auxiliary store
    pub support_additional_kv: bool,

    /// Bracket every batch with the crash log
    pub atomic_batches: bool,

    /// Keep the heap description in the auxiliary store instead of `heap.desc`
    pub use_db_for_descriptions: bool,

    /// Migrate older on-disk formats on open
    pub auto_upgrade: bool,

    /// Disable read locking on the heap (forces `LockMode::LockFreeReads`)
    pub experimental_concurrent_rw: bool,
}

impl CreationFlags {
    // Only the flags that change the on-disk format are persisted.
    const NULL_VALUES: u32 = 1 << 0;
    const REMOVALS: u32 = 1 << 1;
    const BIG_VALUES: u32 = 1 << 2;

    /// Bits persisted in the heap description
    pub fn format_bits(&self) -> u32 {
        let mut bits = 0;
        if self.support_null_values {
            bits |= Self::NULL_VALUES;
        }
        if self.allow_removals {
            bits |= Self::REMOVALS;
        }
        if self.support_big_values {
            bits |= Self::BIG_VALUES;
        }
        bits
    }
}

/// Values above this size count as "big" for `support_big_values`
pub const BIG_VALUE_THRESHOLD: usize = 127;

/// Heap overhead factor for capacity planning
const OVERHEAD_FACTOR: f64 = 1.5;

/// Heap overhead factor when removals are allowed (removed records are never compacted)
const OVERHEAD_FACTOR_WITH_REMOVALS: f64 = 2.0;

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./flatstore_data"),
            capacity: 1_000_000,
            average_element_size: 96,
            heap_byte_capacity: None,
            page_size: 4096,
            cache_size: 10_000,
            uncommitted_limit: 10_000,
            cache_snapshot: false,
            read_only: false,
            lock_mode: LockMode::ReadWrite,
            log_sync: LogSyncStrategy::EveryEntry,
            flags: CreationFlags {
                atomic_batches: true,
                ..CreationFlags::default()
            },
        }
    }
}

impl Config {
    /// Create a new config builder
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// Lock mode after applying `experimental_concurrent_rw`
    pub fn effective_lock_mode(&self) -> LockMode {
        if self.flags.experimental_concurrent_rw {
            LockMode::LockFreeReads
        } else {
            self.lock_mode
        }
    }

    /// Byte capacity of the record region
    ///
    /// expected elements × average element size × overhead, rounded up to a page.
    pub fn planned_heap_bytes(&self) -> u64 {
        let raw = match self.heap_byte_capacity {
            Some(bytes) => bytes,
            None => {
                let factor = if self.flags.allow_removals {
                    OVERHEAD_FACTOR_WITH_REMOVALS
                } else {
                    OVERHEAD_FACTOR
                };
                (self.capacity as f64 * self.average_element_size as f64 * factor).ceil() as u64
            }
        };
        let page = u64::from(self.page_size);
        raw.div_ceil(page).max(1) * page
    }

    /// Check the configuration for values the engine cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.capacity == 0 {
            return Err(FlatError::Config("capacity must be > 0".into()));
        }
        if self.capacity >= u64::MAX / 2 {
            return Err(FlatError::Config("capacity is too large".into()));
        }
        if self.page_size != 4096 && self.page_size != 16384 {
            return Err(FlatError::Config(format!(
                "page_size must be 4096 or 16384, got {}",
                self.page_size
            )));
        }
        if self.heap_byte_capacity.is_none() && self.average_element_size == 0 {
            return Err(FlatError::Config(
                "average_element_size must be > 0 when heap_byte_capacity is not set".into(),
            ));
        }
        if self.heap_byte_capacity == Some(0) {
            return Err(FlatError::Config("heap_byte_capacity must be > 0".into()));
        }
        if let LogSyncStrategy::EveryNEntries { count: 0 } = self.log_sync {
            return Err(FlatError::Config("log sync count must be > 0".into()));
        }
        Ok(())
    }
}

/// Builder for Config
#[derive(Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Set the data directory (root for all storage)
    pub fn data_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.data_dir = path.into();
        self
    }

    /// Set the maximum element count
    pub fn capacity(mut self, capacity: u64) -> Self {
        self.config.capacity = capacity;
        self
    }

    /// Set the expected average element size (in bytes)
    pub fn average_element_size(mut self, bytes: u64) -> Self {
        self.config.average_element_size = bytes;
        self
    }

    /// Set the record region size explicitly (in bytes)
    pub fn heap_byte_capacity(mut self, bytes: u64) -> Self {
        self.config.heap_byte_capacity = Some(bytes);
        self
    }

    /// Set the heap page size
    pub fn page_size(mut self, bytes: u32) -> Self {
        self.config.page_size = bytes;
        self
    }

    /// Set the committed cache size (in entries)
    pub fn cache_size(mut self, entries: usize) -> Self {
        self.config.cache_size = entries;
        self
    }

    /// Set the uncommitted entry limit that triggers a flush
    pub fn uncommitted_limit(mut self, entries: usize) -> Self {
        self.config.uncommitted_limit = entries;
        self
    }

    /// Persist the committed cache tier across restarts
    pub fn cache_snapshot(mut self, on: bool) -> Self {
        self.config.cache_snapshot = on;
        self
    }

    /// Open the store read-only
    pub fn read_only(mut self, read_only: bool) -> Self {
        self.config.read_only = read_only;
        self
    }

    /// Set the lock mode
    pub fn lock_mode(mut self, mode: LockMode) -> Self {
        self.config.lock_mode = mode;
        self
    }

    /// Set the crash log sync strategy
    pub fn log_sync(mut self, strategy: LogSyncStrategy) -> Self {
        self.config.log_sync = strategy;
        self
    }

    /// Replace all creation flags
    pub fn flags(mut self, flags: CreationFlags) -> Self {
        self.config.flags = flags;
        self
    }

    pub fn support_null_values(mut self, on: bool) -> Self {
        self.config.flags.support_null_values = on;
        self
    }

    pub fn allow_removals(mut self, on: bool) -> Self {
        self.config.flags.allow_removals = on;
        self
    }

    pub fn support_big_values(mut self, on: bool) -> Self {
        self.config.flags.support_big_values = on;
        self
    }

    pub fn support_additional_kv(mut self, on: bool) -> Self {
        self.config.flags.support_additional_kv = on;
        self
    }

    pub fn atomic_batches(mut self, on: bool) -> Self {
        self.config.flags.atomic_batches = on;
        self
    }

    pub fn use_db_for_descriptions(mut self, on: bool) -> Self {
        self.config.flags.use_db_for_descriptions = on;
        self
    }

    pub fn auto_upgrade(mut self, on: bool) -> Self {
        self.config.flags.auto_upgrade = on;
        self
    }

    pub fn experimental_concurrent_rw(mut self, on: bool) -> Self {
        self.config.flags.experimental_concurrent_rw = on;
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}
