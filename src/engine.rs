//! Engine Module
//!
//! The facade callers talk to.
//!
//! ## Responsibilities
//! - Put the write-back cache in front of the chosen `Backend`
//! - Route non-content-addressed pairs to the aux store when enabled
//! - Own the lifecycle: init, flush, close (and simulated power loss in tests)
//!
//! ## Routing
//! ```text
//!                    put(key, value)
//!                          │
//!          key == sha256(value) or no aux store?
//!                 │yes                 │no
//!                 ▼                    ▼
//!        ┌────────────────┐    ┌────────────────┐
//!        │  CacheLayer    │    │  AuxStore      │
//!        │  ─▶ Backend    │    │  ("kv/" keys)  │
//!        └────────────────┘    └────────────────┘
//! ```
//! A key lives on one side only: a content-addressed write drops any aux
//! entry for the same key, so reads may check the aux store first.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::aux_store::AuxStore;
use crate::backend::{Backend, WriteBatch};
use crate::cache::{CacheLayer, StatsSnapshot};
use crate::config::Config;
use crate::crashlog::RecoveryReport;
use crate::error::{FlatError, Result};
use crate::hash::is_content_addressed;
use crate::index::HeapStats;
use crate::lock_file::DirLock;
use crate::store::HeapStore;

/// Aux store key prefix of routed pairs (keeps them apart from descriptions)
const ADDITIONAL_PREFIX: &[u8] = b"kv/";

/// Cache + base store behind one get/put/delete/keys/flush contract
///
/// ## Concurrency Model
///
/// - **Reads** (get/keys): shared side of the cache guard, then the base
///   store's own read path
/// - **Writes** (put/delete/update_batch): exclusive side of the cache guard;
///   the base store only sees writes at flush time
/// - **flush/close**: exclusive, all the way down
///
/// The heap only keeps the first value written for a key. Use it for
/// content-addressed keys, or enable `support_additional_kv`.
pub struct Engine<B: Backend = HeapStore> {
    config: Config,
    cache: CacheLayer<B>,

    /// Present with `support_additional_kv`
    aux: Option<Arc<AuxStore>>,

    /// Directory lock held on behalf of a backend that has none
    lock: Mutex<Option<DirLock>>,

    closed: AtomicBool,
}

impl Engine<HeapStore> {
    /// Open or create a heap-backed engine in `config.data_dir`
    ///
    /// On startup:
    /// 1. Lock the directory and open (or create) the heap
    /// 2. Undo any batch the previous process left half-applied
    /// 3. Wrap the heap in the cache tiers
    pub fn open(config: Config) -> Result<Self> {
        let store = HeapStore::open(config.clone())?;
        let aux = if config.flags.support_additional_kv {
            store.aux()
        } else {
            None
        };

        tracing::info!(
            path = %config.data_dir.display(),
            cache_size = config.cache_size,
            lock_mode = ?config.effective_lock_mode(),
            "Opened engine"
        );

        Ok(Self {
            cache: CacheLayer::open(store, &config)?,
            aux,
            lock: Mutex::new(None),
            closed: AtomicBool::new(false),
            config,
        })
    }

    /// Recovery performed when the heap was opened
    pub fn recovery_report(&self) -> Option<&RecoveryReport> {
        self.cache.base().recovery_report()
    }
}

impl<B: Backend> Engine<B> {
    /// Wrap an already opened backend
    ///
    /// With `support_additional_kv` the engine locks `config.data_dir` and
    /// keeps its own aux store there.
    pub fn with_backend(backend: B, config: Config) -> Result<Self> {
        config.validate()?;
        let (lock, aux) = if config.flags.support_additional_kv {
            let lock = DirLock::acquire(&config.data_dir)?;
            let aux = AuxStore::open(&config.data_dir, config.read_only)?;
            (Some(lock), Some(Arc::new(aux)))
        } else {
            (None, None)
        };

        tracing::info!(backend = backend.name(), "Opened engine");

        Ok(Self {
            cache: CacheLayer::open(backend, &config)?,
            aux,
            lock: Mutex::new(lock),
            closed: AtomicBool::new(false),
            config,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The base store under the cache
    pub fn backend(&self) -> &B {
        self.cache.base()
    }

    pub fn init(&self) -> Result<()> {
        self.ensure_open()?;
        self.cache.base().init()
    }

    // =========================================================================
    // Data Operations
    // =========================================================================

    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.ensure_open()?;
        if let Some(aux) = &self.aux {
            if let Some(value) = aux.get(&additional_key(key))? {
                return Ok(Some(value));
            }
        }
        self.cache.get(key)
    }

    /// Store a pair and return the stored value
    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<Vec<u8>> {
        self.ensure_open()?;
        let aux = match &self.aux {
            Some(aux) => aux,
            None => return self.cache.put(key, value),
        };
        if key.is_empty() {
            return Err(FlatError::InvalidKey);
        }

        let routed = additional_key(key);
        if is_content_addressed(key, value) {
            let stored = self.cache.put(key, value)?;
            if aux.get(&routed)?.is_some() {
                aux.delete(&routed)?;
            }
            Ok(stored)
        } else {
            tracing::trace!(key_len = key.len(), "Routing pair to aux store");
            aux.put(&routed, value)?;
            Ok(value.to_vec())
        }
    }

    pub fn delete(&self, key: &[u8]) -> Result<()> {
        self.ensure_open()?;
        if let Some(aux) = &self.aux {
            aux.delete(&additional_key(key))?;
        }
        self.cache.delete(key)
    }

    /// Apply writes and removals; a key in both is removed
    ///
    /// With an aux store the batch is split in two. Both halves are checked
    /// before either is applied, and the heap half is staged before the aux
    /// half lands. A failed flush afterwards leaves the heap half staged.
    pub fn update_batch(&self, batch: &WriteBatch) -> Result<()> {
        self.ensure_open()?;
        batch.validate()?;
        let aux = match &self.aux {
            Some(aux) => aux,
            None => return self.cache.update_batch(batch),
        };

        let mut heap_batch = WriteBatch::new();
        let mut aux_batch = WriteBatch::new();
        for (key, value) in &batch.writes {
            if batch.removals.contains(key) {
                continue;
            }
            if is_content_addressed(key, value) {
                heap_batch.put(key.clone(), value.clone());
                aux_batch.remove(additional_key(key));
            } else {
                aux_batch.put(additional_key(key), value.clone());
            }
        }
        for key in &batch.removals {
            heap_batch.remove(key.clone());
            aux_batch.remove(additional_key(key));
        }

        aux.check_writable()?;
        self.cache.stage_batch(&heap_batch)?;
        aux.update_batch(&aux_batch)?;
        self.cache.flush_if_over_limit()
    }

    /// Drop a write or delete that has not been flushed yet
    ///
    /// Lets a caller get past a flush that failed with `HeapFull`:
    /// discard `err.overflowed_key()` and flush again.
    pub fn discard_pending(&self, key: &[u8]) -> Result<bool> {
        self.ensure_open()?;
        self.cache.discard_pending(key)
    }

    /// Point-in-time set of live keys
    pub fn keys(&self) -> Result<BTreeSet<Vec<u8>>> {
        self.ensure_open()?;
        let mut keys = self.cache.keys()?;
        if let Some(aux) = &self.aux {
            keys.extend(
                aux.keys()?
                    .into_iter()
                    .filter_map(|key| key.strip_prefix(ADDITIONAL_PREFIX).map(<[u8]>::to_vec)),
            );
        }
        Ok(keys)
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Push cached writes to the base store and make everything durable
    pub fn flush(&self) -> Result<()> {
        self.ensure_open()?;
        self.cache.flush()?;
        if let Some(aux) = &self.aux {
            aux.flush()?;
        }
        self.cache.base().flush()
    }

    /// Flush and release every resource; later calls fail with `Closed`
    ///
    /// Everything is released even if a flush fails; the first error is
    /// returned.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let cache_closed = self.cache.close();
        let aux_closed = match &self.aux {
            Some(aux) => aux.close(),
            None => Ok(()),
        };
        *self.lock.lock() = None;

        match cache_closed.and(aux_closed) {
            Ok(()) => {
                tracing::info!("Closed engine");
                Ok(())
            }
            Err(err) => {
                tracing::error!(error = %err, "Closed engine with errors");
                Err(err)
            }
        }
    }

    pub fn is_alive(&self) -> bool {
        !self.closed.load(Ordering::Acquire) && self.cache.is_alive()
    }

    /// Stop without flushing anything, as if the machine lost power
    #[cfg(any(test, feature = "fault-injection"))]
    pub fn power_failure(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        self.cache.power_failure()?;
        if let Some(aux) = &self.aux {
            aux.power_failure()?;
        }
        *self.lock.lock() = None;
        Ok(())
    }

    // =========================================================================
    // Statistics
    // =========================================================================

    pub fn stats(&self) -> StatsSnapshot {
        self.cache.stats()
    }

    pub fn reset_stats(&self) -> StatsSnapshot {
        self.cache.reset_stats()
    }

    pub fn stat_lines(&self) -> Vec<String> {
        self.cache.stat_lines()
    }

    pub fn emit_stats(&self) {
        self.cache.emit_stats();
    }

    pub fn heap_stats(&self) -> Option<HeapStats> {
        self.cache.base().heap_stats()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(FlatError::Closed)
        } else {
            Ok(())
        }
    }
}

fn additional_key(key: &[u8]) -> Vec<u8> {
    let mut prefixed = Vec::with_capacity(ADDITIONAL_PREFIX.len() + key.len());
    prefixed.extend_from_slice(ADDITIONAL_PREFIX);
    prefixed.extend_from_slice(key);
    prefixed
}
