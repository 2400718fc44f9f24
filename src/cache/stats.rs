//! Cache statistics
//!
//! Counters are monotonic until `reset`. Each sits on its own cache line so
//! concurrent readers do not contend on one word.

use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam::utils::CachePadded;

/// Live counters of a cache layer
#[derive(Debug, Default)]
pub struct CacheStats {
    gets: CachePadded<AtomicU64>,
    puts: CachePadded<AtomicU64>,
    gets_from_store: CachePadded<AtomicU64>,
    committed_hits: CachePadded<AtomicU64>,
    committed_misses: CachePadded<AtomicU64>,
}

/// Copy of the counters at one point in time
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub gets: u64,
    pub puts: u64,
    pub gets_from_store: u64,
    pub committed_hits: u64,
    pub committed_misses: u64,
}

impl StatsSnapshot {
    /// Committed-tier hit rate in [0, 1]; 0 before any lookup
    pub fn hit_rate(&self) -> f64 {
        let total = self.committed_hits + self.committed_misses;
        if total == 0 {
            0.0
        } else {
            self.committed_hits as f64 / total as f64
        }
    }
}

impl CacheStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_get(&self) {
        self.gets.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_put(&self) {
        self.puts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_store_get(&self) {
        self.gets_from_store.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_committed_hit(&self) {
        self.committed_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_committed_miss(&self) {
        self.committed_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            gets: self.gets.load(Ordering::Relaxed),
            puts: self.puts.load(Ordering::Relaxed),
            gets_from_store: self.gets_from_store.load(Ordering::Relaxed),
            committed_hits: self.committed_hits.load(Ordering::Relaxed),
            committed_misses: self.committed_misses.load(Ordering::Relaxed),
        }
    }

    /// Zero every counter, returning the values they had
    pub fn reset(&self) -> StatsSnapshot {
        StatsSnapshot {
            gets: self.gets.swap(0, Ordering::Relaxed),
            puts: self.puts.swap(0, Ordering::Relaxed),
            gets_from_store: self.gets_from_store.swap(0, Ordering::Relaxed),
            committed_hits: self.committed_hits.swap(0, Ordering::Relaxed),
            committed_misses: self.committed_misses.swap(0, Ordering::Relaxed),
        }
    }

    /// Human-readable counter dump
    pub fn stat_lines(
        &self,
        committed_len: usize,
        committed_max: usize,
        uncommitted_len: usize,
    ) -> Vec<String> {
        let s = self.snapshot();
        let mut lines = vec![
            format!("puts: {}", s.puts),
            format!("gets: {}", s.gets),
            format!("getsFromStore: {}", s.gets_from_store),
        ];
        if s.committed_hits + s.committed_misses > 0 {
            lines.push(format!("committed cache hit [%]: {:.2}", s.hit_rate() * 100.0));
        }
        lines.push(format!("committedCacheHits: {}", s.committed_hits));
        lines.push(format!("committedCacheMisses: {}", s.committed_misses));
        lines.push(format!(
            "committedCache.size(): {} (max {})",
            committed_len, committed_max
        ));
        lines.push(format!("uncommittedCache.size(): {}", uncommitted_len));
        lines
    }

    /// Log activity since the last call and zero the activity counters
    ///
    /// Hit/miss counters are left alone so the hit rate covers the whole run.
    pub fn emit_stats(&self) {
        let gets = self.gets.swap(0, Ordering::Relaxed);
        let puts = self.puts.swap(0, Ordering::Relaxed);
        let from_store = self.gets_from_store.swap(0, Ordering::Relaxed);
        tracing::trace!(gets, puts, gets_from_store = from_store, "Cache activity");
    }
}
