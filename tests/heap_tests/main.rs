//! Tests for HeapStore
//!
//! These tests verify:
//! - Collision chains under forced collisions
//! - Full-heap behaviour
//! - Tombstones and physical removal
//! - Persistence across reopen

mod chain_tests;
mod persistence_tests;

use std::path::Path;

use flatstore::config::{Config, LogSyncStrategy};

// =============================================================================
// Helper Functions
// =============================================================================

pub fn heap_config(dir: &Path, capacity: u64) -> Config {
    Config::builder()
        .data_dir(dir)
        .capacity(capacity)
        .heap_byte_capacity(64 * 1024)
        .log_sync(LogSyncStrategy::EveryEntry)
        .build()
}

/// Every key lands in slot 0
pub fn zero_hash(_key: &[u8]) -> u64 {
    0
}
