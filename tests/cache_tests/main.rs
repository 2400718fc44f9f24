//! Tests for CacheLayer
//!
//! These tests verify:
//! - Identical puts never reach the base store twice
//! - Values read back before and after flush
//! - Deletes hide keys from get and keys
//! - Read-only layers reject mutations
//! - Statistics and automatic flushing

use std::collections::BTreeSet;

use flatstore::backend::{Backend, MemoryBackend, WriteBatch};
use flatstore::cache::{CacheLayer, SNAPSHOT_FILENAME};
use flatstore::config::{Config, LogSyncStrategy};
use flatstore::error::FlatError;
use flatstore::hash::content_hash;
use flatstore::store::HeapStore;
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

fn memory_layer(cache_size: usize, uncommitted_limit: usize) -> CacheLayer<MemoryBackend> {
    let config = Config::builder()
        .cache_size(cache_size)
        .uncommitted_limit(uncommitted_limit)
        .build();
    CacheLayer::new(MemoryBackend::new(), &config)
}

fn heap_config(temp: &TempDir) -> Config {
    Config::builder()
        .data_dir(temp.path())
        .capacity(64)
        .heap_byte_capacity(64 * 1024)
        .log_sync(LogSyncStrategy::EveryEntry)
        .cache_size(16)
        .uncommitted_limit(16)
        .build()
}

fn heap_layer(temp: &TempDir) -> CacheLayer<HeapStore> {
    let config = heap_config(temp);
    let store = HeapStore::open(config.clone()).unwrap();
    CacheLayer::open(store, &config).unwrap()
}

// =============================================================================
// Write Traffic
// =============================================================================

#[test]
fn test_repeated_identical_put_is_written_once() {
    let cache = memory_layer(64, 64);
    for _ in 0..5 {
        cache.put(b"k", b"v").unwrap();
        cache.flush().unwrap();
    }
    assert_eq!(cache.base().write_count(), 1);
}

#[test]
fn test_changed_value_is_written_again() {
    let cache = memory_layer(64, 64);
    cache.put(b"k", b"v1").unwrap();
    cache.flush().unwrap();
    cache.put(b"k", b"v2").unwrap();
    cache.flush().unwrap();

    assert_eq!(cache.base().write_count(), 2);
    assert_eq!(cache.get(b"k").unwrap(), Some(b"v2".to_vec()));
}

#[test]
fn test_exceeding_limit_flushes_synchronously() {
    let cache = memory_layer(64, 4);
    for i in 0..5u8 {
        cache.put(&[i + 1], &[i]).unwrap();
    }
    assert_eq!(cache.base().len(), 5);
    assert_eq!(cache.uncommitted_len(), 0);
}

// =============================================================================
// Round Trip / Tombstones
// =============================================================================

#[test]
fn test_round_trip_through_heap() {
    let temp = TempDir::new().unwrap();
    let cache = heap_layer(&temp);

    let values: Vec<Vec<u8>> = (0..20u8).map(|i| vec![i; 50]).collect();
    for value in &values {
        cache.put(&content_hash(value), value).unwrap();
        assert_eq!(cache.get(&content_hash(value)).unwrap(), Some(value.clone()));
    }
    cache.flush().unwrap();

    for value in &values {
        assert_eq!(cache.get(&content_hash(value)).unwrap(), Some(value.clone()));
        assert_eq!(
            cache.base().get(&content_hash(value)).unwrap(),
            Some(value.clone())
        );
    }
    let expected: BTreeSet<Vec<u8>> = values.iter().map(|v| content_hash(v).to_vec()).collect();
    assert_eq!(cache.keys().unwrap(), expected);
}

#[test]
fn test_delete_hides_key_after_flush() {
    let temp = TempDir::new().unwrap();
    let cache = heap_layer(&temp);
    let value = b"doomed".to_vec();
    let key = content_hash(&value);

    cache.put(&key, &value).unwrap();
    cache.flush().unwrap();
    cache.delete(&key).unwrap();
    assert_eq!(cache.get(&key).unwrap(), None);
    cache.flush().unwrap();

    assert_eq!(cache.get(&key).unwrap(), None);
    assert!(!cache.keys().unwrap().contains(key.as_slice()));
}

#[test]
fn test_delete_remembered_across_reopen() {
    let temp = TempDir::new().unwrap();
    let value = b"doomed".to_vec();
    let key = content_hash(&value);
    {
        let cache = heap_layer(&temp);
        cache.put(&key, &value).unwrap();
        cache.flush().unwrap();
        cache.delete(&key).unwrap();
        cache.flush().unwrap();
        cache.close().unwrap();
    }
    assert!(temp.path().join(SNAPSHOT_FILENAME).exists());

    let config = heap_config(&temp);
    let store = HeapStore::open(config.clone()).unwrap();
    // Default flags: the heap itself keeps the record
    assert_eq!(store.get(&key).unwrap(), Some(value));
    let cache = CacheLayer::open(store, &config).unwrap();
    assert_eq!(cache.get(&key).unwrap(), None);
    assert!(cache.keys().unwrap().is_empty());
    assert_eq!(cache.removed_len(), 1);
}

#[test]
fn test_delete_of_uncached_key_reaches_base() {
    let cache = memory_layer(64, 64);
    cache.base().put(b"k", b"v").unwrap();

    cache.delete(b"k").unwrap();
    cache.flush().unwrap();
    assert_eq!(cache.base().get(b"k").unwrap(), None);
}

#[test]
fn test_batch_stages_writes_and_removals() {
    let cache = memory_layer(64, 64);
    cache.base().put(b"old", b"x").unwrap();

    let mut batch = WriteBatch::new();
    batch.put(b"new".to_vec(), b"y".to_vec()).remove(b"old".to_vec());
    cache.update_batch(&batch).unwrap();

    let keys = cache.keys().unwrap();
    assert!(keys.contains(b"new".as_slice()));
    assert!(!keys.contains(b"old".as_slice()));

    let mut bad = WriteBatch::new();
    bad.put(Vec::new(), b"z".to_vec());
    assert!(matches!(
        cache.update_batch(&bad),
        Err(FlatError::InvalidBatch(_))
    ));
}

// =============================================================================
// Read-Only / Statistics
// =============================================================================

#[test]
fn test_read_only_layer() {
    let base = MemoryBackend::new();
    base.put(b"k", b"v").unwrap();
    let config = Config::builder().read_only(true).build();
    let cache = CacheLayer::new(base, &config);

    assert_eq!(cache.get(b"k").unwrap(), Some(b"v".to_vec()));
    assert!(matches!(
        cache.put(b"x", b"y"),
        Err(FlatError::ReadOnlyViolation)
    ));
    assert!(matches!(cache.delete(b"k"), Err(FlatError::ReadOnlyViolation)));
    assert!(matches!(
        cache.update_batch(&WriteBatch::new()),
        Err(FlatError::ReadOnlyViolation)
    ));
}

#[test]
fn test_stats_track_hits_misses_and_store_reads() {
    let cache = memory_layer(64, 64);
    cache.base().put(b"k", b"v").unwrap();

    cache.get(b"k").unwrap(); // miss, read from store
    cache.get(b"k").unwrap(); // hit
    cache.get(b"k").unwrap(); // hit
    cache.get(b"absent").unwrap(); // miss, read from store
    cache.put(b"p", b"q").unwrap();

    let stats = cache.stats();
    assert_eq!(stats.gets, 4);
    assert_eq!(stats.puts, 1);
    assert_eq!(stats.gets_from_store, 2);
    assert_eq!(stats.committed_hits, 2);
    assert_eq!(stats.committed_misses, 2);
    assert_eq!(stats.hit_rate(), 0.5);

    let lines = cache.stat_lines();
    assert!(lines.contains(&"puts: 1".to_string()));
    assert!(lines.contains(&"committedCache.size(): 1 (max 64)".to_string()));
    assert!(lines.contains(&"uncommittedCache.size(): 1".to_string()));

    cache.emit_stats();
    let after = cache.stats();
    assert_eq!(after.gets, 0);
    assert_eq!(after.committed_hits, 2);
}

#[test]
fn test_committed_tier_is_bounded() {
    let cache = memory_layer(4, 64);
    for i in 0..10u8 {
        cache.base().put(&[i + 1], &[i]).unwrap();
        cache.get(&[i + 1]).unwrap();
    }
    assert!(cache
        .stat_lines()
        .contains(&"committedCache.size(): 4 (max 4)".to_string()));
}
