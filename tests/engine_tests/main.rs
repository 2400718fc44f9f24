//! Tests for Engine
//!
//! These tests verify:
//! - Engine lifecycle (open/init/flush/close/reopen)
//! - Directory lock ownership
//! - Additional (non-content-addressed) pairs
//! - Deletes and the cache snapshot across restarts
//! - Recovery from a full heap
//! - Concurrent readers in every lock mode

use std::sync::Arc;
use std::thread;

use flatstore::backend::WriteBatch;
use flatstore::cache::SNAPSHOT_FILENAME;
use flatstore::config::{Config, CreationFlags, LockMode, LogSyncStrategy};
use flatstore::engine::Engine;
use flatstore::error::FlatError;
use flatstore::hash::content_hash;
use flatstore::lock_file::LOCK_FILENAME;
use tempfile::TempDir;
use tracing_subscriber::EnvFilter;

// =============================================================================
// Helper Functions
// =============================================================================

/// Route engine logs to the test harness; `RUST_LOG=flatstore=debug` shows them
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn config(temp: &TempDir) -> Config {
    Config::builder()
        .data_dir(temp.path())
        .capacity(256)
        .heap_byte_capacity(256 * 1024)
        .cache_size(64)
        .uncommitted_limit(64)
        .log_sync(LogSyncStrategy::EveryEntry)
        .build()
}

fn value(i: u32) -> Vec<u8> {
    format!("value-{i:04}").into_bytes()
}

fn key(i: u32) -> Vec<u8> {
    content_hash(&value(i)).to_vec()
}

// =============================================================================
// Lifecycle
// =============================================================================

#[test]
fn test_engine_lifecycle() {
    init_tracing();
    let temp = TempDir::new().unwrap();
    {
        let engine = Engine::open(config(&temp)).unwrap();
        engine.init().unwrap();
        assert!(engine.is_alive());
        for i in 0..100 {
            engine.put(&key(i), &value(i)).unwrap();
        }
        engine.delete(&key(0)).unwrap();
        engine.flush().unwrap();
        assert_eq!(engine.keys().unwrap().len(), 99);
        engine.close().unwrap();

        assert!(!engine.is_alive());
        assert!(matches!(engine.get(&key(1)), Err(FlatError::Closed)));
        assert!(matches!(engine.flush(), Err(FlatError::Closed)));
        assert!(engine.close().is_ok());
    }

    let engine = Engine::open(config(&temp)).unwrap();
    assert!(engine.recovery_report().is_none());
    for i in 1..100 {
        assert_eq!(engine.get(&key(i)).unwrap(), Some(value(i)));
    }
    assert_eq!(engine.heap_stats().unwrap().elements, 100);
}

#[test]
fn test_lock_file_excludes_second_engine() {
    let temp = TempDir::new().unwrap();
    let engine = Engine::open(config(&temp)).unwrap();
    assert!(temp.path().join(LOCK_FILENAME).exists());
    assert!(matches!(
        Engine::open(config(&temp)),
        Err(FlatError::AlreadyLocked(_))
    ));

    engine.close().unwrap();
    assert!(Engine::open(config(&temp)).is_ok());
}

#[test]
fn test_additional_kv_survives_reopen() {
    let temp = TempDir::new().unwrap();
    let cfg = Config {
        flags: CreationFlags {
            support_additional_kv: true,
            use_db_for_descriptions: true,
            atomic_batches: true,
            ..Default::default()
        },
        ..config(&temp)
    };
    {
        let engine = Engine::open(cfg.clone()).unwrap();
        engine.put(b"head", b"1").unwrap();
        engine.put(b"head", b"2").unwrap();
        engine.put(&key(1), &value(1)).unwrap();
        engine.close().unwrap();
    }

    let engine = Engine::open(cfg).unwrap();
    assert_eq!(engine.get(b"head").unwrap(), Some(b"2".to_vec()));
    assert_eq!(engine.get(&key(1)).unwrap(), Some(value(1)));
    let keys = engine.keys().unwrap();
    assert_eq!(keys.len(), 2);
    assert!(keys.contains(b"head".as_slice()));
    // Only the content-addressed pair lives in the heap
    assert_eq!(engine.heap_stats().unwrap().elements, 1);
}

#[test]
fn test_stats_lines_report_activity() {
    let temp = TempDir::new().unwrap();
    let engine = Engine::open(config(&temp)).unwrap();
    engine.put(&key(1), &value(1)).unwrap();
    engine.get(&key(1)).unwrap();

    let stats = engine.stats();
    assert_eq!(stats.puts, 1);
    assert_eq!(stats.gets, 1);
    assert!(engine.stat_lines().iter().any(|l| l == "gets: 1"));

    engine.reset_stats();
    assert_eq!(engine.stats().gets, 0);
}

// =============================================================================
// Deletes / Snapshots
// =============================================================================

#[test]
fn test_delete_stays_hidden_after_eviction_and_reopen() {
    let temp = TempDir::new().unwrap();
    let cfg = Config {
        cache_size: 1,
        ..config(&temp)
    };
    {
        let engine = Engine::open(cfg.clone()).unwrap();
        engine.put(&key(0), &value(0)).unwrap();
        engine.flush().unwrap();
        engine.delete(&key(0)).unwrap();
        engine.flush().unwrap();

        // Push another key through the single committed slot
        engine.put(&key(1), &value(1)).unwrap();
        engine.flush().unwrap();
        assert_eq!(engine.get(&key(1)).unwrap(), Some(value(1)));
        assert_eq!(engine.get(&key(0)).unwrap(), None);
        engine.close().unwrap();
    }

    let engine = Engine::open(cfg).unwrap();
    assert_eq!(engine.get(&key(0)).unwrap(), None);
    assert!(!engine.keys().unwrap().contains(&key(0)));
    assert_eq!(engine.get(&key(1)).unwrap(), Some(value(1)));
    // The heap keeps the record; only the cache layer knows it is gone
    assert_eq!(engine.heap_stats().unwrap().elements, 2);
}

#[test]
fn test_delete_hidden_without_committed_tier() {
    let temp = TempDir::new().unwrap();
    let cfg = Config {
        cache_size: 0,
        ..config(&temp)
    };
    let engine = Engine::open(cfg).unwrap();
    engine.put(&key(0), &value(0)).unwrap();
    engine.flush().unwrap();
    engine.delete(&key(0)).unwrap();
    engine.flush().unwrap();

    assert_eq!(engine.get(&key(0)).unwrap(), None);
    assert!(engine.keys().unwrap().is_empty());
}

#[test]
fn test_cache_snapshot_warms_committed_tier() {
    let temp = TempDir::new().unwrap();
    let cfg = Config {
        cache_snapshot: true,
        ..config(&temp)
    };
    {
        let engine = Engine::open(cfg.clone()).unwrap();
        for i in 0..10 {
            engine.put(&key(i), &value(i)).unwrap();
        }
        engine.close().unwrap();
    }
    assert!(temp.path().join(SNAPSHOT_FILENAME).exists());

    {
        let engine = Engine::open(cfg.clone()).unwrap();
        for i in 0..10 {
            assert_eq!(engine.get(&key(i)).unwrap(), Some(value(i)));
        }
        let stats = engine.stats();
        assert_eq!(stats.committed_hits, 10);
        assert_eq!(stats.gets_from_store, 0);
        engine.close().unwrap();
    }

    // Without the option the saved tier is ignored
    let engine = Engine::open(config(&temp)).unwrap();
    for i in 0..10 {
        assert_eq!(engine.get(&key(i)).unwrap(), Some(value(i)));
    }
    assert_eq!(engine.stats().gets_from_store, 10);
}

// =============================================================================
// Full Heap
// =============================================================================

fn tiny_config(temp: &TempDir) -> Config {
    Config {
        capacity: 4,
        ..config(temp)
    }
}

#[test]
fn test_heap_full_flush_names_key_and_recovers() {
    let temp = TempDir::new().unwrap();
    let engine = Engine::open(tiny_config(&temp)).unwrap();
    for i in 0..5 {
        engine.put(&key(i), &value(i)).unwrap();
    }

    let err = engine.flush().unwrap_err();
    assert!(matches!(err, FlatError::HeapFull { .. }));
    let overflowed = err.overflowed_key().unwrap().to_vec();

    // Nothing landed and every write is still served from the cache
    assert_eq!(engine.heap_stats().unwrap().elements, 0);
    for i in 0..5 {
        assert_eq!(engine.get(&key(i)).unwrap(), Some(value(i)));
    }
    assert!(matches!(engine.flush(), Err(FlatError::HeapFull { .. })));

    assert!(engine.discard_pending(&overflowed).unwrap());
    engine.flush().unwrap();
    assert_eq!(engine.heap_stats().unwrap().elements, 4);
    engine.close().unwrap();

    let engine = Engine::open(tiny_config(&temp)).unwrap();
    let kept = (0..5)
        .filter(|&i| engine.get(&key(i)).unwrap().is_some())
        .count();
    assert_eq!(kept, 4);
    assert_eq!(engine.get(&overflowed).unwrap(), None);
}

#[test]
fn test_close_after_heap_full_releases_directory() {
    let temp = TempDir::new().unwrap();
    let engine = Engine::open(tiny_config(&temp)).unwrap();
    for i in 0..5 {
        engine.put(&key(i), &value(i)).unwrap();
    }

    assert!(matches!(engine.close(), Err(FlatError::HeapFull { .. })));
    assert!(!engine.is_alive());
    assert!(engine.close().is_ok());

    let reopened = Engine::open(tiny_config(&temp)).unwrap();
    assert_eq!(reopened.heap_stats().unwrap().elements, 0);
}

#[test]
fn test_batch_lands_whole_when_auto_flush_overflows() {
    let temp = TempDir::new().unwrap();
    let cfg = Config {
        uncommitted_limit: 2,
        flags: CreationFlags {
            support_additional_kv: true,
            atomic_batches: true,
            ..Default::default()
        },
        ..tiny_config(&temp)
    };
    let engine = Engine::open(cfg).unwrap();

    let mut batch = WriteBatch::new();
    for i in 0..5 {
        batch.put(key(i), value(i));
    }
    batch.put(b"head".to_vec(), b"5".to_vec());
    let err = engine.update_batch(&batch).unwrap_err();
    let overflowed = err.overflowed_key().unwrap().to_vec();

    // Both halves are in place: the aux pair and every staged heap pair
    assert_eq!(engine.get(b"head").unwrap(), Some(b"5".to_vec()));
    for i in 0..5 {
        assert_eq!(engine.get(&key(i)).unwrap(), Some(value(i)));
    }

    engine.discard_pending(&overflowed).unwrap();
    engine.flush().unwrap();
    assert_eq!(engine.heap_stats().unwrap().elements, 4);
    assert_eq!(engine.keys().unwrap().len(), 5);
}

// =============================================================================
// Concurrency
// =============================================================================

fn concurrent_readers(mode: LockMode) {
    init_tracing();
    let temp = TempDir::new().unwrap();
    let cfg = Config {
        lock_mode: mode,
        ..config(&temp)
    };
    let engine = Arc::new(Engine::open(cfg).unwrap());
    for i in 0..64 {
        engine.put(&key(i), &value(i)).unwrap();
    }
    engine.flush().unwrap();

    let handles: Vec<_> = (0..8)
        .map(|t| {
            let engine = Arc::clone(&engine);
            thread::spawn(move || {
                for round in 0..50 {
                    let i = (t * 7 + round) % 64;
                    assert_eq!(engine.get(&key(i)).unwrap(), Some(value(i)));
                }
                engine.keys().unwrap().len()
            })
        })
        .collect();

    for handle in handles {
        assert_eq!(handle.join().unwrap(), 64);
    }
}

#[test]
fn test_concurrent_readers_read_write_mode() {
    concurrent_readers(LockMode::ReadWrite);
}

#[test]
fn test_concurrent_readers_exclusive_mode() {
    concurrent_readers(LockMode::Exclusive);
}

#[test]
fn test_concurrent_readers_lock_free_mode() {
    concurrent_readers(LockMode::LockFreeReads);
}

#[test]
fn test_readers_alongside_writer() {
    let temp = TempDir::new().unwrap();
    let engine = Arc::new(Engine::open(config(&temp)).unwrap());
    for i in 0..32 {
        engine.put(&key(i), &value(i)).unwrap();
    }
    engine.flush().unwrap();

    let writer = {
        let engine = Arc::clone(&engine);
        thread::spawn(move || {
            for i in 32..128 {
                engine.put(&key(i), &value(i)).unwrap();
                if i % 16 == 0 {
                    engine.flush().unwrap();
                }
            }
        })
    };
    let readers: Vec<_> = (0..4)
        .map(|_| {
            let engine = Arc::clone(&engine);
            thread::spawn(move || {
                for i in 0..32 {
                    assert_eq!(engine.get(&key(i)).unwrap(), Some(value(i)));
                }
            })
        })
        .collect();

    writer.join().unwrap();
    for reader in readers {
        reader.join().unwrap();
    }
    engine.flush().unwrap();
    assert_eq!(engine.keys().unwrap().len(), 128);
}
