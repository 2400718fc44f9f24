//! Tests for the crash log
//!
//! These tests verify:
//! - Batch bracketing errors (nested / no open batch)
//! - Recovery of a batch interrupted after its heap mutations
//! - Torn and corrupt log tails

use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;

use flatstore::backend::Backend;
use flatstore::config::{Config, CreationFlags, LogSyncStrategy};
use flatstore::crashlog::{CrashLog, LogOp, LogRecovery, LOG_FILENAME};
use flatstore::error::FlatError;
use flatstore::heap::HeapAllocator;
use flatstore::index::{HashIndex, IndexOptions};
use flatstore::store::HeapStore;
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

fn config(dir: &Path) -> Config {
    Config::builder()
        .data_dir(dir)
        .capacity(16)
        .heap_byte_capacity(64 * 1024)
        .log_sync(LogSyncStrategy::EveryEntry)
        .build()
}

/// Create a store holding `committed`, then apply `interrupted` under a crash
/// log that is never ended, as a process dying mid-batch would leave it.
fn crash_mid_batch(dir: &Path, committed: &[&[u8]], interrupted: &[&[u8]]) {
    {
        let store = HeapStore::open(config(dir)).unwrap();
        for key in committed {
            store.put(key, b"committed").unwrap();
        }
        store.close().unwrap();
    }

    let (heap, mut writer) = HeapAllocator::open(dir).unwrap();
    let index = HashIndex::new(heap, IndexOptions::from(&CreationFlags::default()));
    index.rebuild(&mut writer).unwrap();

    let mut log = CrashLog::new(dir, LogSyncStrategy::EveryEntry);
    log.begin().unwrap();
    for key in interrupted {
        index.put(&mut writer, &mut log, key, b"interrupted").unwrap();
    }
    index.sync().unwrap();
    assert!(log.entries() > 1);
    // Dropped without end(): the log stays behind
}

// =============================================================================
// Bracketing
// =============================================================================

#[test]
fn test_nested_begin_rejected() {
    let temp = TempDir::new().unwrap();
    let mut log = CrashLog::new(temp.path(), LogSyncStrategy::EveryEntry);
    log.begin().unwrap();
    assert!(matches!(log.begin(), Err(FlatError::NestedBatch)));
    log.end().unwrap();
    assert!(!log.exists());
}

#[test]
fn test_end_without_begin_rejected() {
    let temp = TempDir::new().unwrap();
    let mut log = CrashLog::new(temp.path(), LogSyncStrategy::EveryEntry);
    assert!(matches!(log.end(), Err(FlatError::NoOpenBatch)));
}

#[test]
fn test_log_exists_only_while_batch_open() {
    let temp = TempDir::new().unwrap();
    let mut log = CrashLog::new(temp.path(), LogSyncStrategy::EveryNEntries { count: 8 });
    assert!(!temp.path().join(LOG_FILENAME).exists());
    log.begin().unwrap();
    assert!(temp.path().join(LOG_FILENAME).exists());

    let (entries, torn) = LogRecovery::read(log.path()).unwrap();
    assert!(!torn);
    assert!(matches!(entries[0].op, LogOp::Begin { .. }));

    log.end().unwrap();
    assert!(!temp.path().join(LOG_FILENAME).exists());
}

// =============================================================================
// Recovery
// =============================================================================

#[test]
fn test_interrupted_batch_is_undone_on_open() {
    let temp = TempDir::new().unwrap();
    crash_mid_batch(temp.path(), &[b"a", b"b"], &[b"c", b"d", b"e"]);
    assert!(temp.path().join(LOG_FILENAME).exists());

    let store = HeapStore::open(config(temp.path())).unwrap();
    let report = store.recovery_report().unwrap();
    assert!(report.entries_replayed >= 3);
    assert!(!report.torn_tail);
    assert!(!temp.path().join(LOG_FILENAME).exists());

    assert_eq!(store.get(b"a").unwrap(), Some(b"committed".to_vec()));
    assert_eq!(store.get(b"b").unwrap(), Some(b"committed".to_vec()));
    for key in [b"c", b"d", b"e"] {
        assert_eq!(store.get(key).unwrap(), None);
    }
    assert_eq!(store.keys().unwrap().len(), 2);
    assert_eq!(store.index().element_count(), 2);

    // The undone keys can be written again
    store.put(b"c", b"fresh").unwrap();
    assert_eq!(store.get(b"c").unwrap(), Some(b"fresh".to_vec()));
}

#[test]
fn test_torn_tail_is_discarded() {
    let temp = TempDir::new().unwrap();
    crash_mid_batch(temp.path(), &[b"a"], &[b"b"]);

    let mut file = OpenOptions::new()
        .append(true)
        .open(temp.path().join(LOG_FILENAME))
        .unwrap();
    file.write_all(&[0x20, 0, 0, 0, 0xde, 0xad]).unwrap();
    drop(file);

    let store = HeapStore::open(config(temp.path())).unwrap();
    assert!(store.recovery_report().unwrap().torn_tail);
    assert_eq!(store.get(b"a").unwrap(), Some(b"committed".to_vec()));
    assert_eq!(store.get(b"b").unwrap(), None);
}

#[test]
fn test_corrupt_frame_before_tail_refuses_to_open() {
    let temp = TempDir::new().unwrap();
    crash_mid_batch(temp.path(), &[], &[b"a", b"b"]);

    // Flip a payload byte of the first (Begin) frame
    let path = temp.path().join(LOG_FILENAME);
    let mut bytes = std::fs::read(&path).unwrap();
    bytes[8] ^= 0xff;
    std::fs::write(&path, bytes).unwrap();

    assert!(matches!(
        HeapStore::open(config(temp.path())),
        Err(FlatError::Corruption(_))
    ));
    assert!(path.exists());
}

#[test]
fn test_recovery_refused_read_only() {
    let temp = TempDir::new().unwrap();
    crash_mid_batch(temp.path(), &[b"a"], &[b"b"]);

    let read_only = Config {
        read_only: true,
        ..config(temp.path())
    };
    assert!(matches!(
        HeapStore::open(read_only),
        Err(FlatError::Config(_))
    ));
    assert!(HeapStore::open(config(temp.path())).is_ok());
}
