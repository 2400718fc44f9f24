use flatstore::backend::{Backend, WriteBatch};
use flatstore::config::Config;
use flatstore::error::FlatError;
use flatstore::heap::{DATA_FILENAME, INDEX_FILENAME};
use flatstore::lock_file::LOCK_FILENAME;
use flatstore::store::{HeapStore, DESCRIPTION_FILENAME};
use tempfile::TempDir;

use crate::heap_config;

// =============================================================================
// Reopen
// =============================================================================

#[test]
fn test_open_creates_heap_files() {
    let temp = TempDir::new().unwrap();
    let dir = temp.path().join("heap");
    let _store = HeapStore::open(heap_config(&dir, 8)).unwrap();

    assert!(dir.join(INDEX_FILENAME).exists());
    assert!(dir.join(DATA_FILENAME).exists());
    assert!(dir.join(DESCRIPTION_FILENAME).exists());
    assert!(dir.join(LOCK_FILENAME).exists());
}

#[test]
fn test_batch_survives_reopen() {
    let temp = TempDir::new().unwrap();
    {
        let store = HeapStore::open(heap_config(temp.path(), 32)).unwrap();
        let mut batch = WriteBatch::new();
        for i in 0..10u8 {
            batch.put(vec![b'k', i], vec![i; 40]);
        }
        store.update_batch(&batch).unwrap();
        store.close().unwrap();
    }

    let store = HeapStore::open(heap_config(temp.path(), 32)).unwrap();
    assert_eq!(store.keys().unwrap().len(), 10);
    assert_eq!(store.get(&[b'k', 7]).unwrap(), Some(vec![7; 40]));
    let stats = store.heap_stats().unwrap();
    assert_eq!(stats.elements, 10);
    assert!(stats.data_used > 0);
}

#[test]
fn test_large_page_size() {
    let temp = TempDir::new().unwrap();
    let config = Config {
        page_size: 16384,
        ..heap_config(temp.path(), 8)
    };
    {
        let store = HeapStore::open(config.clone()).unwrap();
        store.put(b"k", b"v").unwrap();
        store.close().unwrap();
    }
    let store = HeapStore::open(config).unwrap();
    assert_eq!(store.index().heap().geometry().page_size, 16384);
    assert_eq!(store.get(b"k").unwrap(), Some(b"v".to_vec()));
}

#[test]
fn test_read_only_reopen() {
    let temp = TempDir::new().unwrap();
    {
        let store = HeapStore::open(heap_config(temp.path(), 8)).unwrap();
        store.put(b"k", b"v").unwrap();
        store.close().unwrap();
    }

    let config = Config {
        read_only: true,
        ..heap_config(temp.path(), 8)
    };
    let store = HeapStore::open(config).unwrap();
    assert_eq!(store.get(b"k").unwrap(), Some(b"v".to_vec()));
    assert!(matches!(
        store.put(b"x", b"y"),
        Err(FlatError::ReadOnlyViolation)
    ));
    assert!(store.close().is_ok());
}

// =============================================================================
// Deletion Modes
// =============================================================================

#[test]
fn test_tombstones_persist() {
    let temp = TempDir::new().unwrap();
    let config = Config {
        flags: flatstore::CreationFlags {
            support_null_values: true,
            atomic_batches: true,
            ..Default::default()
        },
        ..heap_config(temp.path(), 8)
    };
    {
        let store = HeapStore::open(config.clone()).unwrap();
        store.put(b"k", b"v").unwrap();
        store.delete(b"k").unwrap();
        assert_eq!(store.get(b"k").unwrap(), None);
        assert!(store.index().is_tombstoned(b"k").unwrap());
        store.close().unwrap();
    }

    let store = HeapStore::open(config).unwrap();
    assert_eq!(store.get(b"k").unwrap(), None);
    assert!(!store.keys().unwrap().contains(b"k".as_slice()));

    // A value written after the tombstone takes its place
    store.put(b"k", b"again").unwrap();
    assert_eq!(store.get(b"k").unwrap(), Some(b"again".to_vec()));
}

#[test]
fn test_removal_frees_key_for_new_value() {
    let temp = TempDir::new().unwrap();
    let config = Config {
        flags: flatstore::CreationFlags {
            allow_removals: true,
            atomic_batches: true,
            ..Default::default()
        },
        ..heap_config(temp.path(), 8)
    };
    let store = HeapStore::open(config).unwrap();
    store.put(b"k", b"old").unwrap();
    store.delete(b"k").unwrap();
    assert_eq!(store.get(b"k").unwrap(), None);
    assert_eq!(store.index().element_count(), 0);

    store.put(b"k", b"new").unwrap();
    assert_eq!(store.get(b"k").unwrap(), Some(b"new".to_vec()));
}

#[test]
fn test_removals_ignored_without_deletion_support() {
    let temp = TempDir::new().unwrap();
    let store = HeapStore::open(heap_config(temp.path(), 8)).unwrap();
    store.put(b"k", b"v").unwrap();
    store.delete(b"k").unwrap();
    assert_eq!(store.get(b"k").unwrap(), Some(b"v".to_vec()));
}
