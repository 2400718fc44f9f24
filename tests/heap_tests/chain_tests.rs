use std::collections::BTreeSet;

use flatstore::backend::Backend;
use flatstore::error::FlatError;
use flatstore::hash::content_hash;
use flatstore::store::HeapStore;
use proptest::prelude::*;
use tempfile::TempDir;

use crate::{heap_config, zero_hash};

// =============================================================================
// Forced Collisions
// =============================================================================

#[test]
fn test_four_colliding_keys_fill_capacity_four() {
    let temp = TempDir::new().unwrap();
    let store = HeapStore::open_with_slot_hash(heap_config(temp.path(), 4), zero_hash).unwrap();

    let keys: [&[u8]; 4] = [b"A", b"B", b"C", b"D"];
    for key in keys {
        store.put(key, &[key[0]; 3]).unwrap();
    }
    for key in keys {
        assert_eq!(store.get(key).unwrap(), Some(vec![key[0]; 3]));
    }

    let err = store.put(b"E", b"EEE").unwrap_err();
    assert!(matches!(err, FlatError::HeapFull { .. }), "got {err:?}");

    // The failed insert left nothing behind
    for key in keys {
        assert_eq!(store.get(key).unwrap(), Some(vec![key[0]; 3]));
    }
    assert_eq!(store.get(b"E").unwrap(), None);
    let expected: BTreeSet<Vec<u8>> = keys.iter().map(|k| k.to_vec()).collect();
    assert_eq!(store.keys().unwrap(), expected);
    assert_eq!(store.index().element_count(), 4);
}

#[test]
fn test_chain_walk_cost_grows_with_position() {
    let temp = TempDir::new().unwrap();
    let store = HeapStore::open_with_slot_hash(heap_config(temp.path(), 8), zero_hash).unwrap();
    for key in [b"a", b"b", b"c"] {
        store.put(key, b"v").unwrap();
    }
    store.index().reset_stats();

    store.get(b"a").unwrap();
    let first = store.index().stats();
    store.get(b"c").unwrap();
    let third = store.index().stats();

    assert_eq!(first.lookups, 1);
    assert_eq!(first.slot_checks, 1);
    assert_eq!(third.slot_checks - first.slot_checks, 3);
}

#[test]
fn test_first_writer_wins() {
    let temp = TempDir::new().unwrap();
    let store = HeapStore::open(heap_config(temp.path(), 8)).unwrap();
    store.put(b"key", b"first").unwrap();
    store.put(b"key", b"second").unwrap();
    assert_eq!(store.get(b"key").unwrap(), Some(b"first".to_vec()));
    assert_eq!(store.index().element_count(), 1);
}

#[test]
fn test_capacity_plus_one_is_heap_full() {
    let temp = TempDir::new().unwrap();
    let store = HeapStore::open(heap_config(temp.path(), 16)).unwrap();

    let values: Vec<Vec<u8>> = (0..16u32).map(|i| i.to_le_bytes().to_vec()).collect();
    for value in &values {
        store.put(&content_hash(value), value).unwrap();
    }

    let overflow = 99u32.to_le_bytes();
    assert!(matches!(
        store.put(&content_hash(&overflow), &overflow),
        Err(FlatError::HeapFull { .. })
    ));
    for value in &values {
        assert_eq!(store.get(&content_hash(value)).unwrap(), Some(value.clone()));
    }
}

// =============================================================================
// Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_distinct_keys_all_retrievable(
        keys in prop::collection::btree_set(prop::collection::vec(any::<u8>(), 1..24), 1..32)
    ) {
        let temp = TempDir::new().unwrap();
        let store = HeapStore::open(heap_config(temp.path(), 32)).unwrap();

        for key in &keys {
            let mut value = key.clone();
            value.reverse();
            store.put(key, &value).unwrap();
        }
        for key in &keys {
            let mut value = key.clone();
            value.reverse();
            prop_assert_eq!(store.get(key).unwrap(), Some(value));
        }
        prop_assert_eq!(store.keys().unwrap(), keys);
    }
}
