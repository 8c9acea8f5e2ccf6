//! Integration tests for linear hash tables
//!
//! Tests growth, shrinking after mass deletion, and resize targets.

use cascade_foundation::linear_hash::MAXIMUM_CAPACITY;
use cascade_foundation::{ErrorKind, LinearHash, LinearHashMap};
use proptest::prelude::*;

// =============================================================================
// Growth and shrinking
// =============================================================================

#[test]
fn table_grows_past_half_full() {
    let mut table: LinearHash<u64> = LinearHash::with_capacity(4);
    for i in 0..1_000 {
        table.insert(i);
        assert!(2 * table.len() < table.capacity());
    }
    assert_eq!(table.len(), 1_000);
    assert!(table.capacity().is_power_of_two());
}

#[test]
fn mass_deletion_gives_memory_back() {
    let mut map: LinearHashMap<u64, String> = LinearHashMap::with_capacity(16);
    for i in 0..10_000 {
        map.insert(i, i.to_string());
    }
    let grown = map.capacity();
    assert!(grown >= 20_000);

    for i in 10..10_000 {
        assert_eq!(map.remove(&i), Some(i.to_string()));
    }
    assert_eq!(map.len(), 10);
    assert!(map.capacity() <= 64, "capacity {} after shrink", map.capacity());
    for i in 0..10 {
        assert_eq!(map.get(&i), Some(&i.to_string()));
    }
    assert_eq!(map.get(&10), None);
}

#[test]
fn shrink_stops_at_minimum_capacity() {
    let mut table: LinearHash<u64> = LinearHash::with_capacity(128);
    for i in 0..500 {
        table.insert(i);
    }
    for i in 0..500 {
        table.remove(&i);
    }
    assert!(table.is_empty());
    assert_eq!(table.capacity(), 128);
}

#[test]
fn scans_stay_in_insertion_order_across_rebuilds() {
    let mut map: LinearHashMap<u32, u32> = LinearHashMap::with_capacity(2);
    for i in 0..200 {
        map.insert(i, i * 2);
    }
    for i in (0..200).filter(|i| i % 3 != 0) {
        map.remove(&i);
    }
    let keys: Vec<u32> = map.keys().copied().collect();
    let expected: Vec<u32> = (0..200).filter(|i| i % 3 == 0).collect();
    assert_eq!(keys, expected);
}

// =============================================================================
// Resize targets
// =============================================================================

#[test]
fn target_below_live_count_is_raised() {
    let mut table: LinearHash<u64> = LinearHash::with_capacity(2);
    for i in 0..100 {
        table.insert(i);
    }
    let capacity = table.capacity();
    table.try_resize(0).unwrap();
    assert_eq!(table.len(), 100);
    assert_eq!(table.capacity(), capacity);
    assert!((0..100).all(|i| table.contains(&i)));
}

#[test]
fn oversized_target_is_rejected_and_table_kept() {
    let mut table: LinearHash<u64> = LinearHash::with_capacity(8);
    table.insert(7);
    let err = table.try_resize(MAXIMUM_CAPACITY).unwrap_err();
    assert!(matches!(
        err.kind,
        ErrorKind::CapacityExceeded { maximum, .. } if maximum == MAXIMUM_CAPACITY
    ));
    assert_eq!(table.capacity(), 8);
    assert!(table.contains(&7));
}

// =============================================================================
// Model check
// =============================================================================

proptest! {
    #[test]
    fn map_agrees_with_std_after_churn(ops in prop::collection::vec((0u16..64, any::<bool>()), 0..400)) {
        let mut map: LinearHashMap<u16, usize> = LinearHashMap::with_capacity(2);
        let mut model = std::collections::HashMap::new();
        for (step, (key, insert)) in ops.into_iter().enumerate() {
            if insert {
                prop_assert_eq!(map.insert(key, step), model.insert(key, step));
            } else {
                prop_assert_eq!(map.remove(&key), model.remove(&key));
            }
            prop_assert_eq!(map.len(), model.len());
            prop_assert!(2 * (map.len() + map.tombstones()) < map.capacity());
        }
        for (key, value) in &model {
            prop_assert_eq!(map.get(key), Some(value));
        }
    }
}
