//! Integration tests for key/tuple stores

use cascade_foundation::{FieldType, ValueInterner, ValueResolver};
use cascade_memory::{JoinTuple, KeyMode, KeysStore, MemoryKey};
use proptest::prelude::*;

fn tuple(interner: &mut ValueInterner, values: &[i64]) -> JoinTuple {
    let keys: Vec<MemoryKey> = values
        .iter()
        .map(|&v| MemoryKey::new(vec![interner.handle(FieldType::Int, v.into())]))
        .collect();
    JoinTuple::new(keys)
}

#[test]
fn second_production_of_a_tuple_is_known_delta() {
    let mut interner = ValueInterner::new();
    let mut store = KeysStore::new(4);
    assert_eq!(store.insert(tuple(&mut interner, &[1, 2])), KeyMode::NewDelta);
    assert_eq!(store.merge(), 1);

    assert_eq!(store.insert(tuple(&mut interner, &[1, 2])), KeyMode::KnownDelta);
    assert_eq!(store.insert(tuple(&mut interner, &[3, 4])), KeyMode::NewDelta);
    assert_eq!(store.len(), 2);
    assert_eq!(store.rows(KeyMode::Main).count(), 0);
    assert_eq!(store.rows(KeyMode::KnownDelta).count(), 1);
    assert_eq!(store.rows(KeyMode::NewDelta).count(), 1);
}

#[test]
fn purge_then_merge_does_not_resurrect() {
    let mut interner = ValueInterner::new();
    let mut store = KeysStore::new(4);
    let doomed = tuple(&mut interner, &[9]);
    store.insert(doomed.clone());
    store.insert(tuple(&mut interner, &[10]));
    store.merge();

    assert_eq!(store.purge(|t| *t == doomed), 1);
    assert!(store.was_removed(doomed.keys()));
    store.clear_removed();
    assert!(!store.has_removed());

    assert_eq!(store.merge(), 0);
    assert!(!store.contains(&doomed));
    assert_eq!(store.main_len(), 1);
}

proptest! {
    #[test]
    fn modes_partition_the_store(
        first in prop::collection::vec(0i64..20, 0..30),
        second in prop::collection::vec(0i64..20, 0..30),
    ) {
        let mut interner = ValueInterner::new();
        let mut store = KeysStore::new(2);
        for v in &first {
            store.insert(tuple(&mut interner, &[*v]));
        }
        store.merge();
        for v in &second {
            store.insert(tuple(&mut interner, &[*v]));
        }

        let by_mode: usize = KeyMode::ALL.iter().map(|&m| store.rows(m).count()).sum();
        prop_assert_eq!(by_mode, store.len());

        let mut distinct = first.clone();
        distinct.extend(&second);
        distinct.sort_unstable();
        distinct.dedup();
        prop_assert_eq!(store.len(), distinct.len());

        // Merge is idempotent.
        store.merge();
        let len = store.len();
        prop_assert_eq!(store.merge(), 0);
        prop_assert_eq!(store.len(), len);
        prop_assert_eq!(store.rows(KeyMode::Main).count(), len);
    }
}
