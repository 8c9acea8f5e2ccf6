//! Integration tests for type memories and their alpha buckets

use std::sync::Arc;

use cascade_foundation::{Fact, FactRecord, FieldType, TypeRegistry, ValueInterner, alpha_test};
use cascade_memory::{AlphaMask, FieldsKey, KeyMode, TypeMemory};

/// A type memory driven by hand through commit steps.
struct Harness {
    registry: TypeRegistry,
    interner: ValueInterner,
    memory: TypeMemory,
}

impl Harness {
    fn new() -> Self {
        let registry = TypeRegistry::new();
        let ty = registry
            .declare_type(
                "Parcel",
                &[("zone", FieldType::Str), ("kg", FieldType::Int)],
            )
            .unwrap();
        let memory = TypeMemory::new(&registry.descriptor(ty).unwrap(), 4);
        Self {
            registry,
            interner: ValueInterner::new(),
            memory,
        }
    }

    fn sync(&mut self) {
        let ty = self.memory.type_id();
        self.memory
            .sync_schema(
                self.registry.active_fields(ty),
                self.registry.alpha_conditions(ty),
                &mut self.interner,
            )
            .unwrap();
    }

    /// Returns the bucket keyed by `zone`, optionally only heavy parcels.
    fn zone_bucket(&mut self, heavy_only: bool) -> usize {
        let ty = self.memory.type_id();
        let zone = self.registry.register_field(ty, "zone").unwrap();
        let mut mask = Vec::new();
        if heavy_only {
            let kg = self.registry.register_field(ty, "kg").unwrap();
            let heavy = self
                .registry
                .register_alpha(
                    ty,
                    kg.index,
                    "heavy",
                    alpha_test(|v| Ok(v.as_int().is_some_and(|kg| kg >= 20))),
                )
                .unwrap();
            mask.push(heavy.id);
        }
        self.sync();
        let (index, _) = self
            .memory
            .touch_bucket(FieldsKey::new(ty, vec![zone.index]), AlphaMask::new(mask))
            .unwrap();
        index
    }

    fn insert(&mut self, facts: &[(&str, i64)]) -> Vec<u64> {
        let batch: Vec<(u64, FactRecord)> = facts
            .iter()
            .map(|&(zone, kg)| {
                let fact = Fact::new("Parcel").with("zone", zone).with("kg", kg).into_shared();
                let id = self.memory.register_new_fact(&fact).unwrap();
                (id, self.memory.build_record(fact, &mut self.interner).unwrap())
            })
            .collect();
        let ids = batch.iter().map(|(id, _)| *id).collect();
        self.memory.insert_batch(&batch).unwrap();
        self.memory.commit_insert(batch);
        ids
    }

    fn delete(&mut self, ids: &[u64]) {
        self.memory.retract_batch(ids).unwrap();
        self.memory.commit_delete(ids);
    }

    fn rows(&self, bucket: usize, mode: KeyMode) -> usize {
        self.memory.bucket(bucket).unwrap().rows(mode).count()
    }
}

#[test]
fn masks_route_to_matching_buckets_only() {
    let mut h = Harness::new();
    let all = h.zone_bucket(false);
    let heavy = h.zone_bucket(true);
    assert_ne!(all, heavy);

    h.insert(&[("north", 5), ("north", 25), ("south", 30), ("east", 1)]);
    let all_bucket = h.memory.bucket(all).unwrap();
    let heavy_bucket = h.memory.bucket(heavy).unwrap();
    assert_eq!(all_bucket.fact_count(), 4);
    assert_eq!(all_bucket.key_count(), 3);
    assert_eq!(heavy_bucket.fact_count(), 2);
    assert_eq!(heavy_bucket.key_count(), 2);
}

#[test]
fn touching_an_existing_shape_reuses_the_bucket() {
    let mut h = Harness::new();
    let first = h.zone_bucket(false);
    let again = h.zone_bucket(false);
    assert_eq!(first, again);
    assert_eq!(h.memory.buckets().len(), 1);
}

#[test]
fn new_bucket_is_backfilled_as_fresh_rows() {
    let mut h = Harness::new();
    let all = h.zone_bucket(false);
    h.insert(&[("north", 25), ("south", 30), ("south", 2)]);
    h.memory.merge_insert_deltas();
    assert!(!h.memory.has_insert_delta());

    let heavy = h.zone_bucket(true);
    assert!(h.memory.has_insert_delta());
    assert_eq!(h.rows(heavy, KeyMode::NewDelta), 2);
    assert_eq!(h.rows(heavy, KeyMode::Main), 0);
    // The old bucket is untouched by the backfill.
    assert!(!h.memory.bucket(all).unwrap().has_insert_delta());

    h.memory.merge_insert_deltas();
    assert_eq!(h.rows(heavy, KeyMode::Main), 2);
}

#[test]
fn rows_move_from_new_to_known_to_main() {
    let mut h = Harness::new();
    let b = h.zone_bucket(false);
    h.insert(&[("north", 1)]);
    assert_eq!(h.rows(b, KeyMode::NewDelta), 1);
    h.memory.merge_insert_deltas();

    h.insert(&[("north", 2), ("west", 3)]);
    assert_eq!(h.rows(b, KeyMode::Main), 0);
    assert_eq!(h.rows(b, KeyMode::KnownDelta), 1);
    assert_eq!(h.rows(b, KeyMode::NewDelta), 1);

    h.memory.merge_insert_deltas();
    assert_eq!(h.rows(b, KeyMode::Main), 2);
    assert_eq!(h.rows(b, KeyMode::KnownDelta), 0);
    assert_eq!(h.rows(b, KeyMode::NewDelta), 0);
}

#[test]
fn merging_twice_changes_nothing() {
    let mut h = Harness::new();
    let b = h.zone_bucket(false);
    h.insert(&[("north", 1), ("south", 2)]);
    h.memory.merge_insert_deltas();
    let before: Vec<usize> = KeyMode::ALL.iter().map(|&m| h.rows(b, m)).collect();
    h.memory.merge_insert_deltas();
    h.memory.merge_delete_deltas();
    let after: Vec<usize> = KeyMode::ALL.iter().map(|&m| h.rows(b, m)).collect();
    assert_eq!(before, after);
    assert_eq!(h.memory.bucket(b).unwrap().fact_count(), 2);
}

#[test]
fn retracted_keys_do_not_come_back() {
    let mut h = Harness::new();
    let b = h.zone_bucket(false);
    let ids = h.insert(&[("north", 1), ("north", 2)]);
    h.memory.merge_insert_deltas();

    h.delete(&ids[..1]);
    let bucket = h.memory.bucket(b).unwrap();
    assert_eq!(bucket.key_count(), 1);
    assert_eq!(bucket.deleted_keys().count(), 0);

    h.delete(&ids[1..]);
    let bucket = h.memory.bucket(b).unwrap();
    assert_eq!(bucket.key_count(), 0);
    assert_eq!(bucket.deleted_keys().count(), 1);
    assert!(h.memory.has_delete_delta());
    h.memory.merge_delete_deltas();
    assert!(h.memory.is_empty());

    // Merges after the fact never resurrect anything.
    h.memory.merge_insert_deltas();
    assert_eq!(h.memory.bucket(b).unwrap().key_count(), 0);

    // The same values come back as a brand new row.
    h.insert(&[("north", 1)]);
    assert_eq!(h.rows(b, KeyMode::NewDelta), 1);
}

#[test]
fn late_fields_reach_committed_records() {
    let mut h = Harness::new();
    h.insert(&[("north", 1), ("south", 40)]);
    h.memory.merge_insert_deltas();
    assert!(h.memory.iter().all(|(_, r)| r.values().is_empty()));

    let heavy = h.zone_bucket(true);
    assert!(h.memory.iter().all(|(_, r)| r.values().len() == 2));
    assert_eq!(h.memory.bucket(heavy).unwrap().fact_count(), 1);
}

#[test]
fn clear_empties_buckets_but_keeps_them() {
    let mut h = Harness::new();
    let b = h.zone_bucket(false);
    let fact: Arc<Fact> = Fact::new("Parcel").with("zone", "x").into_shared();
    let id = h.memory.register_new_fact(&fact).unwrap();
    let record = h.memory.build_record(fact.clone(), &mut h.interner).unwrap();
    h.memory.insert_batch(&[(id, record.clone())]).unwrap();
    h.memory.commit_insert(vec![(id, record)]);

    h.memory.clear();
    assert!(h.memory.is_empty());
    assert_eq!(h.memory.buckets().len(), 1);
    assert_eq!(h.memory.bucket(b).unwrap().key_count(), 0);
    assert_eq!(h.memory.identity_of(&fact), None);
}
