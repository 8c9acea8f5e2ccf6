//! Alpha buckets: facts of one type indexed by join key.
//!
//! A bucket is identified by a [`FieldsKey`] (which active fields form the
//! join key) and an [`AlphaMask`] (which alpha conditions a fact must pass).
//! Inserted facts are buffered as *fresh* until [`AlphaBucket::merge_insert_delta`]
//! confirms them, which lets every bucket of a commit cycle take its inserts
//! before any join observes a merged state.

use std::fmt;
use std::sync::Arc;

use cascade_foundation::{
    Error, FactRecord, LinearHash, LinearHashMap, Result, TypeId, ValueHandle,
};

use crate::keys::{KeyMode, MemoryKey};

/// Sorted set of alpha condition ids a fact must pass.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct AlphaMask(Arc<[usize]>);

impl AlphaMask {
    /// Creates a mask from condition ids.
    #[must_use]
    pub fn new(ids: impl IntoIterator<Item = usize>) -> Self {
        let mut ids: Vec<usize> = ids.into_iter().collect();
        ids.sort_unstable();
        ids.dedup();
        Self(ids.into())
    }

    /// Returns the condition ids.
    #[must_use]
    pub fn ids(&self) -> &[usize] {
        &self.0
    }

    /// Returns true if the mask accepts every fact.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Tests cached alpha results against the mask.
    ///
    /// Conditions missing from `results` count as failed.
    #[must_use]
    pub fn test(&self, results: &[bool]) -> bool {
        self.0.iter().all(|&id| results.get(id).copied().unwrap_or(false))
    }
}

/// The active fields that form a bucket's join key.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct FieldsKey {
    /// The fact type.
    pub type_id: TypeId,
    fields: Arc<[usize]>,
}

impl FieldsKey {
    /// Creates a key shape from active field indices, in key order.
    #[must_use]
    pub fn new(type_id: TypeId, fields: impl Into<Arc<[usize]>>) -> Self {
        Self {
            type_id,
            fields: fields.into(),
        }
    }

    /// Returns the active field indices.
    #[must_use]
    pub fn fields(&self) -> &[usize] {
        &self.fields
    }

    /// Returns where an active field sits within the key.
    #[must_use]
    pub fn position(&self, field_index: usize) -> Option<usize> {
        self.fields.iter().position(|&f| f == field_index)
    }

    /// Builds the key a record contributes.
    ///
    /// # Errors
    ///
    /// Returns `Internal` if the record does not cache a key field.
    pub fn key_of(&self, record: &FactRecord) -> Result<MemoryKey> {
        let handles = self
            .fields
            .iter()
            .map(|&f| {
                record.value(f).ok_or_else(|| {
                    Error::internal(format!("record has no value for active field {f}"))
                })
            })
            .collect::<Result<Vec<ValueHandle>>>()?;
        Ok(MemoryKey::new(handles))
    }
}

// Most keys hold a handful of facts; per-key tables start small.
const KEY_FACTS_MIN_CAPACITY: usize = 4;

/// The facts that share one key: confirmed ones and fresh ones.
#[derive(Clone, Debug)]
pub struct KeyFacts {
    confirmed: LinearHash<u64>,
    fresh: LinearHash<u64>,
}

impl KeyFacts {
    fn new() -> Self {
        Self {
            confirmed: LinearHash::with_capacity(KEY_FACTS_MIN_CAPACITY),
            fresh: LinearHash::with_capacity(KEY_FACTS_MIN_CAPACITY),
        }
    }

    /// Iterates fact ids confirmed in earlier cycles.
    pub fn confirmed(&self) -> impl ExactSizeIterator<Item = u64> + '_ {
        self.confirmed.iter().copied()
    }

    /// Iterates fact ids inserted this cycle.
    pub fn fresh(&self) -> impl ExactSizeIterator<Item = u64> + '_ {
        self.fresh.iter().copied()
    }

    /// Returns the number of facts under the key.
    #[must_use]
    pub fn len(&self) -> usize {
        self.confirmed.len() + self.fresh.len()
    }

    /// Returns true if no fact remains under the key.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns true if the key gained facts this cycle.
    #[must_use]
    pub fn has_fresh(&self) -> bool {
        !self.fresh.is_empty()
    }

    fn remove(&mut self, id: u64) -> bool {
        self.confirmed.remove(&id).is_some() || self.fresh.remove(&id).is_some()
    }

    fn confirm(&mut self) {
        self.confirmed.reserve(self.fresh.len());
        for id in self.fresh.drain() {
            self.confirmed.insert(id);
        }
    }
}

/// Facts of one type that pass a mask, grouped by join key.
pub struct AlphaBucket {
    fields: FieldsKey,
    mask: AlphaMask,
    keys: LinearHashMap<MemoryKey, KeyFacts>,
    new_keys: LinearHash<MemoryKey>,
    touched: LinearHash<MemoryKey>,
    deleted: LinearHash<MemoryKey>,
    shrunk: LinearHashMap<MemoryKey, usize>,
    insert_delta: bool,
    delete_delta: bool,
}

impl AlphaBucket {
    /// Creates an empty bucket.
    #[must_use]
    pub fn new(fields: FieldsKey, mask: AlphaMask, min_capacity: usize) -> Self {
        Self {
            fields,
            mask,
            keys: LinearHashMap::with_capacity(min_capacity),
            new_keys: LinearHash::with_capacity(min_capacity),
            touched: LinearHash::with_capacity(min_capacity),
            deleted: LinearHash::with_capacity(min_capacity),
            shrunk: LinearHashMap::with_capacity(min_capacity),
            insert_delta: false,
            delete_delta: false,
        }
    }

    /// Returns the bucket's key shape.
    #[must_use]
    pub fn fields(&self) -> &FieldsKey {
        &self.fields
    }

    /// Returns the bucket's mask.
    #[must_use]
    pub fn mask(&self) -> &AlphaMask {
        &self.mask
    }

    /// Returns true if this bucket has the given shape and mask.
    #[must_use]
    pub fn matches(&self, fields: &FieldsKey, mask: &AlphaMask) -> bool {
        self.fields == *fields && self.mask == *mask
    }

    /// Routes a batch of new records into the bucket as fresh facts.
    ///
    /// Returns the number of records that passed the mask.
    ///
    /// # Errors
    ///
    /// Returns `Internal` if a record does not cache a key field.
    pub fn insert(&mut self, records: &[(u64, FactRecord)]) -> Result<usize> {
        let mut routed = 0;
        for (id, record) in records {
            if !self.mask.test(record.alpha()) {
                continue;
            }
            let key = self.fields.key_of(record)?;
            let known = self
                .keys
                .get(&key)
                .is_some_and(|facts| !facts.confirmed.is_empty());
            self.keys
                .get_or_insert_with(key.clone(), KeyFacts::new)
                .fresh
                .insert(*id);
            if known {
                self.touched.insert(key);
            } else {
                self.new_keys.insert(key);
            }
            routed += 1;
        }
        if routed > 0 {
            self.insert_delta = true;
        }
        Ok(routed)
    }

    /// Removes a batch of records from the bucket.
    ///
    /// A key left without facts is dropped and logged as deleted.
    /// Returns the number of facts removed.
    ///
    /// # Errors
    ///
    /// Returns `Internal` if a record does not cache a key field.
    pub fn retract(&mut self, records: &[(u64, FactRecord)]) -> Result<usize> {
        let mut removed = 0;
        for (id, record) in records {
            if !self.mask.test(record.alpha()) {
                continue;
            }
            let key = self.fields.key_of(record)?;
            let Some(facts) = self.keys.get_mut(&key) else {
                continue;
            };
            let before = facts.len();
            if !facts.remove(*id) {
                continue;
            }
            removed += 1;
            if !self.shrunk.contains_key(&key) {
                self.shrunk.insert(key.clone(), before);
            }
            if facts.is_empty() {
                self.keys.remove(&key);
                self.new_keys.remove(&key);
                self.touched.remove(&key);
                self.deleted.insert(key);
            }
        }
        if removed > 0 {
            self.delete_delta = true;
        }
        Ok(removed)
    }

    /// Confirms fresh facts. A no-op if no insert delta is pending.
    ///
    /// Returns true if anything was merged.
    pub fn merge_insert_delta(&mut self) -> bool {
        if !self.insert_delta {
            return false;
        }
        for key in self.new_keys.drain().chain(self.touched.drain()) {
            if let Some(facts) = self.keys.get_mut(&key) {
                facts.confirm();
            }
        }
        self.insert_delta = false;
        true
    }

    /// Ends the delete delta. A no-op if none is pending.
    ///
    /// Returns true if anything was cleared.
    pub fn merge_delete_delta(&mut self) -> bool {
        if !self.delete_delta {
            return false;
        }
        self.deleted.clear();
        self.shrunk.clear();
        self.delete_delta = false;
        true
    }

    /// Returns true if fresh facts await confirmation.
    #[must_use]
    pub fn has_insert_delta(&self) -> bool {
        self.insert_delta
    }

    /// Returns true if facts were removed this cycle.
    #[must_use]
    pub fn has_delete_delta(&self) -> bool {
        self.delete_delta
    }

    /// Iterates the keys of one cursor mode.
    #[must_use]
    pub fn rows(&self, mode: KeyMode) -> Box<dyn Iterator<Item = &MemoryKey> + '_> {
        match mode {
            KeyMode::Main => Box::new(
                self.keys
                    .iter()
                    .filter(|(_, facts)| !facts.has_fresh())
                    .map(|(key, _)| key),
            ),
            KeyMode::KnownDelta => Box::new(self.touched.iter()),
            KeyMode::NewDelta => Box::new(self.new_keys.iter()),
        }
    }

    /// Iterates every key.
    pub fn keys(&self) -> impl Iterator<Item = &MemoryKey> + '_ {
        self.keys.keys()
    }

    /// Returns the facts under a key.
    #[must_use]
    pub fn facts(&self, key: &MemoryKey) -> Option<&KeyFacts> {
        self.keys.get(key)
    }

    /// Returns true if the key was dropped this cycle.
    #[must_use]
    pub fn is_deleted(&self, key: &MemoryKey) -> bool {
        self.deleted.contains(key)
    }

    /// Iterates keys dropped this cycle.
    pub fn deleted_keys(&self) -> impl Iterator<Item = &MemoryKey> + '_ {
        self.deleted.iter()
    }

    /// Iterates keys that lost facts this cycle, with their fact count
    /// before the first removal. Dropped keys are included.
    pub fn shrunk_keys(&self) -> impl Iterator<Item = (&MemoryKey, usize)> + '_ {
        self.shrunk.iter().map(|(key, &before)| (key, before))
    }

    /// Returns true if the key lost facts this cycle.
    #[must_use]
    pub fn was_shrunk(&self, key: &MemoryKey) -> bool {
        self.shrunk.contains_key(key)
    }

    /// Returns the number of facts under a key before this cycle's
    /// removals.
    #[must_use]
    pub fn len_before_deletes(&self, key: &MemoryKey) -> usize {
        self.shrunk
            .get(key)
            .copied()
            .unwrap_or_else(|| self.facts(key).map_or(0, KeyFacts::len))
    }

    /// Returns the number of distinct keys.
    #[must_use]
    pub fn key_count(&self) -> usize {
        self.keys.len()
    }

    /// Returns the number of facts in the bucket.
    #[must_use]
    pub fn fact_count(&self) -> usize {
        self.keys.values().map(KeyFacts::len).sum()
    }

    /// Removes every fact and delta.
    pub fn clear(&mut self) {
        self.keys.clear();
        self.new_keys.clear();
        self.touched.clear();
        self.deleted.clear();
        self.shrunk.clear();
        self.insert_delta = false;
        self.delete_delta = false;
    }
}

impl fmt::Debug for AlphaBucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AlphaBucket")
            .field("fields", &self.fields)
            .field("mask", &self.mask)
            .field("keys", &self.keys.len())
            .field("insert_delta", &self.insert_delta)
            .field("delete_delta", &self.delete_delta)
            .finish_non_exhaustive()
    }
}
