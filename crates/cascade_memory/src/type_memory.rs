//! Per-type working memory.
//!
//! A [`TypeMemory`] owns every committed fact of one declared type, the
//! alpha buckets rules have requested for that type, and the session's view
//! of the type's active fields and alpha conditions.

use std::sync::Arc;

use cascade_foundation::{
    ActiveField, AlphaCondition, Fact, FactRecord, LinearHashMap, Result, TypeDescriptor, TypeId,
    ValueResolver,
};
use tracing::trace;

use crate::alpha::{AlphaBucket, AlphaMask, FieldsKey};

fn identity(fact: &Arc<Fact>) -> usize {
    Arc::as_ptr(fact).cast::<()>() as usize
}

/// Committed facts and alpha buckets of one fact type.
pub struct TypeMemory {
    type_id: TypeId,
    name: Arc<str>,
    fields: im::Vector<ActiveField>,
    alphas: im::Vector<AlphaCondition>,
    facts: LinearHashMap<u64, FactRecord>,
    identities: LinearHashMap<usize, u64>,
    buckets: Vec<AlphaBucket>,
    next_id: u64,
    min_capacity: usize,
}

impl TypeMemory {
    /// Creates an empty memory for a declared type.
    #[must_use]
    pub fn new(descriptor: &TypeDescriptor, min_capacity: usize) -> Self {
        Self {
            type_id: descriptor.id,
            name: descriptor.name.clone(),
            fields: im::Vector::new(),
            alphas: im::Vector::new(),
            facts: LinearHashMap::with_capacity(min_capacity),
            identities: LinearHashMap::with_capacity(min_capacity),
            buckets: Vec::new(),
            next_id: 0,
            min_capacity,
        }
    }

    /// Returns the type's id.
    #[must_use]
    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    /// Returns the type's name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the active fields this memory's records cache.
    #[must_use]
    pub fn fields(&self) -> &im::Vector<ActiveField> {
        &self.fields
    }

    /// Returns the alpha conditions this memory's records cache.
    #[must_use]
    pub fn alphas(&self) -> &im::Vector<AlphaCondition> {
        &self.alphas
    }

    // =========================================================================
    // Handles and identity
    // =========================================================================

    /// Allocates an id for a fact instance about to be buffered for insert.
    ///
    /// Returns `None` if the instance is already tracked, committed or
    /// pending.
    pub fn register_new_fact(&mut self, fact: &Arc<Fact>) -> Option<u64> {
        let key = identity(fact);
        if self.identities.contains_key(&key) {
            return None;
        }
        let id = self.next_id;
        self.next_id += 1;
        self.identities.insert(key, id);
        Some(id)
    }

    /// Releases the identity of a pending insert that will never commit.
    pub fn forget_pending(&mut self, fact: &Arc<Fact>, id: u64) {
        let key = identity(fact);
        if self.identities.get(&key) == Some(&id) {
            self.identities.remove(&key);
        }
    }

    /// Tracks a replacement instance under an existing id, ahead of the
    /// commit that installs it.
    ///
    /// Returns false if the instance is tracked under another id.
    pub fn track(&mut self, fact: &Arc<Fact>, id: u64) -> bool {
        let key = identity(fact);
        match self.identities.get(&key) {
            Some(&known) => known == id,
            None => {
                self.identities.insert(key, id);
                true
            }
        }
    }

    /// Returns the id tracked for a fact instance.
    #[must_use]
    pub fn identity_of(&self, fact: &Arc<Fact>) -> Option<u64> {
        self.identities.get(&identity(fact)).copied()
    }

    // =========================================================================
    // Records
    // =========================================================================

    /// Builds a record for a fact against this memory's schema view.
    ///
    /// # Errors
    ///
    /// Propagates alpha condition failures.
    pub fn build_record<R: ValueResolver + ?Sized>(
        &self,
        fact: Arc<Fact>,
        resolver: &mut R,
    ) -> Result<FactRecord> {
        FactRecord::new(fact).synced(&self.fields, &self.alphas, resolver)
    }

    /// Brings a record built earlier up to date with this memory's schema view.
    ///
    /// # Errors
    ///
    /// Propagates alpha condition failures.
    pub fn refresh<R: ValueResolver + ?Sized>(
        &self,
        record: FactRecord,
        resolver: &mut R,
    ) -> Result<FactRecord> {
        record.synced(&self.fields, &self.alphas, resolver)
    }

    /// Adopts a newer schema snapshot and appends the missing values and
    /// alpha results to every committed record.
    ///
    /// Returns the number of records rebuilt.
    ///
    /// # Errors
    ///
    /// Propagates alpha condition failures.
    pub fn sync_schema<R: ValueResolver + ?Sized>(
        &mut self,
        fields: im::Vector<ActiveField>,
        alphas: im::Vector<AlphaCondition>,
        resolver: &mut R,
    ) -> Result<usize> {
        if fields.len() <= self.fields.len() && alphas.len() <= self.alphas.len() {
            return Ok(0);
        }
        self.fields = fields;
        self.alphas = alphas;
        let mut rebuilt = 0;
        for record in self.facts.values_mut() {
            if !record.is_synced(&self.fields, &self.alphas) {
                *record = record.clone().synced(&self.fields, &self.alphas, resolver)?;
                rebuilt += 1;
            }
        }
        trace!(
            memory = %self.name,
            fields = self.fields.len(),
            alphas = self.alphas.len(),
            rebuilt,
            "synced schema"
        );
        Ok(rebuilt)
    }

    /// Returns a committed record.
    #[must_use]
    pub fn record(&self, id: u64) -> Option<&FactRecord> {
        self.facts.get(&id)
    }

    /// Returns a committed fact.
    #[must_use]
    pub fn fact(&self, id: u64) -> Option<&Arc<Fact>> {
        self.facts.get(&id).map(|r| &r.fact)
    }

    /// Returns true if the id names a committed fact.
    #[must_use]
    pub fn contains(&self, id: u64) -> bool {
        self.facts.contains_key(&id)
    }

    /// Returns the number of committed facts.
    #[must_use]
    pub fn len(&self) -> usize {
        self.facts.len()
    }

    /// Returns true if no fact is committed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.facts.is_empty()
    }

    /// Iterates committed records.
    pub fn iter(&self) -> impl Iterator<Item = (u64, &FactRecord)> + '_ {
        self.facts.iter().map(|(&id, r)| (id, r))
    }

    // =========================================================================
    // Commit steps
    // =========================================================================

    /// Routes new records into every bucket as fresh facts.
    ///
    /// # Errors
    ///
    /// Returns `Internal` if a record does not cache a bucket's key field.
    pub fn insert_batch(&mut self, records: &[(u64, FactRecord)]) -> Result<usize> {
        let mut routed = 0;
        for bucket in &mut self.buckets {
            routed += bucket.insert(records)?;
        }
        Ok(routed)
    }

    /// Stores new records as committed facts.
    pub fn commit_insert(&mut self, records: Vec<(u64, FactRecord)>) {
        for (id, record) in records {
            self.identities.insert(identity(&record.fact), id);
            self.facts.insert(id, record);
        }
    }

    /// Removes committed facts from every bucket.
    ///
    /// Unknown ids are skipped. Returns the number of facts retracted.
    ///
    /// # Errors
    ///
    /// Returns `Internal` if a record does not cache a bucket's key field.
    pub fn retract_batch(&mut self, ids: &[u64]) -> Result<usize> {
        let records: Vec<(u64, FactRecord)> = ids
            .iter()
            .filter_map(|id| self.facts.get(id).map(|r| (*id, r.clone())))
            .collect();
        for bucket in &mut self.buckets {
            bucket.retract(&records)?;
        }
        Ok(records.len())
    }

    /// Drops committed facts and their identities.
    ///
    /// Returns the removed records.
    pub fn commit_delete(&mut self, ids: &[u64]) -> Vec<(u64, FactRecord)> {
        let mut removed = Vec::with_capacity(ids.len());
        for &id in ids {
            if let Some(record) = self.facts.remove(&id) {
                self.forget_pending(&record.fact, id);
                removed.push((id, record));
            }
        }
        removed
    }

    // =========================================================================
    // Buckets
    // =========================================================================

    /// Returns the index of the bucket with this shape and mask, creating
    /// it if needed.
    ///
    /// A new bucket is backfilled from the facts already committed, as a
    /// pending insert delta. Returns the index and whether it was created.
    ///
    /// # Errors
    ///
    /// Returns `Internal` if a committed record does not cache a key field.
    pub fn touch_bucket(&mut self, fields: FieldsKey, mask: AlphaMask) -> Result<(usize, bool)> {
        if let Some(index) = self.buckets.iter().position(|b| b.matches(&fields, &mask)) {
            return Ok((index, false));
        }
        let mut bucket = AlphaBucket::new(fields, mask, self.min_capacity);
        let resident: Vec<(u64, FactRecord)> =
            self.facts.iter().map(|(&id, r)| (id, r.clone())).collect();
        let routed = bucket.insert(&resident)?;
        trace!(memory = %self.name, resident = resident.len(), routed, "backfilled bucket");
        self.buckets.push(bucket);
        Ok((self.buckets.len() - 1, true))
    }

    /// Returns a bucket by index.
    #[must_use]
    pub fn bucket(&self, index: usize) -> Option<&AlphaBucket> {
        self.buckets.get(index)
    }

    /// Returns every bucket.
    #[must_use]
    pub fn buckets(&self) -> &[AlphaBucket] {
        &self.buckets
    }

    /// Returns true if any bucket holds unconfirmed inserts.
    #[must_use]
    pub fn has_insert_delta(&self) -> bool {
        self.buckets.iter().any(AlphaBucket::has_insert_delta)
    }

    /// Returns true if any bucket dropped facts this cycle.
    #[must_use]
    pub fn has_delete_delta(&self) -> bool {
        self.buckets.iter().any(AlphaBucket::has_delete_delta)
    }

    /// Confirms fresh facts in every bucket.
    pub fn merge_insert_deltas(&mut self) {
        for bucket in &mut self.buckets {
            bucket.merge_insert_delta();
        }
    }

    /// Ends the delete delta of every bucket.
    pub fn merge_delete_deltas(&mut self) {
        for bucket in &mut self.buckets {
            bucket.merge_delete_delta();
        }
    }

    /// Drops every fact, keeping buckets (empty) and the id counter.
    pub fn clear(&mut self) {
        self.facts.clear();
        self.identities.clear();
        for bucket in &mut self.buckets {
            bucket.clear();
        }
    }
}

impl std::fmt::Debug for TypeMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TypeMemory")
            .field("type", &self.name)
            .field("facts", &self.facts.len())
            .field("buckets", &self.buckets)
            .finish_non_exhaustive()
    }
}
