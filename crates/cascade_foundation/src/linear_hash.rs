//! Linear-probing hash tables that shrink.
//!
//! [`LinearHash`] is an open-addressing set with tombstone deletion and an
//! insertion-order index. Full scans walk the order index instead of the
//! slot array, and tombstones are discarded whenever the table is rebuilt,
//! so a scan costs O(live entries) even after heavy deletion. The standard
//! library's `HashMap` never gives memory back; this table rebuilds into a
//! smaller array once tombstones outnumber live entries.
//!
//! Hashing and equality come from a [`HashStrategy`], which lets the same
//! structure back fact maps, the value interner, and the key stores.
//!
//! Slot indices returned by [`LinearHash::find`] are only valid until the
//! next resize.

use std::borrow::Borrow;
use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;

use crate::{Error, Result};

/// Largest slot array a table may allocate.
pub const MAXIMUM_CAPACITY: usize = 1 << 30;

const MINIMUM_CAPACITY: usize = 2;

/// Default minimum capacity for new tables.
pub const DEFAULT_MIN_CAPACITY: usize = 16;

/// Supplies hashing and equality for a [`LinearHash`].
pub trait HashStrategy<E> {
    /// Hashes an element.
    fn hash(&self, element: &E) -> u64;

    /// Compares two elements for equality.
    fn equals(&self, a: &E, b: &E) -> bool;
}

/// Hashes with the element's own `Hash` and `Eq` implementations.
#[derive(Clone, Copy, Debug, Default)]
pub struct StdHash;

impl<E: Hash + Eq> HashStrategy<E> for StdHash {
    fn hash(&self, element: &E) -> u64 {
        hash_one(element)
    }

    fn equals(&self, a: &E, b: &E) -> bool {
        a == b
    }
}

/// Hashes a value with the hasher every table in this crate uses.
#[must_use]
pub fn hash_one<T: Hash + ?Sized>(value: &T) -> u64 {
    let mut hasher = DefaultHasher::new();
    value.hash(&mut hasher);
    hasher.finish()
}

#[derive(Clone)]
enum Slot<E> {
    Empty,
    Live(E),
    Tombstone,
}

impl<E> Slot<E> {
    fn live(&self) -> Option<&E> {
        match self {
            Self::Live(e) => Some(e),
            _ => None,
        }
    }
}

/// Returns a power of two size for the given target capacity.
fn table_size_for(capacity: usize) -> usize {
    capacity.max(MINIMUM_CAPACITY).next_power_of_two()
}

/// An open-addressing hash set with linear probing.
///
/// # Invariants
///
/// - The slot array length is always a power of two.
/// - Every slot that is not `Empty` appears exactly once in `order`, so
///   `order.len() == len + tombstones`.
/// - After any public mutation, `2 * (len + tombstones) < capacity`, which
///   guarantees every probe sequence ends at an empty slot.
#[derive(Clone)]
pub struct LinearHash<E, S = StdHash> {
    slots: Vec<Slot<E>>,
    order: Vec<usize>,
    len: usize,
    tombstones: usize,
    min_capacity: usize,
    strategy: S,
}

impl<E: Hash + Eq> LinearHash<E, StdHash> {
    /// Creates an empty table with the default minimum capacity.
    #[must_use]
    pub fn new() -> Self {
        Self::with_strategy(DEFAULT_MIN_CAPACITY, StdHash)
    }

    /// Creates an empty table that never shrinks below `min_capacity` slots.
    #[must_use]
    pub fn with_capacity(min_capacity: usize) -> Self {
        Self::with_strategy(min_capacity, StdHash)
    }
}

impl<E: Hash + Eq> Default for LinearHash<E, StdHash> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E, S: HashStrategy<E>> LinearHash<E, S> {
    /// Creates an empty table with a custom hashing strategy.
    ///
    /// # Panics
    ///
    /// Panics if `min_capacity` exceeds [`MAXIMUM_CAPACITY`].
    #[must_use]
    pub fn with_strategy(min_capacity: usize, strategy: S) -> Self {
        assert!(
            min_capacity <= MAXIMUM_CAPACITY,
            "minimum capacity {min_capacity} exceeds {MAXIMUM_CAPACITY}"
        );
        let capacity = table_size_for(min_capacity);
        Self {
            slots: empty_slots(capacity),
            order: Vec::new(),
            len: 0,
            tombstones: 0,
            min_capacity,
            strategy,
        }
    }

    /// Returns the number of live entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true if there are no live entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Returns the number of tombstoned slots awaiting compaction.
    #[must_use]
    pub fn tombstones(&self) -> usize {
        self.tombstones
    }

    /// Returns the current slot array length.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Returns the hashing strategy.
    #[must_use]
    pub fn strategy(&self) -> &S {
        &self.strategy
    }

    /// Probes for `hash`, returning the slot of the first live entry
    /// accepted by `eq`, or the slot where a new entry should go.
    ///
    /// The insertion slot is the first tombstone on the probe path if
    /// there is one, otherwise the terminating empty slot.
    pub fn find_by(&self, hash: u64, mut eq: impl FnMut(&E) -> bool) -> usize {
        let mask = self.slots.len() - 1;
        #[allow(clippy::cast_possible_truncation)]
        let mut addr = (hash as usize) & mask;
        let mut reusable = None;
        loop {
            match &self.slots[addr] {
                Slot::Empty => return reusable.unwrap_or(addr),
                Slot::Tombstone => {
                    reusable.get_or_insert(addr);
                }
                Slot::Live(found) => {
                    if eq(found) {
                        return addr;
                    }
                }
            }
            addr = (addr + 1) & mask;
        }
    }

    /// Finds the slot holding an entry equal to `key`, or the slot where
    /// it would be inserted.
    pub fn find(&self, key: &E) -> usize {
        let hash = self.strategy.hash(key);
        self.find_by(hash, |found| self.strategy.equals(key, found))
    }

    /// Returns the live entry at `slot`, if any.
    #[must_use]
    pub fn get(&self, slot: usize) -> Option<&E> {
        self.slots.get(slot).and_then(Slot::live)
    }

    /// Returns the live entry at `slot` mutably, if any.
    ///
    /// Callers must not change the parts of the entry that feed its hash.
    pub fn get_mut(&mut self, slot: usize) -> Option<&mut E> {
        match self.slots.get_mut(slot) {
            Some(Slot::Live(e)) => Some(e),
            _ => None,
        }
    }

    /// Looks up a live entry by hash and predicate.
    pub fn get_by(&self, hash: u64, eq: impl FnMut(&E) -> bool) -> Option<&E> {
        let slot = self.find_by(hash, eq);
        self.get(slot)
    }

    /// Returns true if an entry equal to `key` is live.
    #[must_use]
    pub fn contains(&self, key: &E) -> bool {
        self.get(self.find(key)).is_some()
    }

    /// Inserts an entry, returning the live entry it replaced.
    ///
    /// # Panics
    ///
    /// Panics if growing the table would exceed [`MAXIMUM_CAPACITY`].
    pub fn insert(&mut self, element: E) -> Option<E> {
        self.ensure_room(self.len + 1);
        let slot = self.find(&element);
        self.save_direct(element, slot)
    }

    /// Stores an entry at a slot obtained from [`Self::find_by`] or
    /// [`Self::find`] since the last resize, returning the live entry it
    /// replaced.
    ///
    /// Callers that look a slot up first must have reserved room with
    /// [`Self::reserve`] before the lookup.
    pub fn save_direct(&mut self, element: E, slot: usize) -> Option<E> {
        match std::mem::replace(&mut self.slots[slot], Slot::Live(element)) {
            Slot::Empty => {
                self.order.push(slot);
                self.len += 1;
                None
            }
            Slot::Tombstone => {
                self.tombstones -= 1;
                self.len += 1;
                None
            }
            Slot::Live(previous) => Some(previous),
        }
    }

    /// Tombstones the entry at `slot`, returning it.
    ///
    /// The slot array is not compacted; call [`Self::resize`] (or let the
    /// next insert or remove do it) to reclaim tombstones.
    pub fn mark_deleted(&mut self, slot: usize) -> Option<E> {
        if !matches!(self.slots.get(slot), Some(Slot::Live(_))) {
            return None;
        }
        match std::mem::replace(&mut self.slots[slot], Slot::Tombstone) {
            Slot::Live(e) => {
                self.len -= 1;
                self.tombstones += 1;
                Some(e)
            }
            _ => None,
        }
    }

    /// Removes the entry equal to `key`, returning it.
    pub fn remove(&mut self, key: &E) -> Option<E> {
        let slot = self.find(key);
        self.remove_slot(slot)
    }

    /// Removes a live entry by hash and predicate, returning it.
    pub fn remove_by(&mut self, hash: u64, eq: impl FnMut(&E) -> bool) -> Option<E> {
        let slot = self.find_by(hash, eq);
        self.remove_slot(slot)
    }

    fn remove_slot(&mut self, slot: usize) -> Option<E> {
        let removed = self.mark_deleted(slot)?;
        self.resize();
        Some(removed)
    }

    /// Removes every entry rejected by `keep`, returning how many were
    /// removed.
    pub fn retain(&mut self, mut keep: impl FnMut(&E) -> bool) -> usize {
        let before = self.tombstones;
        for i in 0..self.order.len() {
            let slot = self.order[i];
            if self.slots[slot].live().is_some_and(|e| !keep(e)) {
                self.mark_deleted(slot);
            }
        }
        let removed = self.tombstones - before;
        if removed > 0 {
            self.resize();
        }
        removed
    }

    /// Applies the resize policy for the current live count.
    ///
    /// # Panics
    ///
    /// Panics if growing the table would exceed [`MAXIMUM_CAPACITY`].
    pub fn resize(&mut self) {
        self.ensure_room(self.len);
    }

    /// Makes room for at least `additional` more live entries.
    ///
    /// # Panics
    ///
    /// Panics if growing the table would exceed [`MAXIMUM_CAPACITY`].
    pub fn reserve(&mut self, additional: usize) {
        self.ensure_room(self.len.saturating_add(additional));
    }

    fn ensure_room(&mut self, target: usize) {
        if let Err(e) = self.try_resize(target) {
            panic!("{e}");
        }
    }

    /// Resizes for `target` live entries.
    ///
    /// The table grows when `2 * (target + tombstones) >= capacity` and
    /// shrinks when there are tombstones and `target < tombstones`. Both
    /// rebuild into a fresh power-of-two array of at least
    /// `max(min_capacity, 2 * target + 1)` slots, discarding tombstones.
    /// Targets below the live count are raised to it.
    ///
    /// # Errors
    ///
    /// Returns `CapacityExceeded` if the required array is larger than
    /// [`MAXIMUM_CAPACITY`]. The table is unchanged in that case.
    pub fn try_resize(&mut self, target: usize) -> Result<()> {
        let target = target.max(self.len);
        let grow = target.saturating_add(self.tombstones).saturating_mul(2) >= self.slots.len();
        let shrink = self.tombstones > 0 && target < self.tombstones;
        if !grow && !shrink {
            return Ok(());
        }
        let required = target
            .checked_mul(2)
            .and_then(|n| n.checked_add(1))
            .filter(|&n| n <= MAXIMUM_CAPACITY)
            .ok_or_else(|| {
                Error::capacity_exceeded(target.saturating_mul(2), MAXIMUM_CAPACITY)
            })?;
        let capacity = table_size_for(self.min_capacity.max(required));
        if capacity > MAXIMUM_CAPACITY {
            return Err(Error::capacity_exceeded(capacity, MAXIMUM_CAPACITY));
        }
        self.rebuild(capacity);
        Ok(())
    }

    fn rebuild(&mut self, capacity: usize) {
        let mut slots = empty_slots(capacity);
        let mut order = Vec::with_capacity(self.len);
        let mask = capacity - 1;
        let mut old = std::mem::take(&mut self.slots);
        for slot in std::mem::take(&mut self.order) {
            if let Slot::Live(e) = std::mem::replace(&mut old[slot], Slot::Empty) {
                #[allow(clippy::cast_possible_truncation)]
                let mut addr = (self.strategy.hash(&e) as usize) & mask;
                while !matches!(slots[addr], Slot::Empty) {
                    addr = (addr + 1) & mask;
                }
                slots[addr] = Slot::Live(e);
                order.push(addr);
            }
        }
        self.slots = slots;
        self.order = order;
        self.tombstones = 0;
        self.debug_assert_structure();
    }

    /// Removes every entry, keeping the current capacity.
    pub fn clear(&mut self) {
        for slot in &mut self.slots {
            *slot = Slot::Empty;
        }
        self.order.clear();
        self.len = 0;
        self.tombstones = 0;
    }

    /// Removes and returns every live entry in scan order.
    pub fn drain(&mut self) -> std::vec::IntoIter<E> {
        let mut out = Vec::with_capacity(self.len);
        for &slot in &self.order {
            if let Slot::Live(e) = std::mem::replace(&mut self.slots[slot], Slot::Empty) {
                out.push(e);
            }
        }
        self.order.clear();
        self.len = 0;
        self.tombstones = 0;
        out.into_iter()
    }

    /// Iterates live entries in insertion order (modulo tombstone reuse).
    #[must_use]
    pub fn iter(&self) -> Iter<'_, E> {
        Iter {
            slots: &self.slots,
            order: self.order.iter(),
            remaining: self.len,
        }
    }

    /// Iterates `(slot, entry)` pairs for live entries in scan order.
    pub fn slots(&self) -> impl Iterator<Item = (usize, &E)> + '_ {
        self.order
            .iter()
            .filter_map(|&slot| self.slots[slot].live().map(|e| (slot, e)))
    }

    /// Iterates live entries mutably in slot order.
    ///
    /// Callers must not change the parts of an entry that feed its hash.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut E> + '_ {
        self.slots.iter_mut().filter_map(|slot| match slot {
            Slot::Live(e) => Some(e),
            _ => None,
        })
    }

    /// Checks the bookkeeping invariant in debug builds.
    pub fn debug_assert_structure(&self) {
        debug_assert_eq!(
            self.order.len(),
            self.len + self.tombstones,
            "order: {} live: {} tombstones: {}",
            self.order.len(),
            self.len,
            self.tombstones
        );
    }
}

impl<E: Clone, S: HashStrategy<E>> LinearHash<E, S> {
    /// Inserts clones of every live entry of `other`.
    pub fn extend_from(&mut self, other: &Self) {
        self.reserve(other.len);
        for e in other {
            let slot = self.find(e);
            self.save_direct(e.clone(), slot);
        }
    }
}

fn empty_slots<E>(capacity: usize) -> Vec<Slot<E>> {
    let mut slots = Vec::with_capacity(capacity);
    slots.resize_with(capacity, || Slot::Empty);
    slots
}

impl<E: fmt::Debug, S: HashStrategy<E>> fmt::Debug for LinearHash<E, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

impl<'a, E, S: HashStrategy<E>> IntoIterator for &'a LinearHash<E, S> {
    type Item = &'a E;
    type IntoIter = Iter<'a, E>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl<E: Hash + Eq> FromIterator<E> for LinearHash<E, StdHash> {
    fn from_iter<I: IntoIterator<Item = E>>(iter: I) -> Self {
        let mut table = Self::new();
        for e in iter {
            table.insert(e);
        }
        table
    }
}

/// Iterator over the live entries of a [`LinearHash`].
pub struct Iter<'a, E> {
    slots: &'a [Slot<E>],
    order: std::slice::Iter<'a, usize>,
    remaining: usize,
}

impl<'a, E> Iterator for Iter<'a, E> {
    type Item = &'a E;

    fn next(&mut self) -> Option<Self::Item> {
        for &slot in self.order.by_ref() {
            if let Slot::Live(e) = &self.slots[slot] {
                self.remaining -= 1;
                return Some(e);
            }
        }
        None
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

impl<E> ExactSizeIterator for Iter<'_, E> {}

// =============================================================================
// Map
// =============================================================================

/// Hashes `(K, V)` entries by key only.
pub struct KeyHash<K, V>(PhantomData<fn(&K, &V)>);

impl<K, V> Default for KeyHash<K, V> {
    fn default() -> Self {
        Self(PhantomData)
    }
}

impl<K, V> Clone for KeyHash<K, V> {
    fn clone(&self) -> Self {
        Self::default()
    }
}

impl<K: Hash + Eq, V> HashStrategy<(K, V)> for KeyHash<K, V> {
    fn hash(&self, element: &(K, V)) -> u64 {
        hash_one(&element.0)
    }

    fn equals(&self, a: &(K, V), b: &(K, V)) -> bool {
        a.0 == b.0
    }
}

/// A map built on [`LinearHash`], storing `(K, V)` entries keyed by `K`.
#[derive(Clone)]
pub struct LinearHashMap<K, V> {
    table: LinearHash<(K, V), KeyHash<K, V>>,
}

impl<K: Hash + Eq, V> Default for LinearHashMap<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Hash + Eq, V> LinearHashMap<K, V> {
    /// Creates an empty map with the default minimum capacity.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_MIN_CAPACITY)
    }

    /// Creates an empty map that never shrinks below `min_capacity` slots.
    #[must_use]
    pub fn with_capacity(min_capacity: usize) -> Self {
        Self {
            table: LinearHash::with_strategy(min_capacity, KeyHash::default()),
        }
    }

    /// Returns the number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.table.len()
    }

    /// Returns true if the map is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    /// Returns the underlying slot array length.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.table.capacity()
    }

    /// Returns the number of tombstoned slots.
    #[must_use]
    pub fn tombstones(&self) -> usize {
        self.table.tombstones()
    }

    /// Inserts a value, returning the previous value for the key.
    pub fn insert(&mut self, key: K, value: V) -> Option<V> {
        self.table.insert((key, value)).map(|(_, v)| v)
    }

    /// Gets the value for a key.
    #[must_use]
    pub fn get<Q>(&self, key: &Q) -> Option<&V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.table
            .get_by(hash_one(key), |(k, _)| <K as Borrow<Q>>::borrow(k) == key)
            .map(|(_, v)| v)
    }

    /// Gets the value for a key mutably.
    pub fn get_mut<Q>(&mut self, key: &Q) -> Option<&mut V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let slot = self.table.find_by(hash_one(key), |(k, _)| <K as Borrow<Q>>::borrow(k) == key);
        self.table.get_mut(slot).map(|(_, v)| v)
    }

    /// Returns true if the key is present.
    #[must_use]
    pub fn contains_key<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.get(key).is_some()
    }

    /// Returns the value for `key`, inserting `make()` first if absent.
    pub fn get_or_insert_with(&mut self, key: K, make: impl FnOnce() -> V) -> &mut V {
        self.table.reserve(1);
        let slot = self.table.find_by(hash_one(&key), |(k, _)| *k == key);
        if self.table.get(slot).is_none() {
            self.table.save_direct((key, make()), slot);
        }
        match self.table.get_mut(slot) {
            Some((_, v)) => v,
            None => unreachable!("slot {slot} was just filled"),
        }
    }

    /// Removes a key, returning its value.
    pub fn remove<Q>(&mut self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.table
            .remove_by(hash_one(key), |(k, _)| <K as Borrow<Q>>::borrow(k) == key)
            .map(|(_, v)| v)
    }

    /// Removes every entry rejected by `keep`, returning how many were removed.
    pub fn retain(&mut self, mut keep: impl FnMut(&K, &V) -> bool) -> usize {
        self.table.retain(|(k, v)| keep(k, v))
    }

    /// Iterates entries in insertion order (modulo tombstone reuse).
    pub fn iter(&self) -> impl ExactSizeIterator<Item = (&K, &V)> + '_ {
        self.table.iter().map(|(k, v)| (k, v))
    }

    /// Iterates keys.
    pub fn keys(&self) -> impl ExactSizeIterator<Item = &K> + '_ {
        self.table.iter().map(|(k, _)| k)
    }

    /// Iterates values.
    pub fn values(&self) -> impl ExactSizeIterator<Item = &V> + '_ {
        self.table.iter().map(|(_, v)| v)
    }

    /// Iterates values mutably, in slot order.
    pub fn values_mut(&mut self) -> impl Iterator<Item = &mut V> + '_ {
        self.table.iter_mut().map(|(_, v)| v)
    }

    /// Removes every entry, keeping capacity.
    pub fn clear(&mut self) {
        self.table.clear();
    }

    /// Removes and returns every entry in scan order.
    pub fn drain(&mut self) -> std::vec::IntoIter<(K, V)> {
        self.table.drain()
    }
}

impl<K: fmt::Debug + Hash + Eq, V: fmt::Debug> fmt::Debug for LinearHashMap<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.iter()).finish()
    }
}
