//! Join keys, join tuples, and the main/delta tuple store.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use cascade_foundation::{LinearHash, ValueHandle, hash_one};

/// The value handles one fact contributes to a join, in key-field order.
///
/// Facts with equal handles for every key field share a key.
#[derive(Clone, PartialEq, Eq)]
pub struct MemoryKey(Arc<[ValueHandle]>);

impl MemoryKey {
    /// Creates a key from value handles.
    #[must_use]
    pub fn new(handles: impl Into<Arc<[ValueHandle]>>) -> Self {
        Self(handles.into())
    }

    /// Returns the key's value handles.
    #[must_use]
    pub fn handles(&self) -> &[ValueHandle] {
        &self.0
    }

    /// Returns the number of handles.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns true for the key of a bucket with no key fields.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Hash for MemoryKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.handles().hash(state);
    }
}

impl fmt::Debug for MemoryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.0.iter().map(|h| h.index()))
            .finish()
    }
}

/// An ordered combination of keys, one per fact a condition node covers.
///
/// Hashes exactly like the slice of its keys, so a store can be probed
/// with a borrowed `&[MemoryKey]`.
#[derive(Clone, PartialEq, Eq)]
pub struct JoinTuple(Arc<[MemoryKey]>);

impl JoinTuple {
    /// Creates a tuple from keys.
    #[must_use]
    pub fn new(keys: impl Into<Arc<[MemoryKey]>>) -> Self {
        Self(keys.into())
    }

    /// Returns the tuple's keys.
    #[must_use]
    pub fn keys(&self) -> &[MemoryKey] {
        &self.0
    }
}

impl Hash for JoinTuple {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.keys().hash(state);
    }
}

impl fmt::Debug for JoinTuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("JoinTuple").field(&self.keys()).finish()
    }
}

/// Cursor mode over a source's rows during one propagation cycle.
///
/// The three modes partition a source's rows, so enumerating every mode
/// assignment across a node's sources visits each row combination once.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum KeyMode {
    /// Confirmed rows untouched this cycle.
    Main,
    /// Confirmed rows that gained facts this cycle.
    KnownDelta,
    /// Rows first produced this cycle.
    NewDelta,
}

impl KeyMode {
    /// Every mode, in enumeration order.
    pub const ALL: [KeyMode; 3] = [KeyMode::Main, KeyMode::KnownDelta, KeyMode::NewDelta];

    /// Returns true for the two delta modes.
    #[must_use]
    pub const fn is_delta(self) -> bool {
        !matches!(self, Self::Main)
    }

    /// Returns the position of this mode in [`KeyMode::ALL`].
    #[must_use]
    pub const fn index(self) -> usize {
        match self {
            Self::Main => 0,
            Self::KnownDelta => 1,
            Self::NewDelta => 2,
        }
    }
}

/// Join tuples of one condition node, split into confirmed and delta parts.
///
/// - `main` holds confirmed tuples.
/// - `delta` holds tuples first produced this cycle; never overlaps `main`.
/// - `touched` marks tuples of `main` that were re-derived this cycle from
///   sources that gained facts.
/// - `removed` logs tuples purged from `main` during the delete phase, so
///   downstream nodes can purge what depended on them.
#[derive(Clone, Debug)]
pub struct KeysStore {
    main: LinearHash<JoinTuple>,
    delta: LinearHash<JoinTuple>,
    touched: LinearHash<JoinTuple>,
    removed: LinearHash<JoinTuple>,
}

impl Default for KeysStore {
    fn default() -> Self {
        Self::new(cascade_foundation::linear_hash::DEFAULT_MIN_CAPACITY)
    }
}

impl KeysStore {
    /// Creates an empty store whose tables keep at least `min_capacity` slots.
    #[must_use]
    pub fn new(min_capacity: usize) -> Self {
        Self {
            main: LinearHash::with_capacity(min_capacity),
            delta: LinearHash::with_capacity(min_capacity),
            touched: LinearHash::with_capacity(min_capacity),
            removed: LinearHash::with_capacity(min_capacity),
        }
    }

    /// Records a tuple produced this cycle.
    ///
    /// A tuple already confirmed is marked touched and reported as
    /// [`KeyMode::KnownDelta`]; any other tuple lands in the delta partition
    /// and is reported as [`KeyMode::NewDelta`].
    pub fn insert(&mut self, tuple: JoinTuple) -> KeyMode {
        if self.main.contains(&tuple) {
            self.touched.insert(tuple);
            KeyMode::KnownDelta
        } else {
            self.delta.insert(tuple);
            KeyMode::NewDelta
        }
    }

    /// Iterates the rows of one cursor mode.
    #[must_use]
    pub fn rows(&self, mode: KeyMode) -> Box<dyn Iterator<Item = &JoinTuple> + '_> {
        match mode {
            KeyMode::Main => Box::new(self.main.iter().filter(|t| !self.touched.contains(t))),
            KeyMode::KnownDelta => Box::new(self.touched.iter()),
            KeyMode::NewDelta => Box::new(self.delta.iter()),
        }
    }

    /// Iterates every current tuple, confirmed then delta.
    pub fn iter(&self) -> impl Iterator<Item = &JoinTuple> + '_ {
        self.main.iter().chain(self.delta.iter())
    }

    /// Returns true if the tuple is confirmed or in the delta partition.
    #[must_use]
    pub fn contains(&self, tuple: &JoinTuple) -> bool {
        self.main.contains(tuple) || self.delta.contains(tuple)
    }

    /// Returns true if the tuple is in the delta partition.
    #[must_use]
    pub fn in_delta(&self, tuple: &JoinTuple) -> bool {
        self.delta.contains(tuple)
    }

    /// Returns true if the tuple is confirmed.
    #[must_use]
    pub fn in_main(&self, tuple: &JoinTuple) -> bool {
        self.main.contains(tuple)
    }

    /// Returns the number of confirmed tuples.
    #[must_use]
    pub fn main_len(&self) -> usize {
        self.main.len()
    }

    /// Returns the number of tuples first produced this cycle.
    #[must_use]
    pub fn delta_len(&self) -> usize {
        self.delta.len()
    }

    /// Returns the number of confirmed tuples marked touched.
    #[must_use]
    pub fn touched_len(&self) -> usize {
        self.touched.len()
    }

    /// Returns the total number of tuples.
    #[must_use]
    pub fn len(&self) -> usize {
        self.main.len() + self.delta.len()
    }

    /// Returns true if the store holds no tuples.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns true if this cycle produced or touched any tuple.
    #[must_use]
    pub fn has_delta(&self) -> bool {
        !self.delta.is_empty() || !self.touched.is_empty()
    }

    /// Moves the delta partition into main and clears touched markers.
    ///
    /// Returns the number of tuples moved. Calling it again without new
    /// inserts moves nothing.
    pub fn merge(&mut self) -> usize {
        let moved = self.delta.len();
        self.main.reserve(moved);
        for tuple in self.delta.drain() {
            self.main.insert(tuple);
        }
        self.touched.clear();
        moved
    }

    /// Removes confirmed tuples matching `doomed`, logging them as removed.
    ///
    /// Returns the number removed.
    pub fn purge(&mut self, mut doomed: impl FnMut(&JoinTuple) -> bool) -> usize {
        let removed = &mut self.removed;
        self.main.retain(|tuple| {
            if doomed(tuple) {
                removed.insert(tuple.clone());
                false
            } else {
                true
            }
        })
    }

    /// Returns true if a tuple with exactly these keys was purged this cycle.
    #[must_use]
    pub fn was_removed(&self, keys: &[MemoryKey]) -> bool {
        self.removed
            .get_by(hash_one(keys), |t| t.keys() == keys)
            .is_some()
    }

    /// Returns true if the delete delta is non-empty.
    #[must_use]
    pub fn has_removed(&self) -> bool {
        !self.removed.is_empty()
    }

    /// Iterates tuples purged this cycle.
    pub fn removed(&self) -> impl Iterator<Item = &JoinTuple> + '_ {
        self.removed.iter()
    }

    /// Ends the delete delta.
    pub fn clear_removed(&mut self) {
        self.removed.clear();
    }

    /// Removes every tuple.
    pub fn clear(&mut self) {
        self.main.clear();
        self.delta.clear();
        self.touched.clear();
        self.removed.clear();
    }
}
