//! Buffered working-memory actions.
//!
//! Every insert, update, and delete between two commits lands here, keyed
//! by fact handle. Repeated actions on one handle coalesce, so a commit
//! sees at most one action per handle:
//!
//! | pending  | then     | result                        |
//! |----------|----------|-------------------------------|
//! | insert   | update   | insert of the new record      |
//! | insert   | delete   | nothing (handle released)     |
//! | update   | update   | the last update               |
//! | update   | delete   | delete                        |
//! | delete   | anything | delete                        |

use cascade_foundation::{FactHandle, FactRecord, LinearHashMap};

/// A buffered action on one fact handle.
#[derive(Clone, Debug)]
pub enum Action {
    /// Insert a new fact.
    Insert(FactRecord),
    /// Replace a committed fact's record.
    Update(FactRecord),
    /// Remove a committed fact.
    Delete,
}

impl Action {
    /// Returns the record this action will commit, if any.
    #[must_use]
    pub fn record(&self) -> Option<&FactRecord> {
        match self {
            Self::Insert(record) | Self::Update(record) => Some(record),
            Self::Delete => None,
        }
    }
}

/// Outcome of buffering an action.
#[derive(Clone, Debug)]
pub enum Coalesced {
    /// The action is pending.
    Buffered,
    /// A pending insert or update was superseded; its record is returned.
    Replaced(FactRecord),
    /// A pending insert was cancelled; its record is returned.
    Released(FactRecord),
    /// The handle is already pending deletion.
    Ignored,
}

/// Pending actions keyed by handle, in first-touch order.
#[derive(Debug)]
pub struct ActionBuffer {
    actions: LinearHashMap<FactHandle, Action>,
}

impl Default for ActionBuffer {
    fn default() -> Self {
        Self::new(cascade_foundation::linear_hash::DEFAULT_MIN_CAPACITY)
    }
}

impl ActionBuffer {
    /// Creates an empty buffer.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            actions: LinearHashMap::with_capacity(capacity),
        }
    }

    /// Buffers the insert of a freshly allocated handle.
    pub fn insert(&mut self, handle: FactHandle, record: FactRecord) -> Coalesced {
        match self.actions.insert(handle, Action::Insert(record)) {
            Some(Action::Insert(previous)) => Coalesced::Replaced(previous),
            _ => Coalesced::Buffered,
        }
    }

    /// Buffers a replacement record for a handle.
    pub fn update(&mut self, handle: FactHandle, record: FactRecord) -> Coalesced {
        match self.actions.get_mut(&handle) {
            None => {
                self.actions.insert(handle, Action::Update(record));
                Coalesced::Buffered
            }
            Some(Action::Delete) => Coalesced::Ignored,
            Some(action @ Action::Update(_)) => {
                match std::mem::replace(action, Action::Update(record)) {
                    Action::Update(previous) => Coalesced::Replaced(previous),
                    _ => Coalesced::Buffered,
                }
            }
            Some(action @ Action::Insert(_)) => {
                match std::mem::replace(action, Action::Insert(record)) {
                    Action::Insert(previous) => Coalesced::Replaced(previous),
                    _ => Coalesced::Buffered,
                }
            }
        }
    }

    /// Buffers the removal of a handle.
    pub fn delete(&mut self, handle: FactHandle) -> Coalesced {
        match self.actions.get_mut(&handle) {
            None => {
                self.actions.insert(handle, Action::Delete);
                Coalesced::Buffered
            }
            Some(Action::Delete) => Coalesced::Ignored,
            Some(action @ Action::Update(_)) => match std::mem::replace(action, Action::Delete) {
                Action::Update(previous) => Coalesced::Replaced(previous),
                _ => Coalesced::Buffered,
            },
            Some(Action::Insert(_)) => match self.actions.remove(&handle) {
                Some(Action::Insert(record)) => Coalesced::Released(record),
                _ => Coalesced::Buffered,
            },
        }
    }

    /// Returns the pending action for a handle.
    #[must_use]
    pub fn get(&self, handle: &FactHandle) -> Option<&Action> {
        self.actions.get(handle)
    }

    /// Iterates pending actions in first-touch order.
    pub fn iter(&self) -> impl Iterator<Item = (&FactHandle, &Action)> + '_ {
        self.actions.iter()
    }

    /// Returns the number of handles with a pending action.
    #[must_use]
    pub fn len(&self) -> usize {
        self.actions.len()
    }

    /// Returns true if nothing is pending.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Takes every pending action in first-touch order.
    pub fn drain(&mut self) -> Vec<(FactHandle, Action)> {
        self.actions.drain().collect()
    }

    /// Drops every pending action.
    pub fn clear(&mut self) {
        self.actions.clear();
    }
}
