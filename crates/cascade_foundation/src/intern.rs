//! Value interning.
//!
//! Field values are interned to [`ValueHandle`]s so that join keys can be
//! compared and hashed by handle instead of by value. Two raw values that
//! are equal once coerced into a field's [`FieldType`] always receive the
//! same handle.

use std::fmt;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::linear_hash::LinearHashMap;
use crate::value::{FieldType, Value};

/// Interned field value identifier.
#[derive(Copy, Clone, Eq, PartialEq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ValueHandle(pub(crate) u32);

impl ValueHandle {
    /// The handle of [`Value::Nil`], pre-interned by every interner.
    pub const NIL: ValueHandle = ValueHandle(0);

    /// Returns the raw index of this handle.
    #[must_use]
    pub const fn index(self) -> u32 {
        self.0
    }
}

impl fmt::Debug for ValueHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ValueHandle({})", self.0)
    }
}

/// Resolves raw field values to handles and back.
pub trait ValueResolver {
    /// Returns the handle for `raw` read as `field_type`, interning it if
    /// necessary.
    fn handle(&mut self, field_type: FieldType, raw: Value) -> ValueHandle;

    /// Returns the value behind a handle.
    fn value(&self, handle: ValueHandle) -> Option<&Value>;
}

/// Interner for field values.
///
/// Handles are dense indices and are never released, so a handle stays
/// valid for the lifetime of the interner.
#[derive(Clone, Debug)]
pub struct ValueInterner {
    values: Vec<Value>,
    index: LinearHashMap<Value, ValueHandle>,
}

impl Default for ValueInterner {
    fn default() -> Self {
        Self::new()
    }
}

impl ValueInterner {
    /// Creates a new interner with `Nil` pre-interned as [`ValueHandle::NIL`].
    #[must_use]
    pub fn new() -> Self {
        let mut interner = Self {
            values: Vec::new(),
            index: LinearHashMap::new(),
        };
        let nil = interner.intern(Value::Nil);
        debug_assert_eq!(nil, ValueHandle::NIL);
        interner
    }

    /// Returns the number of distinct interned values.
    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Returns true if only `Nil` has been interned.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.len() <= 1
    }

    /// Looks up the handle for a value without interning it.
    #[must_use]
    pub fn lookup(&self, field_type: FieldType, raw: &Value) -> Option<ValueHandle> {
        match field_type {
            FieldType::Any => self.index.get(raw).copied(),
            _ => self.index.get(&field_type.coerce(raw.clone())).copied(),
        }
    }

    /// Interns an already coerced value.
    ///
    /// # Panics
    ///
    /// Panics if the number of interned values exceeds `u32::MAX`.
    pub fn intern(&mut self, value: Value) -> ValueHandle {
        if let Some(&handle) = self.index.get(&value) {
            return handle;
        }
        let handle =
            ValueHandle(u32::try_from(self.values.len()).expect("too many interned values"));
        self.values.push(value.clone());
        self.index.insert(value, handle);
        handle
    }
}

impl ValueResolver for ValueInterner {
    fn handle(&mut self, field_type: FieldType, raw: Value) -> ValueHandle {
        self.intern(field_type.coerce(raw))
    }

    fn value(&self, handle: ValueHandle) -> Option<&Value> {
        self.values.get(handle.0 as usize)
    }
}
