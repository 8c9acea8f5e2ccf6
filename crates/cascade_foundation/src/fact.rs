//! Facts, fact handles, and cached fact records.

use std::fmt;
use std::sync::Arc;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::intern::{ValueHandle, ValueResolver};
use crate::schema::{ActiveField, AlphaCondition, TypeId};
use crate::value::Value;
use crate::{Error, Result};

static NIL: Value = Value::Nil;

/// A typed record of named field values.
///
/// Facts are immutable once inserted and are shared as `Arc<Fact>`. Working
/// memory tracks fact *instances*: two structurally equal facts in distinct
/// allocations are distinct facts.
#[derive(Clone, PartialEq, Eq)]
pub struct Fact {
    type_name: Arc<str>,
    fields: im::OrdMap<Arc<str>, Value>,
}

impl Fact {
    /// Creates a fact of the named type with no fields set.
    #[must_use]
    pub fn new(type_name: impl Into<Arc<str>>) -> Self {
        Self {
            type_name: type_name.into(),
            fields: im::OrdMap::new(),
        }
    }

    /// Sets a field, returning the updated fact.
    #[must_use]
    pub fn with(mut self, field: impl Into<Arc<str>>, value: impl Into<Value>) -> Self {
        self.fields.insert(field.into(), value.into());
        self
    }

    /// Returns the fact's type name.
    #[must_use]
    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    /// Returns a field's value, or `Nil` if the field is not set.
    #[must_use]
    pub fn get(&self, field: &str) -> &Value {
        self.fields.get(field).unwrap_or(&NIL)
    }

    /// Iterates the fields that are set, in name order.
    pub fn fields(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.fields.iter().map(|(k, v)| (&**k, v))
    }

    /// Wraps the fact for insertion.
    #[must_use]
    pub fn into_shared(self) -> Arc<Fact> {
        Arc::new(self)
    }
}

impl fmt::Debug for Fact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct(&self.type_name);
        for (name, value) in &self.fields {
            s.field(name, value);
        }
        s.finish()
    }
}

/// Identifier of one inserted fact instance.
///
/// Ids are allocated per type memory and never reused within a session.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct FactHandle {
    /// The fact's declared type.
    pub type_id: TypeId,
    /// Per-type instance id.
    pub id: u64,
}

impl FactHandle {
    /// Creates a fact handle.
    #[must_use]
    pub const fn new(type_id: TypeId, id: u64) -> Self {
        Self { type_id, id }
    }
}

impl fmt::Display for FactHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.type_id.index(), self.id)
    }
}

/// A fact with its active field values and alpha results cached.
///
/// Records are replaced rather than mutated: appending values or alpha
/// results for newly registered fields and conditions copies the arrays.
#[derive(Clone)]
pub struct FactRecord {
    /// The fact instance.
    pub fact: Arc<Fact>,
    values: Arc<[ValueHandle]>,
    alpha: Arc<[bool]>,
}

impl FactRecord {
    /// Creates a record with no cached values.
    #[must_use]
    pub fn new(fact: Arc<Fact>) -> Self {
        Self {
            fact,
            values: Arc::from([]),
            alpha: Arc::from([]),
        }
    }

    /// Returns the cached value handles, indexed by active field.
    #[must_use]
    pub fn values(&self) -> &[ValueHandle] {
        &self.values
    }

    /// Returns the handle cached for an active field.
    #[must_use]
    pub fn value(&self, field_index: usize) -> Option<ValueHandle> {
        self.values.get(field_index).copied()
    }

    /// Returns the cached alpha results, indexed by condition id.
    #[must_use]
    pub fn alpha(&self) -> &[bool] {
        &self.alpha
    }

    /// Returns true if the record points at this exact fact instance.
    #[must_use]
    pub fn is_instance(&self, fact: &Arc<Fact>) -> bool {
        Arc::ptr_eq(&self.fact, fact)
    }

    /// Resolves values for active fields beyond those already cached.
    ///
    /// Returns the record unchanged if every field is cached.
    #[must_use]
    pub fn append_values<R: ValueResolver + ?Sized>(
        self,
        fields: &im::Vector<ActiveField>,
        resolver: &mut R,
    ) -> Self {
        if fields.len() <= self.values.len() {
            return self;
        }
        let mut values = Vec::with_capacity(fields.len());
        values.extend_from_slice(&self.values);
        for field in fields.iter().skip(self.values.len()) {
            let raw = self.fact.get(&field.name).clone();
            values.push(resolver.handle(field.value_type, raw));
        }
        Self {
            values: values.into(),
            ..self
        }
    }

    /// Evaluates alpha conditions beyond those already cached.
    ///
    /// # Errors
    ///
    /// Returns a `Predicate` error if a condition fails, or `Internal` if a
    /// condition reads a field whose value is not cached.
    pub fn append_alpha<R: ValueResolver + ?Sized>(
        self,
        conditions: &im::Vector<AlphaCondition>,
        resolver: &R,
    ) -> Result<Self> {
        if conditions.len() <= self.alpha.len() {
            return Ok(self);
        }
        let mut alpha = Vec::with_capacity(conditions.len());
        alpha.extend_from_slice(&self.alpha);
        for condition in conditions.iter().skip(self.alpha.len()) {
            let value = self
                .value(condition.field_index)
                .and_then(|h| resolver.value(h))
                .ok_or_else(|| {
                    Error::internal(format!(
                        "alpha condition {} reads uncached field {}",
                        condition.id, condition.field_index
                    ))
                })?;
            alpha.push(condition.evaluate(value)?);
        }
        Ok(Self {
            alpha: alpha.into(),
            ..self
        })
    }

    /// Brings the record up to date with the given schema snapshot.
    ///
    /// # Errors
    ///
    /// Propagates alpha condition failures.
    pub fn synced<R: ValueResolver + ?Sized>(
        self,
        fields: &im::Vector<ActiveField>,
        conditions: &im::Vector<AlphaCondition>,
        resolver: &mut R,
    ) -> Result<Self> {
        self.append_values(fields, resolver)
            .append_alpha(conditions, resolver)
    }

    /// Returns true if the record caches every field and condition of the
    /// snapshot.
    #[must_use]
    pub fn is_synced(
        &self,
        fields: &im::Vector<ActiveField>,
        conditions: &im::Vector<AlphaCondition>,
    ) -> bool {
        self.values.len() >= fields.len() && self.alpha.len() >= conditions.len()
    }
}

impl fmt::Debug for FactRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FactRecord")
            .field("fact", &self.fact)
            .field("values", &self.values)
            .field("alpha", &self.alpha)
            .finish()
    }
}
