//! Declared fact types, active fields, and alpha conditions.
//!
//! The [`TypeRegistry`] is shared by every session created from the same
//! knowledge base. It hands out dense [`TypeId`]s, and per type it keeps two
//! append-only lists:
//!
//! - **active fields**: the fields some compiled rule reads. A field's
//!   index never changes once assigned, so existing fact records only ever
//!   grow their value arrays.
//! - **alpha conditions**: single-field predicates, identified by a dense
//!   per-type id that indexes each record's alpha results.
//!
//! Both lists are `im::Vector`s, so a snapshot is an O(1) clone that never
//! observes later appends.

use std::fmt;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::fact::Fact;
use crate::linear_hash::LinearHashMap;
use crate::value::{FieldType, Value};
use crate::{Error, Result};

/// Identifier of a declared fact type.
#[derive(Copy, Clone, Eq, PartialEq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct TypeId(pub(crate) u32);

impl TypeId {
    /// Returns the dense index of this type.
    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Debug for TypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TypeId({})", self.0)
    }
}

/// A declared fact type.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TypeDescriptor {
    /// The type's identifier.
    pub id: TypeId,
    /// The type's name, as carried by [`Fact::type_name`].
    pub name: Arc<str>,
    /// Declared fields in declaration order.
    pub fields: Vec<(Arc<str>, FieldType)>,
}

impl TypeDescriptor {
    /// Returns the declared type of a field.
    #[must_use]
    pub fn field_type(&self, field: &str) -> Option<FieldType> {
        self.fields
            .iter()
            .find(|(name, _)| &**name == field)
            .map(|&(_, ty)| ty)
    }
}

/// A field that at least one compiled rule reads.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ActiveField {
    /// The declaring type.
    pub type_id: TypeId,
    /// The field name.
    pub name: Arc<str>,
    /// The field's declared type, used to coerce raw values.
    pub value_type: FieldType,
    /// Position of this field in every record's value array.
    pub index: usize,
}

/// Predicate over a single field value.
pub type AlphaTest = Arc<dyn Fn(&Value) -> Result<bool> + Send + Sync>;

/// Wraps a closure as an [`AlphaTest`].
pub fn alpha_test(test: impl Fn(&Value) -> Result<bool> + Send + Sync + 'static) -> AlphaTest {
    Arc::new(test)
}

/// A single-field predicate registered by a rule.
#[derive(Clone)]
pub struct AlphaCondition {
    /// Position of this condition's result in every record's alpha array.
    pub id: usize,
    /// Index of the active field the test reads.
    pub field_index: usize,
    /// Name of the rule that declared the condition.
    pub rule: Arc<str>,
    /// The predicate.
    pub test: AlphaTest,
}

impl AlphaCondition {
    /// Evaluates the condition, attributing failures to its rule.
    ///
    /// # Errors
    ///
    /// Returns a `Predicate` error if the test fails.
    pub fn evaluate(&self, value: &Value) -> Result<bool> {
        (self.test)(value).map_err(|e| Error::predicate(&*self.rule, e.to_string()))
    }
}

impl fmt::Debug for AlphaCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AlphaCondition")
            .field("id", &self.id)
            .field("field_index", &self.field_index)
            .field("rule", &self.rule)
            .finish_non_exhaustive()
    }
}

/// Maps fact instances to declared types.
pub trait TypeResolver {
    /// Resolves the declared type of a fact, if any.
    fn resolve(&self, fact: &Fact) -> Option<TypeId>;

    /// Looks up a declared type by name.
    fn get_type(&self, name: &str) -> Option<TypeDescriptor>;
}

#[derive(Clone)]
struct TypeEntry {
    descriptor: TypeDescriptor,
    fields: im::Vector<ActiveField>,
    alphas: im::Vector<AlphaCondition>,
}

#[derive(Default)]
struct RegistryState {
    types: Vec<TypeEntry>,
    by_name: LinearHashMap<Arc<str>, TypeId>,
}

impl RegistryState {
    fn entry(&self, id: TypeId) -> Result<&TypeEntry> {
        self.types
            .get(id.index())
            .ok_or_else(|| Error::unknown_type(format!("{id:?}")))
    }

    fn entry_mut(&mut self, id: TypeId) -> Result<&mut TypeEntry> {
        self.types
            .get_mut(id.index())
            .ok_or_else(|| Error::unknown_type(format!("{id:?}")))
    }
}

/// Shared registry of declared types, active fields, and alpha conditions.
///
/// Cloning a registry yields another handle to the same state.
#[derive(Clone, Default)]
pub struct TypeRegistry {
    state: Arc<RwLock<RegistryState>>,
}

impl TypeRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    // The state is append-only, so a panic while holding the lock cannot
    // leave it half-updated in a way readers would observe.
    fn read(&self) -> RwLockReadGuard<'_, RegistryState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, RegistryState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Declares a fact type.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if a type with the same name exists or a
    /// field name is repeated.
    ///
    /// # Panics
    ///
    /// Panics if more than `u32::MAX` types are declared.
    pub fn declare_type(&self, name: &str, fields: &[(&str, FieldType)]) -> Result<TypeId> {
        for (i, (field, _)) in fields.iter().enumerate() {
            if fields[..i].iter().any(|(other, _)| other == field) {
                return Err(Error::invalid_argument(format!(
                    "duplicate field {field} on type {name}"
                )));
            }
        }

        let mut state = self.write();
        if state.by_name.contains_key(name) {
            return Err(Error::invalid_argument(format!(
                "type {name} is already declared"
            )));
        }
        let id = TypeId(u32::try_from(state.types.len()).expect("too many types"));
        let name: Arc<str> = name.into();
        state.types.push(TypeEntry {
            descriptor: TypeDescriptor {
                id,
                name: name.clone(),
                fields: fields.iter().map(|&(f, ty)| (f.into(), ty)).collect(),
            },
            fields: im::Vector::new(),
            alphas: im::Vector::new(),
        });
        state.by_name.insert(name, id);
        Ok(id)
    }

    /// Returns the id of a declared type.
    #[must_use]
    pub fn type_id(&self, name: &str) -> Option<TypeId> {
        self.read().by_name.get(name).copied()
    }

    /// Returns the descriptor of a declared type.
    #[must_use]
    pub fn descriptor(&self, id: TypeId) -> Option<TypeDescriptor> {
        self.read().entry(id).ok().map(|e| e.descriptor.clone())
    }

    /// Returns the number of declared types.
    #[must_use]
    pub fn type_count(&self) -> usize {
        self.read().types.len()
    }

    /// Returns the descriptors of types declared at or after `start`, in
    /// declaration order.
    #[must_use]
    pub fn descriptors_from(&self, start: usize) -> Vec<TypeDescriptor> {
        self.read()
            .types
            .iter()
            .skip(start)
            .map(|e| e.descriptor.clone())
            .collect()
    }

    /// Registers a field as active, returning its stable index.
    ///
    /// Registering an already active field returns the existing entry.
    ///
    /// # Errors
    ///
    /// Returns `UnknownType` or `UnknownField` if the type or field is not
    /// declared.
    pub fn register_field(&self, type_id: TypeId, field: &str) -> Result<ActiveField> {
        let mut state = self.write();
        let entry = state.entry_mut(type_id)?;
        if let Some(existing) = entry.fields.iter().find(|f| &*f.name == field) {
            return Ok(existing.clone());
        }
        let (name, value_type) = entry
            .descriptor
            .fields
            .iter()
            .find(|(name, _)| &**name == field)
            .cloned()
            .ok_or_else(|| Error::unknown_field(&*entry.descriptor.name, field))?;
        let active = ActiveField {
            type_id,
            name,
            value_type,
            index: entry.fields.len(),
        };
        entry.fields.push_back(active.clone());
        Ok(active)
    }

    /// Registers an alpha condition on an active field.
    ///
    /// # Errors
    ///
    /// Returns `UnknownType` if the type is not declared, or
    /// `InvalidArgument` if `field_index` is not an active field.
    pub fn register_alpha(
        &self,
        type_id: TypeId,
        field_index: usize,
        rule: &str,
        test: AlphaTest,
    ) -> Result<AlphaCondition> {
        let mut state = self.write();
        let entry = state.entry_mut(type_id)?;
        if field_index >= entry.fields.len() {
            return Err(Error::invalid_argument(format!(
                "field index {field_index} is not active on {}",
                entry.descriptor.name
            )));
        }
        let condition = AlphaCondition {
            id: entry.alphas.len(),
            field_index,
            rule: rule.into(),
            test,
        };
        entry.alphas.push_back(condition.clone());
        Ok(condition)
    }

    /// Returns a snapshot of a type's active fields.
    #[must_use]
    pub fn active_fields(&self, type_id: TypeId) -> im::Vector<ActiveField> {
        self.read()
            .entry(type_id)
            .map(|e| e.fields.clone())
            .unwrap_or_default()
    }

    /// Returns a snapshot of a type's alpha conditions.
    #[must_use]
    pub fn alpha_conditions(&self, type_id: TypeId) -> im::Vector<AlphaCondition> {
        self.read()
            .entry(type_id)
            .map(|e| e.alphas.clone())
            .unwrap_or_default()
    }
}

impl TypeResolver for TypeRegistry {
    fn resolve(&self, fact: &Fact) -> Option<TypeId> {
        self.type_id(fact.type_name())
    }

    fn get_type(&self, name: &str) -> Option<TypeDescriptor> {
        let id = self.type_id(name)?;
        self.descriptor(id)
    }
}

impl fmt::Debug for TypeRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.read();
        f.debug_list()
            .entries(state.types.iter().map(|e| &e.descriptor))
            .finish()
    }
}
