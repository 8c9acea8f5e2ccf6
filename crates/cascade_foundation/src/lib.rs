//! Error types, values, interning, open-addressing tables, and fact schema for Cascade.
//!
//! This crate provides:
//! - [`LinearHash`] / [`LinearHashMap`] - Linear-probing tables that shrink
//! - [`Value`] and [`FieldType`] - Field values and typed equality
//! - [`ValueInterner`] - Stable [`ValueHandle`]s for field values
//! - [`TypeRegistry`] - Declared fact types with append-only field indices
//! - [`Fact`], [`FactHandle`], [`FactRecord`] - Working-memory facts
//! - [`Error`] - Rich error types with context

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod fact;
pub mod intern;
pub mod linear_hash;
pub mod schema;
pub mod value;

pub use error::{Error, ErrorContext, ErrorKind, SemanticLimit};
pub use fact::{Fact, FactHandle, FactRecord};
pub use intern::{ValueHandle, ValueInterner, ValueResolver};
pub use linear_hash::{HashStrategy, LinearHash, LinearHashMap, StdHash, hash_one};
pub use schema::{
    ActiveField, AlphaCondition, AlphaTest, TypeDescriptor, TypeId, TypeRegistry, TypeResolver,
    alpha_test,
};
pub use value::{FieldType, Value};

/// Result type alias using the Cascade [`Error`] type.
pub type Result<T> = std::result::Result<T, Error>;
