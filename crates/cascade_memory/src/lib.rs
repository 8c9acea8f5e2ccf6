//! Alpha buckets, key/tuple stores, and per-type fact memory for Cascade.
//!
//! This crate provides:
//! - [`MemoryKey`] / [`JoinTuple`] - Interned join keys and tuples of keys
//! - [`KeysStore`] - Main/delta partitioned tuple storage with [`KeyMode`] cursors
//! - [`AlphaBucket`] - Facts of one type indexed by join key, filtered by an [`AlphaMask`]
//! - [`TypeMemory`] - Per-type fact table, identity tracking, and bucket routing

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod alpha;
pub mod keys;
pub mod type_memory;

pub use alpha::{AlphaBucket, AlphaMask, FieldsKey, KeyFacts};
pub use keys::{JoinTuple, KeyMode, KeysStore, MemoryKey};
pub use type_memory::TypeMemory;
