//! Cascade - Incremental forward-chaining production rule engine
//!
//! This crate re-exports all layers of the Cascade system for convenient access.
//! For detailed documentation, see the individual layer crates.
//!
//! # Architecture
//!
//! ```text
//! Layer 2: cascade_engine     — Rules, beta network, commit cycles, sessions, agenda
//! Layer 1: cascade_memory     — Key/tuple stores, alpha buckets, per-type fact memory
//! Layer 0: cascade_foundation — Core types (Value, Fact, Error), linear hash tables, schema
//! ```

pub use cascade_engine as engine;
pub use cascade_foundation as foundation;
pub use cascade_memory as memory;
