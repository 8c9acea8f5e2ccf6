//! Integration tests for Layer 0: Foundation
//!
//! Tests for linear hash tables, value interning, and the shared type registry.

mod schema;
mod tables;
