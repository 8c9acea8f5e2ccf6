//! Integration tests for Layer 1: Memory
//!
//! Tests for alpha bucket routing, delta bookkeeping, and key/tuple stores.

mod buckets;
mod stores;
