//! Integration tests for Layer 2: Engine
//!
//! Tests for incremental joins, delta bookkeeping, hot deployment, session
//! lifecycle, the agenda, and scheduler equivalence.

mod joins;
mod lifecycle;
mod parallel;

use std::sync::Arc;

use cascade_engine::{Knowledge, RuleBuilder, Session, SessionConfig};
use cascade_foundation::{Fact, FieldType};

/// Installs a test subscriber once; `RUST_LOG=cascade_engine=debug` shows
/// commit phases.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Customers, orders, and payments keyed by customer id.
pub fn shop() -> Knowledge {
    init_tracing();
    let kb = Knowledge::new();
    kb.declare_type("Customer", &[("id", FieldType::Int), ("vip", FieldType::Bool)])
        .unwrap();
    kb.declare_type("Order", &[("customer", FieldType::Int), ("total", FieldType::Int)])
        .unwrap();
    kb.declare_type("Payment", &[("customer", FieldType::Int), ("amount", FieldType::Int)])
        .unwrap();
    kb
}

pub fn customer(id: i64) -> Arc<Fact> {
    Fact::new("Customer").with("id", id).with("vip", id % 2 == 0).into_shared()
}

pub fn order(customer: i64, total: i64) -> Arc<Fact> {
    Fact::new("Order")
        .with("customer", customer)
        .with("total", total)
        .into_shared()
}

pub fn payment(customer: i64, amount: i64) -> Arc<Fact> {
    Fact::new("Payment")
        .with("customer", customer)
        .with("amount", amount)
        .into_shared()
}

pub fn orders_rule() -> RuleBuilder {
    RuleBuilder::new("orders")
        .fact("$c", "Customer")
        .fact("$o", "Order")
        .join(&["$c.id", "$o.customer"], |a| a[0] == a[1])
}

pub fn sequential(kb: &Knowledge) -> Session {
    kb.new_session_with(SessionConfig::sequential()).unwrap()
}

/// Sorted `(customer id, order total)` pairs matched by the orders rule.
pub fn order_pairs(session: &Session) -> Vec<(i64, i64)> {
    let mut pairs: Vec<(i64, i64)> = session
        .rule_matches("orders")
        .unwrap()
        .iter()
        .map(|m| {
            (
                m[0].get("id").as_int().unwrap(),
                m[1].get("total").as_int().unwrap(),
            )
        })
        .collect();
    pairs.sort_unstable();
    pairs
}
