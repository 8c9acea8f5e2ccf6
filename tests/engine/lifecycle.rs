//! Integration tests for hot deployment, buffering, and session lifecycle

use std::sync::Arc;

use cascade_engine::{RuleBuilder, SessionConfig};
use cascade_foundation::{Error, ErrorKind};

use crate::{customer, order, order_pairs, orders_rule, payment, sequential, shop};

// =============================================================================
// Hot deployment
// =============================================================================

#[test]
fn hot_deploy_matches_a_rule_deployed_up_front() {
    let kb = shop();
    let up_front_kb = shop();
    up_front_kb.add_rule(orders_rule()).unwrap();

    let mut late = sequential(&kb);
    let mut early = sequential(&up_front_kb);
    for i in 0..50 {
        for session in [&mut late, &mut early] {
            session.insert(customer(i)).unwrap();
            session.insert(order(i % 25, i)).unwrap();
        }
    }
    late.commit().unwrap();
    early.commit().unwrap();
    assert_eq!(late.fact_count(), 100);

    late.deploy(orders_rule()).unwrap();
    assert_eq!(order_pairs(&late), order_pairs(&early));
    assert_eq!(
        late.match_count("orders").unwrap(),
        early.match_count("orders").unwrap()
    );

    // Both keep agreeing afterwards.
    for session in [&mut late, &mut early] {
        session.insert(order(3, 1_000)).unwrap();
        session.commit().unwrap();
    }
    assert_eq!(order_pairs(&late), order_pairs(&early));
}

#[test]
fn hot_deploy_with_new_filter_backfills_resident_facts() {
    let kb = shop();
    let mut session = sequential(&kb);
    for total in [5, 50, 500] {
        session.insert(order(1, total)).unwrap();
    }
    session.commit().unwrap();

    session
        .deploy(
            RuleBuilder::new("big")
                .fact("$o", "Order")
                .filter("$o", "total", |v| v.as_int().is_some_and(|t| t >= 50)),
        )
        .unwrap();
    assert_eq!(session.match_count("big").unwrap(), 2);

    session.insert(order(2, 70)).unwrap();
    session.insert(order(2, 7)).unwrap();
    session.commit().unwrap();
    assert_eq!(session.match_count("big").unwrap(), 3);
}

#[test]
fn hot_deploy_leaves_buffered_actions_pending() {
    let kb = shop();
    let mut session = sequential(&kb);
    session.insert(customer(1)).unwrap();
    session.insert(order(1, 1)).unwrap();
    session.commit().unwrap();
    session.insert(order(1, 2)).unwrap();

    session.deploy(orders_rule()).unwrap();
    assert_eq!(session.match_count("orders").unwrap(), 1);
    assert_eq!(session.pending_actions(), 1);
    session.commit().unwrap();
    assert_eq!(session.match_count("orders").unwrap(), 2);
}

#[test]
fn sessions_share_fields_activated_by_another_deploy() {
    let kb = shop();
    kb.add_rule(orders_rule()).unwrap();
    let mut first = sequential(&kb);
    let mut second = sequential(&kb);
    second.insert(payment(1, 10)).unwrap();
    second.insert(order(1, 10)).unwrap();
    second.commit().unwrap();

    // Activates Payment fields in the shared registry.
    first
        .deploy(
            RuleBuilder::new("paid")
                .fact("$o", "Order")
                .fact("$p", "Payment")
                .join(&["$o.customer", "$p.customer"], |a| a[0] == a[1]),
        )
        .unwrap();

    // The other session picks the fields up lazily and keeps working.
    second.insert(payment(1, 11)).unwrap();
    second.insert(customer(1)).unwrap();
    second.commit().unwrap();
    assert_eq!(second.match_count("orders").unwrap(), 1);
    assert!(second.match_count("paid").is_err());
}

// =============================================================================
// Buffering
// =============================================================================

#[test]
fn insert_then_delete_in_one_cycle_leaves_no_trace() {
    let kb = shop();
    kb.add_rule(orders_rule()).unwrap();
    let mut session = sequential(&kb);
    session.insert(customer(1)).unwrap();
    let fact = order(1, 10);
    let handle = session.insert(fact.clone()).unwrap().unwrap();
    session.delete(handle).unwrap();
    assert_eq!(session.pending_actions(), 1);

    let stats = session.commit().unwrap();
    assert_eq!(stats.facts_inserted, 1);
    assert_eq!(stats.facts_deleted, 0);
    assert_eq!(session.match_count("orders").unwrap(), 0);
    assert!(session.get_fact(handle).unwrap().is_none());

    // The handle is unknown now: deleting it again is a skipped no-op.
    session.delete(handle).unwrap();
    assert_eq!(session.pending_actions(), 0);
    // And the instance is free to be inserted.
    assert!(session.insert(fact).unwrap().is_some());
}

#[test]
fn get_fact_reflects_buffered_actions() {
    let kb = shop();
    let mut session = sequential(&kb);
    let handle = session.insert(order(1, 10)).unwrap().unwrap();
    assert_eq!(
        session.get_fact(handle).unwrap().unwrap().get("total").as_int(),
        Some(10)
    );
    session.commit().unwrap();

    session.update(handle, order(1, 20)).unwrap();
    session.update(handle, order(1, 30)).unwrap();
    assert_eq!(
        session.get_fact(handle).unwrap().unwrap().get("total").as_int(),
        Some(30)
    );

    session.delete(handle).unwrap();
    assert!(session.get_fact(handle).unwrap().is_none());
    // Updates after a delete are ignored.
    session.update(handle, order(1, 40)).unwrap();
    assert!(session.get_fact(handle).unwrap().is_none());

    session.commit().unwrap();
    assert!(session.get_fact(handle).unwrap().is_none());
    assert_eq!(session.fact_count(), 0);
}

#[test]
fn pending_replacement_cannot_be_inserted_again() {
    let kb = shop();
    let mut session = sequential(&kb);
    let handle = session.insert(order(1, 10)).unwrap().unwrap();
    session.commit().unwrap();

    let replacement = order(1, 20);
    session.update(handle, replacement.clone()).unwrap();
    assert!(session.insert(replacement.clone()).unwrap().is_none());
    assert_eq!(session.pending_actions(), 1);

    session.commit().unwrap();
    assert_eq!(session.fact_count(), 1);
    assert!(session.insert(replacement).unwrap().is_none());
}

#[test]
fn one_replacement_is_never_tracked_under_two_handles() {
    let kb = shop();
    let mut session = sequential(&kb);
    let first = session.insert(order(1, 10)).unwrap().unwrap();
    let second = session.insert(order(2, 20)).unwrap().unwrap();
    session.commit().unwrap();

    let shared = order(3, 30);
    session.update(first, shared.clone()).unwrap();
    session.update(second, shared.clone()).unwrap();
    session.commit().unwrap();

    let mut holders = Vec::new();
    session
        .for_each_fact(|handle, fact| {
            if Arc::ptr_eq(fact, &shared) {
                holders.push(handle);
            }
        })
        .unwrap();
    assert_eq!(holders, vec![first]);
    assert_eq!(
        session.get_fact(second).unwrap().unwrap().get("total").as_int(),
        Some(20)
    );
}

#[test]
fn superseded_replacements_are_released() {
    let kb = shop();
    let mut session = sequential(&kb);
    let original = order(1, 10);
    let handle = session.insert(original.clone()).unwrap().unwrap();
    let other = session.insert(order(2, 10)).unwrap().unwrap();
    session.commit().unwrap();

    // Replaced by a later update
    let dropped = order(1, 20);
    session.update(handle, dropped.clone()).unwrap();
    session.update(handle, order(1, 30)).unwrap();
    assert!(session.insert(dropped).unwrap().is_some());

    // Updating back to the committed instance keeps it tracked
    session.update(handle, original.clone()).unwrap();
    assert!(session.insert(original.clone()).unwrap().is_none());

    // Replaced by a delete
    let cancelled = order(2, 40);
    session.update(other, cancelled.clone()).unwrap();
    session.delete(other).unwrap();
    assert!(session.insert(cancelled).unwrap().is_some());

    session.commit().unwrap();
    assert_eq!(session.fact_count(), 3);
    assert!(session.get_fact(other).unwrap().is_none());
    assert!(session.insert(original).unwrap().is_none());
}

// =============================================================================
// Errors
// =============================================================================

fn is_closed(error: &Error) -> bool {
    matches!(error.kind, ErrorKind::SessionClosed)
}

#[test]
fn closed_session_fails_fast() {
    let kb = shop();
    kb.add_rule(orders_rule()).unwrap();
    let mut session = sequential(&kb);
    let handle = session.insert(customer(1)).unwrap().unwrap();
    session.commit().unwrap();
    session.close();

    assert!(is_closed(&session.insert(customer(2)).unwrap_err()));
    assert!(is_closed(&session.insert_typed("Customer", customer(3)).unwrap_err()));
    assert!(is_closed(&session.update(handle, customer(4)).unwrap_err()));
    assert!(is_closed(&session.delete(handle).unwrap_err()));
    assert!(is_closed(&session.get_fact(handle).unwrap_err()));
    assert!(is_closed(&session.for_each_fact(|_, _| {}).unwrap_err()));
    assert!(is_closed(&session.commit().unwrap_err()));
    assert!(is_closed(&session.fire().unwrap_err()));
    assert!(is_closed(&session.deploy(RuleBuilder::new("x").fact("$c", "Customer")).unwrap_err()));
    assert!(is_closed(&session.clear().unwrap_err()));

    // Closing twice is harmless.
    session.close();
    assert!(!session.is_active());
}

#[test]
fn filter_errors_abort_the_commit_naming_the_rule() {
    let kb = shop();
    kb.add_rule(
        RuleBuilder::new("fragile")
            .fact("$o", "Order")
            .try_filter("$o", "total", |v| match v.as_int() {
                Some(t) if t < 0 => Err(Error::invalid_argument("negative total")),
                _ => Ok(true),
            }),
    )
    .unwrap();
    let mut session = sequential(&kb);
    session.insert(order(1, 5)).unwrap();
    session.commit().unwrap();

    session.insert(order(1, -5)).unwrap();
    let err = session.commit().unwrap_err();
    match err.kind {
        ErrorKind::Predicate { rule, message } => {
            assert_eq!(rule, "fragile");
            assert!(message.contains("negative total"));
        }
        other => panic!("expected a predicate error, got {other:?}"),
    }

    // Clearing restores a usable session.
    session.clear().unwrap();
    session.insert(order(1, 5)).unwrap();
    session.commit().unwrap();
    assert_eq!(session.match_count("fragile").unwrap(), 1);
}

#[test]
fn join_errors_abort_the_commit_naming_the_rule() {
    let kb = shop();
    kb.add_rule(
        RuleBuilder::new("strict")
            .fact("$c", "Customer")
            .fact("$o", "Order")
            .try_join(&["$c.id", "$o.customer"], |a| {
                if a[1].is_nil() {
                    Err(Error::invalid_argument("order without customer"))
                } else {
                    Ok(a[0] == a[1])
                }
            }),
    )
    .unwrap();
    let mut session = sequential(&kb);
    session.insert(customer(1)).unwrap();
    session
        .insert(cascade_foundation::Fact::new("Order").with("total", 3_i64).into_shared())
        .unwrap();
    let err = session.commit().unwrap_err();
    assert!(matches!(err.kind, ErrorKind::Predicate { ref rule, .. } if rule == "strict"));
}

#[test]
fn bad_rules_are_rejected_at_definition() {
    let kb = shop();
    let unknown_type = kb.add_rule(RuleBuilder::new("a").fact("$x", "Nope"));
    assert!(matches!(unknown_type.unwrap_err().kind, ErrorKind::UnknownType(_)));

    let unknown_field = kb.add_rule(
        RuleBuilder::new("b")
            .fact("$c", "Customer")
            .filter("$c", "age", |_| true),
    );
    assert!(matches!(unknown_field.unwrap_err().kind, ErrorKind::UnknownField { .. }));

    let unknown_var = kb.add_rule(
        RuleBuilder::new("c")
            .fact("$c", "Customer")
            .join(&["$c.id", "$o.customer"], |_| true),
    );
    assert!(matches!(
        unknown_var.unwrap_err().kind,
        ErrorKind::UnknownFactReference(_)
    ));
    assert!(kb.rule_names().is_empty());
}

#[test]
fn default_config_sessions_work_too() {
    let kb = shop();
    kb.add_rule(orders_rule()).unwrap();
    let mut session = kb.new_session().unwrap();
    assert_eq!(session.config().max_fire_cycles, SessionConfig::default().max_fire_cycles);
    session.insert(customer(1)).unwrap();
    session.insert(order(1, 1)).unwrap();
    session.commit().unwrap();
    assert_eq!(order_pairs(&session), vec![(1, 1)]);
}
