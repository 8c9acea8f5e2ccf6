//! Integration tests for join completeness

use cascade_engine::RuleBuilder;
use proptest::prelude::*;

use crate::{customer, order, order_pairs, orders_rule, payment, sequential, shop};

#[test]
fn join_is_complete_in_either_order() {
    let kb = shop();
    kb.add_rule(orders_rule()).unwrap();

    let mut customers_first = sequential(&kb);
    customers_first.insert(customer(1)).unwrap();
    customers_first.commit().unwrap();
    customers_first.insert(order(1, 10)).unwrap();
    customers_first.commit().unwrap();

    let mut orders_first = sequential(&kb);
    orders_first.insert(order(1, 10)).unwrap();
    orders_first.commit().unwrap();
    orders_first.insert(customer(1)).unwrap();
    orders_first.commit().unwrap();

    let mut together = sequential(&kb);
    together.insert(order(1, 10)).unwrap();
    together.insert(customer(1)).unwrap();
    together.commit().unwrap();

    for session in [&customers_first, &orders_first, &together] {
        assert_eq!(order_pairs(session), vec![(1, 10)]);
        assert_eq!(session.match_count("orders").unwrap(), 1);
    }
}

#[test]
fn facts_sharing_a_key_multiply_matches() {
    let kb = shop();
    kb.add_rule(orders_rule()).unwrap();
    let mut session = sequential(&kb);
    session.insert(customer(7)).unwrap();
    for total in [1, 2, 3] {
        session.insert(order(7, total)).unwrap();
    }
    session.commit().unwrap();
    assert_eq!(session.match_count("orders").unwrap(), 3);

    session.insert(order(7, 4)).unwrap();
    session.commit().unwrap();
    assert_eq!(order_pairs(&session), vec![(7, 1), (7, 2), (7, 3), (7, 4)]);
}

#[test]
fn three_way_chain_across_cycles() {
    let kb = shop();
    kb.add_rule(
        RuleBuilder::new("settled")
            .fact("$c", "Customer")
            .fact("$o", "Order")
            .fact("$p", "Payment")
            .join(&["$c.id", "$o.customer"], |a| a[0] == a[1])
            .join(&["$o.customer", "$p.customer"], |a| a[0] == a[1])
            .join(&["$o.total", "$p.amount"], |a| a[0] == a[1]),
    )
    .unwrap();
    let mut session = sequential(&kb);
    session.insert(payment(1, 50)).unwrap();
    session.insert(payment(1, 99)).unwrap();
    session.commit().unwrap();
    session.insert(order(1, 50)).unwrap();
    session.commit().unwrap();
    assert_eq!(session.match_count("settled").unwrap(), 0);

    session.insert(customer(1)).unwrap();
    session.commit().unwrap();
    assert_eq!(session.match_count("settled").unwrap(), 1);
    let matched = session.rule_matches("settled").unwrap();
    assert_eq!(matched[0][2].get("amount").as_int(), Some(50));
}

#[test]
fn unjoined_facts_form_a_cross_product() {
    let kb = shop();
    kb.add_rule(
        RuleBuilder::new("pairs")
            .fact("$c", "Customer")
            .fact("$p", "Payment")
            .filter("$c", "vip", |v| v.as_bool() == Some(true)),
    )
    .unwrap();
    let mut session = sequential(&kb);
    for id in 0..4 {
        session.insert(customer(id)).unwrap();
    }
    session.insert(payment(0, 1)).unwrap();
    session.insert(payment(0, 2)).unwrap();
    session.insert(payment(0, 3)).unwrap();
    session.commit().unwrap();
    // Two VIP customers (0 and 2) times three payments.
    assert_eq!(session.match_count("pairs").unwrap(), 6);
    assert_eq!(session.rule_matches("pairs").unwrap().len(), 6);
}

#[test]
fn non_equality_conditions_join() {
    let kb = shop();
    kb.add_rule(
        RuleBuilder::new("overpaid")
            .fact("$o", "Order")
            .fact("$p", "Payment")
            .join(&["$o.customer", "$p.customer"], |a| a[0] == a[1])
            .join(&["$o.total", "$p.amount"], |a| {
                a[1].as_int().unwrap_or(0) > a[0].as_int().unwrap_or(0)
            }),
    )
    .unwrap();
    let mut session = sequential(&kb);
    session.insert(order(1, 10)).unwrap();
    session.insert(order(1, 30)).unwrap();
    session.insert(payment(1, 20)).unwrap();
    session.insert(payment(2, 50)).unwrap();
    session.commit().unwrap();
    assert_eq!(session.match_count("overpaid").unwrap(), 1);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn batching_does_not_change_matches(
        facts in prop::collection::vec((any::<bool>(), 0i64..6, 0i64..100), 1..40),
        split in 0usize..40,
    ) {
        let kb = shop();
        kb.add_rule(orders_rule()).unwrap();
        let mut batched = sequential(&kb);
        let mut stepwise = sequential(&kb);
        for (i, &(is_customer, id, total)) in facts.iter().enumerate() {
            let fact = if is_customer { customer(id) } else { order(id, total) };
            batched.insert(fact.clone()).unwrap();
            stepwise.insert(fact).unwrap();
            if i == split {
                batched.commit().unwrap();
            }
            stepwise.commit().unwrap();
        }
        batched.commit().unwrap();

        let customers: Vec<i64> = facts.iter().filter(|f| f.0).map(|f| f.1).collect();
        let expected = facts
            .iter()
            .filter(|f| !f.0)
            .map(|f| customers.iter().filter(|&&c| c == f.1).count() as u64)
            .sum::<u64>();
        prop_assert_eq!(batched.match_count("orders").unwrap(), expected);
        prop_assert_eq!(stepwise.match_count("orders").unwrap(), expected);
        prop_assert_eq!(order_pairs(&batched), order_pairs(&stepwise));
    }
}
