//! Integration tests comparing the rayon scheduler with sequential commits

use cascade_engine::{Parallelism, RuleBuilder, Session, SessionConfig};
use cascade_foundation::FactHandle;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use crate::{customer, order, order_pairs, orders_rule, payment, shop};

fn settled_rule() -> RuleBuilder {
    RuleBuilder::new("settled")
        .fact("$c", "Customer")
        .fact("$o", "Order")
        .fact("$p", "Payment")
        .filter("$c", "vip", |v| v.as_bool() == Some(true))
        .join(&["$c.id", "$o.customer"], |a| a[0] == a[1])
        .join(&["$o.customer", "$p.customer"], |a| a[0] == a[1])
        .join(&["$o.total", "$p.amount"], |a| a[0] == a[1])
}

fn session(parallelism: Parallelism) -> Session {
    let kb = shop();
    kb.add_rule(orders_rule()).unwrap();
    kb.add_rule(settled_rule()).unwrap();
    kb.new_session_with(
        SessionConfig::default()
            .with_parallelism(parallelism)
            .with_warn_unknown_types(false),
    )
    .unwrap()
}

fn settled_count(session: &Session) -> u64 {
    session.match_count("settled").unwrap()
}

#[test]
fn rayon_commits_match_sequential_commits() {
    let mut rng = ChaCha8Rng::seed_from_u64(42);
    let mut sequential = session(Parallelism::Sequential);
    let mut parallel = session(Parallelism::Rayon);
    let mut live: Vec<(FactHandle, FactHandle)> = Vec::new();

    for id in 0..40 {
        let a = sequential.insert(customer(id)).unwrap().unwrap();
        let b = parallel.insert(customer(id)).unwrap().unwrap();
        live.push((a, b));
    }

    for _ in 0..30 {
        for _ in 0..20 {
            let choice = rng.gen_range(0..10);
            if choice < 6 || live.is_empty() {
                let customer_id = rng.gen_range(0..40_i64);
                let total = rng.gen_range(1..6_i64);
                let fact = if rng.r#gen::<bool>() {
                    order(customer_id, total)
                } else {
                    payment(customer_id, total)
                };
                let a = sequential.insert(fact.clone()).unwrap().unwrap();
                let b = parallel.insert(fact).unwrap().unwrap();
                live.push((a, b));
            } else if choice < 8 {
                let index = rng.gen_range(0..live.len());
                let (a, b) = live[index];
                let Some(current) = sequential.get_fact(a).unwrap() else {
                    continue;
                };
                if current.type_name() != "Order" {
                    continue;
                }
                let customer_id = current.get("customer").as_int().unwrap();
                let replacement = order(customer_id, rng.gen_range(1..6_i64));
                sequential.update(a, replacement.clone()).unwrap();
                parallel.update(b, replacement).unwrap();
            } else {
                let index = rng.gen_range(0..live.len());
                let (a, b) = live.swap_remove(index);
                sequential.delete(a).unwrap();
                parallel.delete(b).unwrap();
            }
        }

        let left = sequential.commit().unwrap();
        let right = parallel.commit().unwrap();
        assert_eq!(left.facts_inserted, right.facts_inserted);
        assert_eq!(left.facts_deleted, right.facts_deleted);
        assert_eq!(left.tuples_produced, right.tuples_produced);
        assert_eq!(left.tuples_removed, right.tuples_removed);

        assert_eq!(sequential.fact_count(), parallel.fact_count());
        assert_eq!(order_pairs(&sequential), order_pairs(&parallel));
        assert_eq!(
            sequential.match_count("orders").unwrap(),
            parallel.match_count("orders").unwrap()
        );
        assert_eq!(settled_count(&sequential), settled_count(&parallel));
    }

    assert!(sequential.match_count("orders").unwrap() > 0);
}

#[test]
fn rayon_hot_deploy_matches_sequential() {
    let mut rng = ChaCha8Rng::seed_from_u64(7);
    let mut sequential = session(Parallelism::Sequential);
    let mut parallel = session(Parallelism::Rayon);
    for id in 0..30 {
        sequential.insert(customer(id)).unwrap();
        parallel.insert(customer(id)).unwrap();
    }
    for _ in 0..300 {
        let fact = order(rng.gen_range(0..30_i64), rng.gen_range(1..100_i64));
        sequential.insert(fact.clone()).unwrap();
        parallel.insert(fact).unwrap();
    }
    sequential.commit().unwrap();
    parallel.commit().unwrap();

    let big = || {
        RuleBuilder::new("big")
            .fact("$c", "Customer")
            .fact("$o", "Order")
            .filter("$o", "total", |v| v.as_int().is_some_and(|t| t >= 50))
            .join(&["$c.id", "$o.customer"], |a| a[0] == a[1])
    };
    sequential.deploy(big()).unwrap();
    parallel.deploy(big()).unwrap();
    assert_eq!(
        sequential.match_count("big").unwrap(),
        parallel.match_count("big").unwrap()
    );
    assert_eq!(
        sequential.match_count("orders").unwrap(),
        parallel.match_count("orders").unwrap()
    );
}
