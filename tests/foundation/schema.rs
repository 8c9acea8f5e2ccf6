//! Integration tests for the type registry and value interning

use std::sync::Arc;

use cascade_foundation::{
    ErrorKind, Fact, FactRecord, FieldType, TypeRegistry, TypeResolver, Value, ValueInterner,
    ValueResolver, alpha_test,
};

fn registry() -> TypeRegistry {
    let registry = TypeRegistry::new();
    registry
        .declare_type(
            "Reading",
            &[("sensor", FieldType::Str), ("celsius", FieldType::Float)],
        )
        .unwrap();
    registry
}

#[test]
fn registry_clones_see_each_others_fields() {
    let registry = registry();
    let other = registry.clone();
    let ty = registry.type_id("Reading").unwrap();

    let celsius = other.register_field(ty, "celsius").unwrap();
    let sensor = registry.register_field(ty, "sensor").unwrap();
    assert_eq!(celsius.index, 0);
    assert_eq!(sensor.index, 1);
    assert_eq!(registry.active_fields(ty).len(), 2);
    assert_eq!(other.active_fields(ty).len(), 2);
}

#[test]
fn declarations_from_many_threads_get_distinct_ids() {
    let registry = TypeRegistry::new();
    let handles: Vec<_> = (0..8)
        .map(|i| {
            let registry = registry.clone();
            std::thread::spawn(move || {
                registry
                    .declare_type(&format!("T{i}"), &[("x", FieldType::Int)])
                    .unwrap()
            })
        })
        .collect();
    let mut ids: Vec<usize> = handles
        .into_iter()
        .map(|h| h.join().unwrap().index())
        .collect();
    ids.sort_unstable();
    assert_eq!(ids, (0..8).collect::<Vec<_>>());
    assert_eq!(registry.descriptors_from(5).len(), 3);
}

#[test]
fn facts_resolve_by_type_name() {
    let registry = registry();
    let fact = Fact::new("Reading").with("sensor", "s1");
    assert_eq!(registry.resolve(&fact), registry.type_id("Reading"));
    assert_eq!(registry.resolve(&Fact::new("Unknown")), None);
}

#[test]
fn records_coerce_through_field_types() {
    let registry = registry();
    let ty = registry.type_id("Reading").unwrap();
    registry.register_field(ty, "celsius").unwrap();
    let mut interner = ValueInterner::new();

    let as_int = FactRecord::new(Fact::new("Reading").with("celsius", 20_i64).into_shared())
        .append_values(&registry.active_fields(ty), &mut interner);
    let as_float = FactRecord::new(Fact::new("Reading").with("celsius", 20.0).into_shared())
        .append_values(&registry.active_fields(ty), &mut interner);
    assert_eq!(as_int.value(0), as_float.value(0));
    assert_eq!(
        interner.value(as_int.value(0).unwrap()),
        Some(&Value::Float(20.0))
    );
}

#[test]
fn late_conditions_extend_records() {
    let registry = registry();
    let ty = registry.type_id("Reading").unwrap();
    let field = registry.register_field(ty, "celsius").unwrap();
    let mut interner = ValueInterner::new();
    let fact: Arc<Fact> = Fact::new("Reading").with("celsius", 31.5).into_shared();

    let record = FactRecord::new(fact)
        .synced(
            &registry.active_fields(ty),
            &registry.alpha_conditions(ty),
            &mut interner,
        )
        .unwrap();
    assert!(record.alpha().is_empty());

    registry
        .register_alpha(
            ty,
            field.index,
            "hot",
            alpha_test(|v| Ok(v.as_float().is_some_and(|c| c > 30.0))),
        )
        .unwrap();
    let fields = registry.active_fields(ty);
    let conditions = registry.alpha_conditions(ty);
    assert!(!record.is_synced(&fields, &conditions));
    let record = record.synced(&fields, &conditions, &mut interner).unwrap();
    assert_eq!(record.alpha(), &[true]);
}

#[test]
fn unknown_names_are_typed_errors() {
    let registry = registry();
    let ty = registry.type_id("Reading").unwrap();
    let err = registry.register_field(ty, "kelvin").unwrap_err();
    assert!(matches!(err.kind, ErrorKind::UnknownField { .. }));
    let err = registry
        .declare_type("Reading", &[("x", FieldType::Any)])
        .unwrap_err();
    assert!(matches!(err.kind, ErrorKind::InvalidArgument(_)));
}
