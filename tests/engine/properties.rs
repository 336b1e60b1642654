//! Property checks over the guard and zone physics

use crate::{engine_with, path};
use proptest::prelude::*;
use theus::{Engine, EngineConfig, TheusError, Value, ValueMap};

// =============================================================================
// Full zone/operation matrix
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq)]
enum Op {
    Read,
    Set,
    Append,
    Pop,
    Delete,
}

/// Expected outcome of each operation per zone prefix, non-admin, with a
/// wildcard contract. `None` in the read column means the hidden sentinel.
fn expected_allowed(prefix: &str, op: Op) -> bool {
    match (prefix, op) {
        (_, Op::Read) => true,
        ("log_", Op::Append) => true,
        ("log_", _) => false,
        ("const_", _) => false,
        ("internal_", _) => false,
        ("meta_", _) => false,
        ("sig_", Op::Set) => true,
        ("sig_", _) => false,
        ("plain_", _) => true,
        _ => unreachable!("unknown prefix {prefix}"),
    }
}

#[test]
fn zone_operation_matrix() {
    let prefixes = ["log_", "const_", "internal_", "meta_", "sig_", "plain_"];
    let ops = [Op::Read, Op::Set, Op::Append, Op::Pop, Op::Delete];

    for prefix in prefixes {
        for op in ops {
            let field = format!("{prefix}field");
            // Containers for container ops, scalars otherwise
            let engine = engine_with(serde_json::json!({
                "log_field": [1], "const_field": [1], "internal_field": [1],
                "meta_field": [1], "sig_field": [1], "plain_field": [1]
            }));
            let scope = engine.transaction();
            let guard = scope.guard();

            let result = match op {
                Op::Read => guard.get(&field).map(|_| ()),
                Op::Set => guard.set(&field, Value::Int(9)),
                Op::Append => guard.append(&field, Value::Int(9)),
                Op::Pop => guard.pop(&field, None).map(|_| ()),
                Op::Delete => guard.delete(&field),
            };

            // Signal deletes route through staging and are allowed by the
            // zone mask; treat them as writes of the null sentinel
            let allowed = expected_allowed(prefix, op)
                || (prefix == "sig_" && op == Op::Delete);
            assert_eq!(
                result.is_ok(),
                allowed,
                "{op:?} on {field}: got {result:?}"
            );
            if let Err(e) = result {
                assert!(
                    matches!(e, TheusError::PermissionDenied { .. })
                        || matches!(e, TheusError::InvalidInput { .. }),
                    "unexpected error kind for {op:?} on {field}: {e:?}"
                );
            }
        }
    }
}

#[test]
fn private_reads_hide_rather_than_fail() {
    let engine = engine_with(serde_json::json!({"internal_field": 1}));
    let scope = engine.transaction();
    assert_eq!(scope.guard().get("internal_field").unwrap(), None);
}

// =============================================================================
// Log-zone projection property
// =============================================================================

#[derive(Debug, Clone)]
enum LogOp {
    Append(i64),
    Pop,
    Set(i64),
    Clear,
}

fn log_op_strategy() -> impl Strategy<Value = LogOp> {
    prop_oneof![
        any::<i64>().prop_map(LogOp::Append),
        Just(LogOp::Pop),
        any::<i64>().prop_map(LogOp::Set),
        Just(LogOp::Clear),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Destructive operations on a LOG-zone list always fail, the list
    /// only grows, and the committed contents equal the append-only
    /// projection of the operation sequence.
    #[test]
    fn log_zone_keeps_append_only_projection(ops in prop::collection::vec(log_op_strategy(), 0..24)) {
        let engine = engine_with(serde_json::json!({"log_events": []}));
        let scope = engine.transaction();
        let guard = scope.guard();

        let mut projection: Vec<i64> = Vec::new();
        let mut last_len = 0usize;
        for op in &ops {
            match op {
                LogOp::Append(v) => {
                    guard.append("log_events", Value::Int(*v)).unwrap();
                    projection.push(*v);
                }
                LogOp::Pop => prop_assert!(guard.pop("log_events", None).is_err()),
                LogOp::Set(v) => prop_assert!(guard.set("log_events", Value::Int(*v)).is_err()),
                LogOp::Clear => prop_assert!(guard.clear("log_events").is_err()),
            }
            let len = guard
                .get("log_events")
                .unwrap()
                .unwrap()
                .as_list()
                .unwrap()
                .len();
            prop_assert!(len >= last_len, "log shrank from {} to {}", last_len, len);
            last_len = len;
        }

        scope.commit().unwrap();
        let committed = engine.state().get(&path("log_events")).unwrap().clone();
        let expected = Value::from_json(serde_json::json!(projection));
        prop_assert_eq!(committed, expected);
    }

    /// The guard never permits an operation outside the effective
    /// capability mask, whatever the field name looks like.
    #[test]
    fn no_write_escapes_the_mask(name in "[a-z]{1,8}", zone_prefix in prop::sample::select(vec!["log_", "const_", "meta_", ""])) {
        let field = format!("{zone_prefix}{name}");
        let mut seed = ValueMap::new();
        seed.insert(field.clone(), Value::from_json(serde_json::json!([1])));
        let engine = Engine::new(seed, EngineConfig::default()).unwrap();
        let scope = engine.transaction();
        let guard = scope.guard();

        let set_ok = guard.set(&field, Value::Int(1)).is_ok();
        let append_ok = guard.append(&field, Value::Int(1)).is_ok();
        let delete_ok = guard.delete(&field).is_ok();

        match zone_prefix {
            "log_" => {
                prop_assert!(!set_ok && append_ok && !delete_ok);
            }
            "const_" | "meta_" => {
                prop_assert!(!set_ok && !append_ok && !delete_ok);
            }
            "" => {
                prop_assert!(set_ok && delete_ok);
            }
            _ => unreachable!(),
        }
    }
}
