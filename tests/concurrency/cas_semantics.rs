//! CAS semantics
//!
//! - Smart CAS disjoint-key merge across versions
//! - Smart CAS overlapping-key rejection with named keys
//! - Strict CAS rejection of any mismatch
//! - Deep-merge idempotence

use crate::{patch_with, path, seeded};
use theus::{deep_merge, CasMode, TheusError, Value, VersionedStore};

#[test]
fn smart_cas_merges_disjoint_writers() {
    // X reads v0, writes a; Y reads v0, writes b after X committed
    let store = seeded(serde_json::json!({"a": 0, "b": 0}));

    store
        .compare_and_swap(0, Some(&patch_with(&[("a", Value::Int(1))])), None, None, None)
        .unwrap();
    let v = store
        .compare_and_swap(0, Some(&patch_with(&[("b", Value::Int(1))])), None, None, None)
        .unwrap();

    assert_eq!(v, 2);
    let snap = store.current();
    assert_eq!(snap.get(&path("a")), Some(&Value::Int(1)));
    assert_eq!(snap.get(&path("b")), Some(&Value::Int(1)));
}

#[test]
fn smart_cas_rejects_overlapping_writers() {
    let store = seeded(serde_json::json!({"a": 0, "b": 0}));

    store
        .compare_and_swap(0, Some(&patch_with(&[("a", Value::Int(1))])), None, None, None)
        .unwrap();
    let err = store
        .compare_and_swap(0, Some(&patch_with(&[("a", Value::Int(2))])), None, None, None)
        .unwrap_err();

    match err {
        TheusError::CasVersionMismatch {
            conflicting_keys, ..
        } => assert_eq!(conflicting_keys, vec!["a".to_string()]),
        other => panic!("expected CasVersionMismatch, got {other:?}"),
    }
    // Losing CAS left no trace
    assert_eq!(store.version(), 1);
    assert_eq!(store.current().get(&path("a")), Some(&Value::Int(1)));
    assert_eq!(store.current().get(&path("b")), Some(&Value::Int(0)));
}

#[test]
fn smart_cas_merge_equals_deep_merge_of_current() {
    let store = seeded(serde_json::json!({"user": {"name": "ada"}, "stats": {"n": 0}}));

    store
        .compare_and_swap(
            0,
            Some(&patch_with(&[("stats.n", Value::Int(5))])),
            None,
            None,
            None,
        )
        .unwrap();

    // Stale writer touches only the user subtree
    let patch = patch_with(&[("user.balance", Value::Int(10))]);
    store
        .compare_and_swap(0, Some(&patch), None, None, None)
        .unwrap();

    // Result must equal deep_merge(current-at-commit-time, patch)
    let mut expected = Value::from_json(serde_json::json!({
        "user": {"name": "ada"},
        "stats": {"n": 5}
    }));
    deep_merge(&mut expected, &Value::Map(patch.data.clone()));
    assert_eq!(Value::Map(store.current().data().clone()), expected);
}

#[test]
fn strict_cas_rejects_disjoint_writers_too() {
    let store = VersionedStore::with_mode(CasMode::Strict);
    store
        .compare_and_swap(0, Some(&patch_with(&[("a", Value::Int(1))])), None, None, None)
        .unwrap();

    let err = store
        .compare_and_swap(0, Some(&patch_with(&[("b", Value::Int(1))])), None, None, None)
        .unwrap_err();
    assert!(matches!(err, TheusError::StrictCasMismatch { .. }));
}

#[test]
fn deep_merge_is_idempotent() {
    let base = Value::from_json(serde_json::json!({
        "user": {"name": "ada", "balance": 1},
        "tags": ["x"]
    }));
    let patch = Value::from_json(serde_json::json!({
        "user": {"balance": 2},
        "tags": ["y"],
        "fresh": {"k": true}
    }));

    let mut once = base.clone();
    deep_merge(&mut once, &patch);
    let mut twice = once.clone();
    deep_merge(&mut twice, &patch);

    assert_eq!(once, twice);
}

#[test]
fn failed_cas_leaves_heavy_and_signal_untouched() {
    let store = seeded(serde_json::json!({"a": 0}));
    store
        .compare_and_swap(0, Some(&patch_with(&[("a", Value::Int(1))])), None, None, None)
        .unwrap();

    let heavy_before = store.current().heavy().len();
    let mut signal = theus::ValueMap::new();
    signal.insert("sig_x".to_string(), Value::Bool(true));
    let mut heavy = std::collections::HashMap::new();
    heavy.insert(
        "weights".to_string(),
        theus::HeavyHandle::new("weights", vec![0u8]),
    );

    let err = store
        .compare_and_swap(
            0,
            Some(&patch_with(&[("a", Value::Int(9))])),
            Some(&heavy),
            Some(&signal),
            None,
        )
        .unwrap_err();
    assert!(err.is_conflict());
    assert_eq!(store.current().heavy().len(), heavy_before);
    assert!(store.current().signal().is_empty());
}
