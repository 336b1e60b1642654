//! Transaction isolation
//!
//! Shadowed writes stay invisible to other transactions and snapshots
//! until the CAS lands.

use crate::{path, seeded};
use theus::{Transaction, Value};

#[test]
fn shadow_writes_invisible_until_commit() {
    let store = seeded(serde_json::json!({"user": {"balance": 100}}));

    let mut writer = Transaction::open(1, store.current());
    let observer = Transaction::open(2, store.current());

    writer
        .apply_set(&path("user.balance"), Value::Int(50))
        .unwrap();

    // The writer sees its own write; the observer sees the base value
    assert_eq!(
        writer.read(&path("user.balance")),
        Some(Value::Int(50))
    );
    assert_eq!(
        observer.read(&path("user.balance")),
        Some(Value::Int(100))
    );

    // Commit the writer through the store
    let patch = writer.build_pending().unwrap();
    store
        .compare_and_swap(writer.base_version(), Some(&patch), None, None, None)
        .unwrap();

    // The observer's snapshot is pinned at its base version
    assert_eq!(
        observer.read(&path("user.balance")),
        Some(Value::Int(100))
    );
    // Fresh snapshots see the commit
    assert_eq!(
        store.current().get(&path("user.balance")),
        Some(&Value::Int(50))
    );
}

#[test]
fn dropped_transaction_has_no_side_effect() {
    let store = seeded(serde_json::json!({"a": 1}));
    {
        let mut tx = Transaction::open(1, store.current());
        tx.apply_set(&path("a"), Value::Int(99)).unwrap();
        tx.send(theus::OutboxMessage::new("t", Value::Null)).unwrap();
        // Dropped without CAS
    }
    assert_eq!(store.version(), 0);
    assert_eq!(store.current().get(&path("a")), Some(&Value::Int(1)));
}

#[test]
fn container_mutations_happen_on_detached_copies() {
    let store = seeded(serde_json::json!({"log_events": ["base"]}));

    let mut tx = Transaction::open(1, store.current());
    tx.apply_append(&path("log_events"), Value::from("mine"))
        .unwrap();

    // Another transaction opened at the same base never observes the append
    let other = Transaction::open(2, store.current());
    assert_eq!(
        other.read(&path("log_events")),
        Some(Value::from_json(serde_json::json!(["base"])))
    );
}

#[test]
fn pending_patch_only_carries_touched_roots() {
    let store = seeded(serde_json::json!({
        "touched": {"x": 1},
        "untouched": {"big": [1, 2, 3]}
    }));

    let mut tx = Transaction::open(1, store.current());
    tx.apply_set(&path("touched.x"), Value::Int(2)).unwrap();

    let patch = tx.build_pending().unwrap();
    assert!(patch.data.contains_key("touched"));
    assert!(!patch.data.contains_key("untouched"));

    // So a concurrent commit to the untouched root merges cleanly
    store
        .compare_and_swap(
            0,
            Some(&crate::patch_with(&[("untouched.big", Value::from_json(serde_json::json!([4])))])),
            None,
            None,
            None,
        )
        .unwrap();
    store
        .compare_and_swap(tx.base_version(), Some(&patch), None, None, None)
        .unwrap();

    let snap = store.current();
    assert_eq!(snap.get(&path("touched.x")), Some(&Value::Int(2)));
    assert_eq!(
        snap.get(&path("untouched.big")),
        Some(&Value::from_json(serde_json::json!([4])))
    );
}
