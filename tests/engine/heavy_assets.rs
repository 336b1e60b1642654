//! Heavy-asset handling through the engine
//!
//! Handles are refcounted and replaced atomically at commit; payloads
//! never enter the shadow cache.

use crate::{engine_with, path};
use theus::{Contract, ExecuteOptions, HeavyHandle, TheusError, Value, ValueMap};

#[test]
fn heavy_handle_replaces_on_commit_only() {
    let mut engine = engine_with(serde_json::json!({"a": 0}));
    let weights = engine.heavy().alloc("weights", vec![1u8; 1024]).unwrap();

    {
        let w = weights.clone();
        engine
            .register(
                "load_model",
                Contract::new(["heavy_weights"], ["heavy_weights"]).unwrap(),
                Box::new(move |ctx, kw| {
                    ctx.set_heavy("heavy_weights", w.clone())?;
                    if kw.get("fail").and_then(Value::as_bool).unwrap_or(false) {
                        return Err(TheusError::invalid_input("abort after staging"));
                    }
                    Ok(().into())
                }),
            )
            .unwrap();
    }

    // Failed execution: the heavy map is untouched
    let err = engine
        .execute(
            "load_model",
            crate::kwargs(serde_json::json!({"fail": true})),
            ExecuteOptions::default(),
        )
        .unwrap_err();
    assert!(matches!(err, TheusError::InvalidInput { .. }));
    assert!(engine.state().get_heavy("heavy_weights").is_none());

    // Clean execution: the handle is installed
    engine
        .execute("load_model", ValueMap::new(), ExecuteOptions::default())
        .unwrap();
    let installed = engine.state().get_heavy("heavy_weights").unwrap().clone();
    assert!(installed.same_asset(&weights));
}

#[test]
fn handle_copies_share_the_payload() {
    let engine = engine_with(serde_json::json!({}));
    let handle = engine.heavy().alloc("blob", vec![7u8; 4096]).unwrap();
    let before = handle.ref_count();

    // Snapshot copies are refcount bumps, not payload copies
    let copy = handle.clone();
    assert_eq!(handle.ref_count(), before + 1);
    assert!(copy.same_asset(&handle));
    assert_eq!(copy.bytes().as_ptr(), handle.bytes().as_ptr());
}

#[test]
fn reading_a_heavy_slot_returns_the_live_handle() {
    let mut engine = engine_with(serde_json::json!({}));
    let first = HeavyHandle::new("model", vec![1u8]);
    let second = HeavyHandle::new("model", vec![2u8]);

    {
        let (first, second) = (first.clone(), second.clone());
        engine
            .register(
                "swap",
                Contract::new(["heavy_model"], ["heavy_model"]).unwrap(),
                Box::new(move |ctx, kw| {
                    let generation = kw.get("gen").and_then(Value::as_int).unwrap_or(0);
                    let handle = if generation == 0 { &first } else { &second };
                    ctx.set_heavy("heavy_model", handle.clone())?;
                    // Read-your-writes within the transaction
                    match ctx.get("heavy_model")? {
                        Some(Value::Heavy(seen)) => assert!(seen.same_asset(handle)),
                        other => panic!("expected a staged handle, got {other:?}"),
                    }
                    Ok(().into())
                }),
            )
            .unwrap();
    }

    engine
        .execute(
            "swap",
            crate::kwargs(serde_json::json!({"gen": 0})),
            ExecuteOptions::default(),
        )
        .unwrap();
    assert!(engine
        .state()
        .get_heavy("heavy_model")
        .unwrap()
        .same_asset(&first));

    engine
        .execute(
            "swap",
            crate::kwargs(serde_json::json!({"gen": 1})),
            ExecuteOptions::default(),
        )
        .unwrap();
    assert!(engine
        .state()
        .get_heavy("heavy_model")
        .unwrap()
        .same_asset(&second));
}

#[test]
fn heavy_heap_capacity_is_enforced() {
    let mut config = theus::EngineConfig::default();
    config.heap_size_mb = 1;
    let engine = theus::Engine::from_json(serde_json::json!({}), config).unwrap();

    engine.heavy().alloc("a", vec![0u8; 600 * 1024]).unwrap();
    let err = engine.heavy().alloc("b", vec![0u8; 600 * 1024]).unwrap_err();
    assert!(matches!(err, TheusError::CapacityExceeded { .. }));

    // Freeing releases accounting
    engine.heavy().free("a");
    engine.heavy().alloc("b", vec![0u8; 600 * 1024]).unwrap();
}

#[test]
fn heavy_slots_reject_plain_values() {
    let engine = engine_with(serde_json::json!({}));
    let scope = engine.transaction();
    let err = scope
        .guard()
        .set("heavy_weights", Value::from("not a handle"))
        .unwrap_err();
    assert!(matches!(err, TheusError::InvalidInput { .. }));
    scope.rollback();
    // The data tree never gained the key
    assert_eq!(engine.state().get(&path("heavy_weights")), None);
}
