//! Engine behavior under the two CAS modes

use crate::path;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use theus::{Contract, Engine, EngineConfig, ExecuteOptions, TheusError, Value, ValueMap};

fn two_key_engine(strict_cas: bool) -> Engine {
    let mut config = EngineConfig::default();
    config.strict_cas = strict_cas;
    Engine::from_json(serde_json::json!({"a": 0, "b": 0}), config).unwrap()
}

#[test]
fn smart_mode_merges_disjoint_concurrent_executions() {
    let mut engine = two_key_engine(false);
    let barrier = Arc::new(Barrier::new(2));
    let invocations = Arc::new(AtomicUsize::new(0));

    for key in ["a", "b"] {
        let barrier = Arc::clone(&barrier);
        let invocations = Arc::clone(&invocations);
        engine
            .register(
                format!("write_{key}"),
                Contract::new([key], [key]).unwrap(),
                Box::new(move |ctx, _| {
                    // Both first attempts overlap at base version 0
                    if invocations.fetch_add(1, Ordering::SeqCst) < 2 {
                        barrier.wait();
                    }
                    ctx.set(key, Value::Int(1))?;
                    Ok(().into())
                }),
            )
            .unwrap();
    }
    let engine = Arc::new(engine);

    let handles: Vec<_> = ["write_a", "write_b"]
        .into_iter()
        .map(|name| {
            let engine = Arc::clone(&engine);
            std::thread::spawn(move || {
                engine.execute(name, ValueMap::new(), ExecuteOptions::with_retries(5))
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap().unwrap();
    }

    // Disjoint keys: the stale loser merged without a retry
    assert_eq!(invocations.load(Ordering::SeqCst), 2);
    assert_eq!(engine.version(), 2);
    assert_eq!(engine.state().get(&path("a")), Some(&Value::Int(1)));
    assert_eq!(engine.state().get(&path("b")), Some(&Value::Int(1)));
}

#[test]
fn strict_mode_forces_retry_even_for_disjoint_keys() {
    let mut engine = two_key_engine(true);
    let barrier = Arc::new(Barrier::new(2));
    let invocations = Arc::new(AtomicUsize::new(0));

    for key in ["a", "b"] {
        let barrier = Arc::clone(&barrier);
        let invocations = Arc::clone(&invocations);
        engine
            .register(
                format!("write_{key}"),
                Contract::new([key], [key]).unwrap(),
                Box::new(move |ctx, _| {
                    if invocations.fetch_add(1, Ordering::SeqCst) < 2 {
                        barrier.wait();
                    }
                    ctx.set(key, Value::Int(1))?;
                    Ok(().into())
                }),
            )
            .unwrap();
    }
    let engine = Arc::new(engine);

    let handles: Vec<_> = ["write_a", "write_b"]
        .into_iter()
        .map(|name| {
            let engine = Arc::clone(&engine);
            std::thread::spawn(move || {
                engine.execute(name, ValueMap::new(), ExecuteOptions::with_retries(5))
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap().unwrap();
    }

    // Any version movement rejects, so the loser ran twice
    assert_eq!(invocations.load(Ordering::SeqCst), 3);
    assert_eq!(engine.version(), 2);
    assert_eq!(engine.state().get(&path("a")), Some(&Value::Int(1)));
    assert_eq!(engine.state().get(&path("b")), Some(&Value::Int(1)));
}

#[test]
fn strict_mode_escape_hatch_reports_strict_mismatch() {
    let engine = two_key_engine(true);
    let mut patch = ValueMap::new();
    patch.insert("a".to_string(), Value::Int(1));
    engine
        .compare_and_swap(0, Some(patch.clone()), None, None, None)
        .unwrap();

    let mut second = ValueMap::new();
    second.insert("b".to_string(), Value::Int(1));
    let err = engine
        .compare_and_swap(0, Some(second), None, None, None)
        .unwrap_err();
    assert!(matches!(err, TheusError::StrictCasMismatch { .. }));
    assert!(err.to_string().contains("Strict CAS Mismatch"));
}

#[test]
fn retry_sees_fresh_state_each_attempt() {
    // The losing retry must observe the winner's committed value, not its
    // own stale snapshot
    let mut engine = two_key_engine(false);
    let barrier = Arc::new(Barrier::new(2));
    let invocations = Arc::new(AtomicUsize::new(0));
    let observed: Arc<Mutex<Vec<i64>>> = Arc::new(Mutex::new(Vec::new()));

    {
        let barrier = Arc::clone(&barrier);
        let invocations = Arc::clone(&invocations);
        let observed = Arc::clone(&observed);
        engine
            .register(
                "accumulate",
                Contract::new(["a"], ["a"]).unwrap(),
                Box::new(move |ctx, _| {
                    if invocations.fetch_add(1, Ordering::SeqCst) < 2 {
                        barrier.wait();
                    }
                    let n = ctx.get_or("a", Value::Int(0))?.as_int().unwrap_or(0);
                    observed.lock().push(n);
                    ctx.set("a", Value::Int(n + 10))?;
                    Ok(().into())
                }),
            )
            .unwrap();
    }
    let engine = Arc::new(engine);

    let handles: Vec<_> = (0..2)
        .map(|_| {
            let engine = Arc::clone(&engine);
            std::thread::spawn(move || {
                engine.execute("accumulate", ValueMap::new(), ExecuteOptions::with_retries(5))
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap().unwrap();
    }

    assert_eq!(engine.state().get(&path("a")), Some(&Value::Int(20)));
    let mut reads = observed.lock().clone();
    reads.sort_unstable();
    // Two base-0 reads plus the retry's fresh read of 10
    assert_eq!(reads, vec![0, 0, 10]);
}
