//! Concurrent commit scenarios
//!
//! Commits race from multiple threads; versions must stay totally ordered
//! and every commit must land exactly once.

use crate::{patch_with, path, seeded};
use std::sync::{Arc, Barrier};
use theus::Value;

#[test]
fn parallel_disjoint_writers_all_merge() {
    let store = Arc::new(seeded(serde_json::json!({
        "k0": 0, "k1": 0, "k2": 0, "k3": 0, "k4": 0
    })));
    let barrier = Arc::new(Barrier::new(5));

    let handles: Vec<_> = (0..5)
        .map(|i| {
            let store = Arc::clone(&store);
            let barrier = Arc::clone(&barrier);
            std::thread::spawn(move || {
                // Everyone reads v0, then commits a distinct key
                let base = store.version();
                barrier.wait();
                let key = format!("k{i}");
                let patch = patch_with(&[(key.as_str(), Value::Int(i as i64 + 1))]);
                store
                    .compare_and_swap(base, Some(&patch), None, None, None)
                    .unwrap()
            })
        })
        .collect();

    let mut versions: Vec<u64> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    versions.sort_unstable();
    // One version per commit, densely allocated
    assert_eq!(versions, vec![1, 2, 3, 4, 5]);

    let snap = store.current();
    for i in 0..5 {
        assert_eq!(
            snap.get(&path(&format!("k{i}"))),
            Some(&Value::Int(i as i64 + 1)),
            "k{i} lost its write"
        );
    }
}

#[test]
fn same_key_race_admits_exactly_one() {
    let store = Arc::new(seeded(serde_json::json!({"hot": 0})));
    let barrier = Arc::new(Barrier::new(2));

    let handles: Vec<_> = (0..2)
        .map(|i| {
            let store = Arc::clone(&store);
            let barrier = Arc::clone(&barrier);
            std::thread::spawn(move || {
                barrier.wait();
                let patch = patch_with(&[("hot", Value::Int(i))]);
                store.compare_and_swap(0, Some(&patch), None, None, None)
            })
        })
        .collect();

    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    let wins = results.iter().filter(|r| r.is_ok()).count();
    let conflicts = results
        .iter()
        .filter(|r| matches!(r, Err(e) if e.is_conflict()))
        .count();
    assert_eq!(wins, 1);
    assert_eq!(conflicts, 1);
    assert_eq!(store.version(), 1);
}

#[test]
fn stale_loser_succeeds_after_rebase() {
    let store = seeded(serde_json::json!({"hot": 0}));

    store
        .compare_and_swap(0, Some(&patch_with(&[("hot", Value::Int(1))])), None, None, None)
        .unwrap();
    let err = store
        .compare_and_swap(0, Some(&patch_with(&[("hot", Value::Int(2))])), None, None, None)
        .unwrap_err();
    assert!(err.is_conflict());

    // Re-read, rebuild at the current version, commit cleanly
    let base = store.version();
    let v = store
        .compare_and_swap(
            base,
            Some(&patch_with(&[("hot", Value::Int(2))])),
            None,
            None,
            None,
        )
        .unwrap();
    assert_eq!(v, 2);
    assert_eq!(store.current().get(&crate::path("hot")), Some(&Value::Int(2)));
}

#[test]
fn snapshots_remain_stable_under_concurrent_commits() {
    let store = Arc::new(seeded(serde_json::json!({"n": 0})));
    let snap = store.current();

    let writers: Vec<_> = (0..4)
        .map(|i| {
            let store = Arc::clone(&store);
            std::thread::spawn(move || {
                for j in 0..25 {
                    let base = store.version();
                    let patch = patch_with(&[("n", Value::Int(i * 100 + j))]);
                    // Conflicts are expected under contention; rebase and move on
                    let _ = store.compare_and_swap(base, Some(&patch), None, None, None);
                }
            })
        })
        .collect();
    for w in writers {
        w.join().unwrap();
    }

    // The old snapshot still reads the v0 world
    assert_eq!(snap.version(), 0);
    assert_eq!(snap.get(&path("n")), Some(&Value::Int(0)));
}
