//! Concurrency integration suite
//!
//! Exercises the versioned store, smart/strict CAS, transaction isolation
//! and the priority-ticket path across threads.

mod cas_semantics;
mod concurrent_commits;
mod isolation;
mod tickets;

use theus::{ContextPath, PendingPatch, Value, VersionedStore};

/// Parse a path fixture
pub fn path(s: &str) -> ContextPath {
    s.parse().unwrap()
}

/// Build a patch that sets each (path, value) pair
pub fn patch_with(entries: &[(&str, Value)]) -> PendingPatch {
    let mut patch = PendingPatch::default();
    for (p, v) in entries {
        theus_core::tree::map_set_at_path(&mut patch.data, &path(p), v.clone()).unwrap();
    }
    patch
}

/// A smart-mode store seeded with a JSON object at version 0
pub fn seeded(json: serde_json::Value) -> VersionedStore {
    let store = VersionedStore::with_mode(theus::CasMode::Smart);
    match Value::from_json(json) {
        Value::Map(m) => store.hydrate(m).unwrap(),
        _ => panic!("fixture must be an object"),
    }
    store
}
