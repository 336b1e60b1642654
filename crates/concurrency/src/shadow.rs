//! Shadow cache: copy-on-first-write isolation
//!
//! The first write under a top-level key detaches a deep copy of that key's
//! whole subtree from the snapshot; all later reads and writes under the key
//! navigate inside the detached copy (child paths reuse the parent shadow -
//! there is no per-key re-clone). Reads of untouched keys come straight from
//! the immutable snapshot.
//!
//! A value that refuses to clone (nesting past the depth cap) fails the
//! transaction with `TransactionIsolation`; the cache never falls back to
//! sharing the live value.

use crate::store::StateSnapshot;
use rustc_hash::FxHashMap;
use theus_core::error::{Result, TheusError};
use theus_core::path::ContextPath;
use theus_core::tree::{get_at_path, get_at_path_mut};
use theus_core::value::Value;

/// Per-transaction detached copies of touched subtrees
#[derive(Debug)]
pub struct ShadowCache {
    snapshot: StateSnapshot,
    roots: FxHashMap<String, Value>,
}

impl ShadowCache {
    /// Create a cache over a snapshot
    pub fn new(snapshot: StateSnapshot) -> Self {
        ShadowCache {
            snapshot,
            roots: FxHashMap::default(),
        }
    }

    /// The snapshot this cache isolates against
    pub fn snapshot(&self) -> &StateSnapshot {
        &self.snapshot
    }

    /// Number of detached top-level subtrees
    pub fn shadowed_roots(&self) -> usize {
        self.roots.len()
    }

    /// True if the top-level key has been detached
    pub fn is_shadowed(&self, top: &str) -> bool {
        self.roots.contains_key(top)
    }

    /// Read the value at a path, preferring the detached copy
    ///
    /// Read-your-writes: once a subtree is shadowed, reads under it observe
    /// the transaction's own mutations.
    pub fn get(&self, path: &ContextPath) -> Option<&Value> {
        let top = path.top_level()?;
        match self.roots.get(top) {
            Some(root) => {
                if path.len() == 1 {
                    Some(root)
                } else {
                    get_at_path(root, &path.segments()[1..])
                }
            }
            None => self.snapshot.get(path),
        }
    }

    /// Detach the subtree under a top-level key, if not already detached
    ///
    /// A key absent from the snapshot detaches as an empty mapping so that
    /// new state can be built under it.
    ///
    /// # Errors
    /// `TransactionIsolation` when the subtree refuses to deep-clone.
    pub fn ensure_root(&mut self, top: &str) -> Result<&mut Value> {
        if !self.roots.contains_key(top) {
            let detached = match self.snapshot.data().get(top) {
                Some(live) => live
                    .deep_clone()
                    .map_err(|e| TheusError::isolation(top, e.to_string()))?,
                None => Value::map(),
            };
            self.roots.insert(top.to_string(), detached);
        }
        Ok(self
            .roots
            .get_mut(top)
            .expect("root inserted on the line above"))
    }

    /// Mutable access to the slot at a path, detaching its root first
    ///
    /// Returns None if the path does not resolve inside the detached root.
    pub fn get_mut(&mut self, path: &ContextPath) -> Result<Option<&mut Value>> {
        let top = path
            .top_level()
            .ok_or_else(|| TheusError::invalid_input("path must start with a key"))?
            .to_string();
        let root = self.ensure_root(&top)?;
        if path.len() == 1 {
            return Ok(Some(root));
        }
        Ok(get_at_path_mut(root, &path.segments()[1..]))
    }

    /// Replace the whole value under a top-level key
    pub fn set_root(&mut self, top: &str, value: Value) {
        self.roots.insert(top.to_string(), value);
    }

    /// Iterate detached roots
    pub fn roots(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.roots.iter()
    }
}
