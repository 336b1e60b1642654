//! Delta log: the per-transaction record of intended writes
//!
//! Every write that passes a guard is recorded as a [`DeltaEntry`] *before*
//! the underlying shadow is mutated. At commit, the log is replayed onto an
//! empty patch ([`PendingPatch`]) structured by top-level key - the patch
//! holds only touched subtrees, which is what lets smart CAS merge
//! disjoint-key commits without false conflicts.

use std::collections::BTreeSet;
use std::fmt;
use theus_core::path::ContextPath;
use theus_core::tree::map_delete_at_path;
use theus_core::value::{Value, ValueMap};

/// Operation tag of a delta entry
///
/// The tag is what distinguishes e.g. a LOG-zone `append` (allowed) from a
/// LOG-zone `pop` (denied); guards check capabilities before recording.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeltaOp {
    /// Replace the value at a path
    Set,
    /// Remove the value at a path
    Delete,
    /// Grow a container (list push / set add / list insert)
    Append,
    /// Remove one element from a container
    Pop,
    /// Empty a container
    Clear,
    /// Reverse a sequence in place
    Reverse,
    /// Sort a sequence in place
    Sort,
    /// Remove the last entry of a mapping
    PopItem,
}

impl DeltaOp {
    /// Short tag name for diagnostics
    pub fn as_str(&self) -> &'static str {
        match self {
            DeltaOp::Set => "set",
            DeltaOp::Delete => "del",
            DeltaOp::Append => "append",
            DeltaOp::Pop => "pop",
            DeltaOp::Clear => "clear",
            DeltaOp::Reverse => "reverse",
            DeltaOp::Sort => "sort",
            DeltaOp::PopItem => "popitem",
        }
    }

    /// True for operations that only grow their container
    pub fn is_growth(&self) -> bool {
        matches!(self, DeltaOp::Append)
    }
}

impl fmt::Display for DeltaOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One recorded write
///
/// For `Set`/`Delete`, `path` addresses the written slot. For container
/// operations, `path` addresses the container; `old`/`new` carry the element
/// that left or entered it (e.g. the appended value, the popped value).
#[derive(Debug, Clone, PartialEq)]
pub struct DeltaEntry {
    /// Full path of the write
    pub path: ContextPath,
    /// Operation tag
    pub op: DeltaOp,
    /// Value displaced by the operation, if any
    pub old: Option<Value>,
    /// Value introduced by the operation, if any
    pub new: Option<Value>,
}

impl DeltaEntry {
    /// Create an entry
    pub fn new(path: ContextPath, op: DeltaOp, old: Option<Value>, new: Option<Value>) -> Self {
        DeltaEntry { path, op, old, new }
    }
}

/// Ordered log of writes within one transaction
///
/// Entry order is the observed program order.
#[derive(Debug, Clone, Default)]
pub struct DeltaLog {
    entries: Vec<DeltaEntry>,
}

impl DeltaLog {
    /// Create an empty log
    pub fn new() -> Self {
        DeltaLog::default()
    }

    /// Record an entry
    pub fn record(&mut self, entry: DeltaEntry) {
        self.entries.push(entry);
    }

    /// The recorded entries in program order
    pub fn entries(&self) -> &[DeltaEntry] {
        &self.entries
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when nothing was written
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Every distinct written path, in first-write order
    pub fn written_paths(&self) -> Vec<&ContextPath> {
        let mut seen = Vec::new();
        for entry in &self.entries {
            if !seen.contains(&&entry.path) {
                seen.push(&entry.path);
            }
        }
        seen
    }

    /// Clear all entries (used when a retry re-opens the transaction)
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// The patch a transaction submits to the store
///
/// `data` holds only touched subtrees (missing keys mean "untouched";
/// empty sub-maps mean "observed but unchanged"). Deletions cannot be
/// expressed through a deep merge, so they travel as an ordered tombstone
/// list applied after the merge.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PendingPatch {
    /// Touched subtrees, keyed by top-level key
    pub data: ValueMap,
    /// Paths removed by the transaction, in program order
    pub deletions: Vec<ContextPath>,
}

impl PendingPatch {
    /// True when the patch carries no writes and no tombstones
    pub fn is_empty(&self) -> bool {
        self.data.is_empty() && self.deletions.is_empty()
    }

    /// Top-level keys this patch touches (writes, markers, and tombstones)
    ///
    /// This is the set smart CAS intersects with concurrent commits.
    pub fn top_level_keys(&self) -> BTreeSet<String> {
        let mut keys: BTreeSet<String> = self.data.keys().cloned().collect();
        for path in &self.deletions {
            if let Some(top) = path.top_level() {
                keys.insert(top.to_string());
            }
        }
        keys
    }

    /// Top-level keys that actually change state (markers excluded)
    ///
    /// Commit history records these, so a pure observation marker never
    /// blocks someone else's disjoint merge.
    pub fn changed_keys(&self) -> BTreeSet<String> {
        let mut keys: BTreeSet<String> = self
            .data
            .iter()
            .filter(|(_, v)| !matches!(v, Value::Map(m) if m.is_empty()))
            .map(|(k, _)| k.clone())
            .collect();
        for path in &self.deletions {
            if let Some(top) = path.top_level() {
                keys.insert(top.to_string());
            }
        }
        keys
    }

    /// Drop a pending tombstone that a later write resurrected
    pub fn retract_deletion(&mut self, path: &ContextPath) {
        self.deletions.retain(|p| !path.is_ancestor_of(p));
    }

    /// Remove any staged data under a path (used when the path is deleted
    /// after being written in the same transaction)
    pub fn drop_staged(&mut self, path: &ContextPath) {
        map_delete_at_path(&mut self.data, path);
    }
}
