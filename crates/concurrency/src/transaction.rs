//! Transaction: the scoped unit of isolated mutation
//!
//! A transaction owns a delta log, a shadow cache, the pending heavy/signal
//! maps and an outbox. It belongs to exactly one execution; guards borrow
//! it through a `RefCell`, so cross-thread sharing is ruled out by the type
//! system (`Transaction` is deliberately not `Sync`-shared).
//!
//! # Lifecycle
//!
//! 1. **Open** - captures `base_version` from a store snapshot, status
//!    `Active`
//! 2. **Active** - guard writes grow the delta log; the shadow cache
//!    detaches touched subtrees
//! 3. **Closing** - `build_pending()` replays the log into a patch, the
//!    engine runs the CAS; on success the outbox drains, on failure every
//!    shadow and message is dropped without side effect
//!
//! Status transitions mirror the usual OCC shape:
//! `Active → Validating → Committed | Aborted`, plus `Active → Aborted`
//! for user aborts.

use crate::delta::{DeltaEntry, DeltaLog, DeltaOp, PendingPatch};
use crate::outbox::OutboxMessage;
use crate::shadow::ShadowCache;
use crate::store::StateSnapshot;
use rustc_hash::FxHashSet;
use std::cmp::Ordering;
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};
use theus_core::error::{Result, TheusError};
use theus_core::heavy::HeavyHandle;
use theus_core::path::ContextPath;
use theus_core::tree::{delete_at_path, map_set_at_path, set_at_path};
use theus_core::value::{Value, ValueMap};

/// Status of a transaction in its lifecycle
///
/// Terminal states (no transitions out): `Committed`, `Aborted`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransactionStatus {
    /// Executing; reads and writes are accepted
    Active,
    /// Being validated / committed
    Validating,
    /// Commit applied
    Committed,
    /// Rolled back
    Aborted {
        /// Human-readable reason
        reason: String,
    },
}

/// A transaction over one store snapshot
pub struct Transaction {
    tx_id: u64,
    base_version: u64,
    shadow: ShadowCache,
    delta_log: DeltaLog,
    deleted_roots: FxHashSet<String>,
    pending_heavy: HashMap<String, HeavyHandle>,
    pending_signal: ValueMap,
    outbox: VecDeque<OutboxMessage>,
    admin_depth: u32,
    status: TransactionStatus,
    start_time: Instant,
}

impl Transaction {
    /// Open a transaction against a snapshot
    pub fn open(tx_id: u64, snapshot: StateSnapshot) -> Self {
        let base_version = snapshot.version();
        Transaction {
            tx_id,
            base_version,
            shadow: ShadowCache::new(snapshot),
            delta_log: DeltaLog::new(),
            deleted_roots: FxHashSet::default(),
            pending_heavy: HashMap::new(),
            pending_signal: ValueMap::new(),
            outbox: VecDeque::new(),
            admin_depth: 0,
            status: TransactionStatus::Active,
            start_time: Instant::now(),
        }
    }

    // === Accessors ===

    /// Transaction identifier
    pub fn tx_id(&self) -> u64 {
        self.tx_id
    }

    /// Version the transaction was opened against
    pub fn base_version(&self) -> u64 {
        self.base_version
    }

    /// Current status
    pub fn status(&self) -> &TransactionStatus {
        &self.status
    }

    /// The snapshot this transaction isolates against
    pub fn snapshot(&self) -> &StateSnapshot {
        self.shadow.snapshot()
    }

    /// The recorded delta log
    pub fn delta_log(&self) -> &DeltaLog {
        &self.delta_log
    }

    /// Heavy handles staged for replacement at commit
    pub fn pending_heavy(&self) -> &HashMap<String, HeavyHandle> {
        &self.pending_heavy
    }

    /// Signals staged for the commit
    pub fn pending_signal(&self) -> &ValueMap {
        &self.pending_signal
    }

    /// Messages staged for post-commit delivery
    pub fn outbox(&self) -> &VecDeque<OutboxMessage> {
        &self.outbox
    }

    /// Time since the transaction was opened
    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    // === Admin elevation ===

    /// True while at least one admin scope is open
    pub fn is_admin(&self) -> bool {
        self.admin_depth > 0
    }

    /// Enter an admin scope (nestable, LIFO)
    pub fn begin_admin(&mut self) {
        self.admin_depth += 1;
    }

    /// Leave the innermost admin scope
    ///
    /// # Errors
    /// `InvalidState` when no scope is open.
    pub fn end_admin(&mut self) -> Result<()> {
        if self.admin_depth == 0 {
            return Err(TheusError::invalid_state("no admin scope to close"));
        }
        self.admin_depth -= 1;
        Ok(())
    }

    // === State management ===

    /// True while the transaction accepts operations
    pub fn is_active(&self) -> bool {
        matches!(self.status, TransactionStatus::Active)
    }

    /// True after a successful commit
    pub fn is_committed(&self) -> bool {
        matches!(self.status, TransactionStatus::Committed)
    }

    /// True after a rollback
    pub fn is_aborted(&self) -> bool {
        matches!(self.status, TransactionStatus::Aborted { .. })
    }

    /// Fail unless the transaction is Active
    pub fn ensure_active(&self) -> Result<()> {
        if self.is_active() {
            Ok(())
        } else {
            Err(TheusError::invalid_state(format!(
                "transaction {} is not active: {:?}",
                self.tx_id, self.status
            )))
        }
    }

    /// Transition `Active → Validating`
    pub fn mark_validating(&mut self) -> Result<()> {
        self.ensure_active()?;
        self.status = TransactionStatus::Validating;
        Ok(())
    }

    /// Transition `Validating → Committed`
    pub fn mark_committed(&mut self) -> Result<()> {
        match self.status {
            TransactionStatus::Validating => {
                self.status = TransactionStatus::Committed;
                Ok(())
            }
            _ => Err(TheusError::invalid_state(format!(
                "cannot commit transaction {} from {:?}",
                self.tx_id, self.status
            ))),
        }
    }

    /// Abort from `Active` or `Validating`, discarding all staged effects
    pub fn mark_aborted(&mut self, reason: impl Into<String>) -> Result<()> {
        match self.status {
            TransactionStatus::Committed => Err(TheusError::invalid_state(format!(
                "cannot abort committed transaction {}",
                self.tx_id
            ))),
            TransactionStatus::Aborted { .. } => Err(TheusError::invalid_state(format!(
                "transaction {} already aborted",
                self.tx_id
            ))),
            _ => {
                self.status = TransactionStatus::Aborted {
                    reason: reason.into(),
                };
                self.pending_heavy.clear();
                self.pending_signal.clear();
                self.outbox.clear();
                // The delta log is kept for diagnostics
                Ok(())
            }
        }
    }

    /// Reason the transaction aborted, if it did
    pub fn abort_reason(&self) -> Option<&str> {
        match &self.status {
            TransactionStatus::Aborted { reason } => Some(reason),
            _ => None,
        }
    }

    // === Reads ===

    /// Read the value at a path (read-your-writes, read-your-deletes)
    pub fn read(&self, path: &ContextPath) -> Option<Value> {
        let top = path.top_level()?;
        if self.deleted_roots.contains(top) {
            return None;
        }
        self.shadow.get(path).cloned()
    }

    /// True when a value exists at the path in this transaction's view
    pub fn exists(&self, path: &ContextPath) -> bool {
        self.read(path).is_some()
    }

    // === Writes ===
    //
    // Every mutator records its delta entry BEFORE touching the shadow, so
    // the log order is the observed program order even if a later step
    // fails.

    /// Replace the value at a path
    pub fn apply_set(&mut self, path: &ContextPath, value: Value) -> Result<()> {
        self.ensure_active()?;
        let top = top_key(path)?;
        let old = self.read(path);
        self.delta_log.record(DeltaEntry::new(
            path.clone(),
            DeltaOp::Set,
            old,
            Some(value.clone()),
        ));

        self.deleted_roots.remove(&top);
        if path.len() == 1 {
            self.shadow.set_root(&top, value);
        } else {
            let root = self.shadow.ensure_root(&top)?;
            set_at_path(root, &path.segments()[1..], value)?;
        }
        Ok(())
    }

    /// Remove the value at a path
    pub fn apply_delete(&mut self, path: &ContextPath) -> Result<Option<Value>> {
        self.ensure_active()?;
        let top = top_key(path)?;
        let old = self.read(path);
        self.delta_log
            .record(DeltaEntry::new(path.clone(), DeltaOp::Delete, old, None));

        if path.len() == 1 {
            // Detach first so a later write under the key starts fresh
            self.shadow.ensure_root(&top)?;
            self.shadow.set_root(&top, Value::map());
            self.deleted_roots.insert(top);
            Ok(None)
        } else {
            let root = self.shadow.ensure_root(&top)?;
            Ok(delete_at_path(root, &path.segments()[1..]))
        }
    }

    /// Append to the container at a path (list push / set add)
    pub fn apply_append(&mut self, path: &ContextPath, value: Value) -> Result<()> {
        self.ensure_active()?;
        self.delta_log.record(DeltaEntry::new(
            path.clone(),
            DeltaOp::Append,
            None,
            Some(value.clone()),
        ));
        match self.container_mut(path)? {
            Value::List(items) => {
                items.push(value);
                Ok(())
            }
            Value::Set(members) => match value {
                Value::String(member) => {
                    members.insert(member);
                    Ok(())
                }
                other => Err(TheusError::invalid_input(format!(
                    "set members must be strings, got {}",
                    other.type_name()
                ))),
            },
            other => Err(not_a(other, path, "list or set")),
        }
    }

    /// Append several values in order
    pub fn apply_extend(&mut self, path: &ContextPath, values: Vec<Value>) -> Result<()> {
        for value in values {
            self.apply_append(path, value)?;
        }
        Ok(())
    }

    /// Insert into the sequence at a path
    ///
    /// Insertion grows the container without touching existing entries, so
    /// it is recorded (and capability-checked) as an append.
    pub fn apply_insert(&mut self, path: &ContextPath, index: usize, value: Value) -> Result<()> {
        self.ensure_active()?;
        self.delta_log.record(DeltaEntry::new(
            path.clone(),
            DeltaOp::Append,
            None,
            Some(value.clone()),
        ));
        match self.container_mut(path)? {
            Value::List(items) => {
                if index > items.len() {
                    return Err(TheusError::invalid_input(format!(
                        "insert index {} out of range (len {})",
                        index,
                        items.len()
                    )));
                }
                items.insert(index, value);
                Ok(())
            }
            other => Err(not_a(other, path, "list")),
        }
    }

    /// Pop from the sequence at a path (last element, or at `index`)
    pub fn apply_pop(&mut self, path: &ContextPath, index: Option<usize>) -> Result<Value> {
        self.ensure_active()?;
        // Peek the victim before recording, so the entry carries it
        let victim = {
            let current = self
                .read(path)
                .ok_or_else(|| TheusError::invalid_input(format!("no value at '{path}'")))?;
            match current {
                Value::List(items) => {
                    let idx = index.unwrap_or(items.len().saturating_sub(1));
                    items.get(idx).cloned().ok_or_else(|| {
                        TheusError::invalid_input(format!(
                            "pop index {} out of range (len {})",
                            idx,
                            items.len()
                        ))
                    })?
                }
                other => return Err(not_a(&other, path, "list")),
            }
        };
        self.delta_log.record(DeltaEntry::new(
            path.clone(),
            DeltaOp::Pop,
            Some(victim.clone()),
            None,
        ));
        match self.container_mut(path)? {
            Value::List(items) => {
                let idx = index.unwrap_or(items.len() - 1);
                Ok(items.remove(idx))
            }
            other => Err(not_a(other, path, "list")),
        }
    }

    /// Remove a member from the set (or a key from the mapping) at a path
    pub fn apply_remove(&mut self, path: &ContextPath, member: &str) -> Result<()> {
        self.ensure_active()?;
        let old = self.read(&path.child(member));
        self.delta_log.record(DeltaEntry::new(
            path.clone(),
            DeltaOp::Pop,
            old.or_else(|| Some(Value::String(member.to_string()))),
            None,
        ));
        match self.container_mut(path)? {
            Value::Set(members) => {
                if !members.remove(member) {
                    return Err(TheusError::invalid_input(format!(
                        "'{member}' not present in set '{path}'"
                    )));
                }
                Ok(())
            }
            Value::Map(entries) => {
                if entries.remove(member).is_none() {
                    return Err(TheusError::invalid_input(format!(
                        "key '{member}' not present in '{path}'"
                    )));
                }
                Ok(())
            }
            other => Err(not_a(other, path, "set or map")),
        }
    }

    /// Remove and return the last entry (key order) of the mapping at a path
    pub fn apply_popitem(&mut self, path: &ContextPath) -> Result<(String, Value)> {
        self.ensure_active()?;
        let victim = {
            let current = self
                .read(path)
                .ok_or_else(|| TheusError::invalid_input(format!("no value at '{path}'")))?;
            match current {
                Value::Map(entries) => entries
                    .iter()
                    .next_back()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .ok_or_else(|| {
                        TheusError::invalid_input(format!("popitem on empty map '{path}'"))
                    })?,
                other => return Err(not_a(&other, path, "map")),
            }
        };
        self.delta_log.record(DeltaEntry::new(
            path.clone(),
            DeltaOp::PopItem,
            Some(victim.1.clone()),
            None,
        ));
        match self.container_mut(path)? {
            Value::Map(entries) => {
                entries.remove(&victim.0);
                Ok(victim)
            }
            other => Err(not_a(other, path, "map")),
        }
    }

    /// Empty the container at a path
    pub fn apply_clear(&mut self, path: &ContextPath) -> Result<()> {
        self.ensure_active()?;
        self.delta_log
            .record(DeltaEntry::new(path.clone(), DeltaOp::Clear, None, None));
        match self.container_mut(path)? {
            Value::List(items) => items.clear(),
            Value::Map(entries) => entries.clear(),
            Value::Set(members) => members.clear(),
            other => return Err(not_a(other, path, "container")),
        }
        Ok(())
    }

    /// Reverse the sequence at a path in place
    pub fn apply_reverse(&mut self, path: &ContextPath) -> Result<()> {
        self.ensure_active()?;
        self.delta_log
            .record(DeltaEntry::new(path.clone(), DeltaOp::Reverse, None, None));
        match self.container_mut(path)? {
            Value::List(items) => {
                items.reverse();
                Ok(())
            }
            other => Err(not_a(other, path, "list")),
        }
    }

    /// Sort the sequence at a path in place (stable, cross-type total order)
    pub fn apply_sort(&mut self, path: &ContextPath) -> Result<()> {
        self.ensure_active()?;
        self.delta_log
            .record(DeltaEntry::new(path.clone(), DeltaOp::Sort, None, None));
        match self.container_mut(path)? {
            Value::List(items) => {
                items.sort_by(value_order);
                Ok(())
            }
            other => Err(not_a(other, path, "list")),
        }
    }

    /// Merge entries into the mapping at a path (recorded per key)
    pub fn apply_update(&mut self, path: &ContextPath, entries: ValueMap) -> Result<()> {
        for (key, value) in entries {
            self.apply_set(&path.child(key), value)?;
        }
        Ok(())
    }

    // === Staging ===

    /// Stage a heavy-handle replacement for commit
    pub fn stage_heavy(&mut self, name: impl Into<String>, handle: HeavyHandle) -> Result<()> {
        self.ensure_active()?;
        self.pending_heavy.insert(name.into(), handle);
        Ok(())
    }

    /// Stage a signal write for commit
    pub fn stage_signal(&mut self, key: impl Into<String>, value: Value) -> Result<()> {
        self.ensure_active()?;
        self.pending_signal.insert(key.into(), value);
        Ok(())
    }

    /// Enqueue an outbox message
    pub fn send(&mut self, message: OutboxMessage) -> Result<()> {
        self.ensure_active()?;
        self.outbox.push_back(message);
        Ok(())
    }

    /// Drain the outbox (post-commit relay, or carry-forward across retries)
    pub fn take_outbox(&mut self) -> VecDeque<OutboxMessage> {
        std::mem::take(&mut self.outbox)
    }

    /// Seed the outbox with messages carried over from an earlier attempt
    pub fn adopt_outbox(&mut self, messages: VecDeque<OutboxMessage>) {
        let mut messages = messages;
        messages.extend(self.outbox.drain(..));
        self.outbox = messages;
    }

    // === Pending patch ===

    /// Replay the delta log into the patch submitted to the store
    ///
    /// Entries replay in program order onto an empty map structured by
    /// top-level key; container entries copy the container's final shadow
    /// state, so the patch holds only touched subtrees.
    pub fn build_pending(&self) -> Result<PendingPatch> {
        let mut patch = PendingPatch::default();
        for entry in self.delta_log.entries() {
            match entry.op {
                DeltaOp::Delete => {
                    patch.drop_staged(&entry.path);
                    patch.deletions.push(entry.path.clone());
                }
                DeltaOp::Set => {
                    patch.retract_deletion(&entry.path);
                    if let Some(value) = self.shadow_value(&entry.path) {
                        map_set_at_path(&mut patch.data, &entry.path, value)?;
                    }
                }
                // Container ops submit the container's final state
                _ => {
                    if let Some(value) = self.shadow_value(&entry.path) {
                        map_set_at_path(&mut patch.data, &entry.path, value)?;
                    }
                }
            }
        }
        Ok(patch)
    }

    fn shadow_value(&self, path: &ContextPath) -> Option<Value> {
        let top = path.top_level()?;
        if self.deleted_roots.contains(top) {
            return None;
        }
        self.shadow.get(path).cloned()
    }

    fn container_mut(&mut self, path: &ContextPath) -> Result<&mut Value> {
        let slot = self.shadow.get_mut(path)?;
        slot.ok_or_else(|| TheusError::invalid_input(format!("no container at '{path}'")))
    }
}

fn top_key(path: &ContextPath) -> Result<String> {
    path.top_level()
        .map(str::to_string)
        .ok_or_else(|| TheusError::invalid_input("path must start with a key"))
}

fn not_a(value: &Value, path: &ContextPath, wanted: &str) -> TheusError {
    TheusError::invalid_input(format!(
        "'{path}' is a {}, expected {wanted}",
        value.type_name()
    ))
}

/// Deterministic cross-type ordering used by `sort`
///
/// Orders by type rank first (null < bool < number < string < containers),
/// then within the type. Floats compare by total order.
fn value_order(a: &Value, b: &Value) -> Ordering {
    fn rank(v: &Value) -> u8 {
        match v {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Int(_) | Value::Float(_) => 2,
            Value::String(_) => 3,
            Value::List(_) => 4,
            Value::Map(_) => 5,
            Value::Set(_) => 6,
            Value::Heavy(_) => 7,
        }
    }
    match (a, b) {
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Int(x), Value::Int(y)) => x.cmp(y),
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Int(_) | Value::Float(_), Value::Int(_) | Value::Float(_)) => {
            let x = a.as_float().unwrap_or(0.0);
            let y = b.as_float().unwrap_or(0.0);
            x.total_cmp(&y)
        }
        (Value::List(x), Value::List(y)) => x.len().cmp(&y.len()),
        (Value::Heavy(x), Value::Heavy(y)) => x.name().cmp(y.name()),
        _ => rank(a).cmp(&rank(b)),
    }
}
