//! Context guard: the capability-checked proxy handed to user code
//!
//! A guard mediates every read and write a process performs. Checks run in
//! a fixed order on each access:
//!
//! 1. the guard never exposes its underlying shadow or transaction, so
//!    there is no reach-around to unchecked state;
//! 2. zone physics against the full path - the CONSTANT ceiling binds even
//!    under admin elevation, PRIVATE reads by non-admin yield the hidden
//!    sentinel (`Ok(None)`) rather than an error;
//! 3. the contract - the path must match an input pattern (reads) or an
//!    output pattern (writes); admin elevation does not bypass contracts;
//! 4. system top-level keys (`outbox`, `local`) skip (2) and (3) and pass
//!    through unconditionally.
//!
//! Reads return detached clones, so iteration is frozen against later
//! mutation. Writes additionally emit a delta entry to the transaction;
//! the entry's op tag is what distinguishes a LOG `append` (allowed) from
//! a LOG `pop` (denied).

use crate::physics::PhysicsRegistry;
use std::cell::RefCell;
use std::sync::Arc;
use theus_concurrency::{OutboxMessage, Transaction};
use theus_core::error::{Result, TheusError};
use theus_core::heavy::HeavyHandle;
use theus_core::path::{ContextPath, PatternSet};
use theus_core::value::{Value, ValueMap};
use theus_core::zone::{AccessOp, Zone};

/// Outcome of the access pipeline
enum Access {
    /// Proceed with the operation
    Allowed,
    /// PRIVATE path, non-admin read: present the hidden sentinel
    Hidden,
}

/// Capability-filtered view over a transaction
///
/// Guards are cheap to clone into children ([`ContextGuard::enter`]); all
/// of them share the same transaction through a `RefCell`, which pins the
/// whole execution to one thread.
pub struct ContextGuard<'t> {
    tx: &'t RefCell<Transaction>,
    prefix: ContextPath,
    inputs: Arc<PatternSet>,
    outputs: Arc<PatternSet>,
    physics: Arc<PhysicsRegistry>,
    process: Arc<str>,
    strict: bool,
    pure: bool,
}

impl<'t> ContextGuard<'t> {
    /// Build a root guard over a transaction
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        tx: &'t RefCell<Transaction>,
        inputs: Arc<PatternSet>,
        outputs: Arc<PatternSet>,
        physics: Arc<PhysicsRegistry>,
        process: Arc<str>,
        strict: bool,
        pure: bool,
    ) -> Self {
        ContextGuard {
            tx,
            prefix: ContextPath::default(),
            inputs,
            outputs,
            physics,
            process,
            strict,
            pure,
        }
    }

    /// The guard's dotted path prefix ("" at the root)
    pub fn prefix(&self) -> &ContextPath {
        &self.prefix
    }

    /// Name of the executing process
    pub fn process(&self) -> &str {
        &self.process
    }

    /// Descend into a key, producing a child guard
    ///
    /// The child inherits the contract sets and transaction; its prefix is
    /// extended by `key`. Access checks happen on the child's operations,
    /// against the full path.
    pub fn enter(&self, key: impl Into<String>) -> ContextGuard<'t> {
        ContextGuard {
            tx: self.tx,
            prefix: self.prefix.child(key),
            inputs: Arc::clone(&self.inputs),
            outputs: Arc::clone(&self.outputs),
            physics: Arc::clone(&self.physics),
            process: Arc::clone(&self.process),
            strict: self.strict,
            pure: self.pure,
        }
    }

    /// Open an admin scope (nestable, LIFO; closed when the value drops)
    ///
    /// While open, every guard on this transaction is elevated: zone
    /// ceilings yield (except CONSTANT), PRIVATE becomes visible.
    /// Contracts still bind.
    pub fn admin_scope(&self) -> AdminScope<'t> {
        self.tx.borrow_mut().begin_admin();
        AdminScope { tx: self.tx }
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Read the value at a path relative to this guard
    ///
    /// Returns a detached clone. A PRIVATE path read without admin yields
    /// `Ok(None)` - the hidden sentinel - without error.
    pub fn get(&self, rel: &str) -> Result<Option<Value>> {
        let full = self.full(rel)?;
        match self.check(&full, AccessOp::Read)? {
            Access::Hidden => Ok(None),
            Access::Allowed => Ok(self.route_read(&full)),
        }
    }

    /// Read with a default
    pub fn get_or(&self, rel: &str, default: Value) -> Result<Value> {
        Ok(self.get(rel)?.unwrap_or(default))
    }

    /// True when a value exists at the path (hidden paths read as absent)
    pub fn exists(&self, rel: &str) -> Result<bool> {
        Ok(self.get(rel)?.is_some())
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Replace the value at a path
    pub fn set(&self, rel: &str, value: impl Into<Value>) -> Result<()> {
        let full = self.full(rel)?;
        self.checked(&full, AccessOp::Update)?;
        let value = value.into();
        match self.physics.zone_of(&full) {
            Zone::Signal => self.tx.borrow_mut().stage_signal(full.to_string(), value),
            Zone::Heavy => match value {
                Value::Heavy(handle) => self.tx.borrow_mut().stage_heavy(full.to_string(), handle),
                other => Err(TheusError::invalid_input(format!(
                    "heavy slot '{full}' takes a heavy handle, got {}",
                    other.type_name()
                ))),
            },
            _ => self.tx.borrow_mut().apply_set(&full, value),
        }
    }

    /// Remove the value at a path
    pub fn delete(&self, rel: &str) -> Result<()> {
        let full = self.full(rel)?;
        self.checked(&full, AccessOp::Delete)?;
        match self.physics.zone_of(&full) {
            // Ephemeral zone: a delete is a null overwrite, the next
            // execution clears the map anyway
            Zone::Signal => self
                .tx
                .borrow_mut()
                .stage_signal(full.to_string(), Value::Null),
            _ => self.tx.borrow_mut().apply_delete(&full).map(|_| ()),
        }
    }

    /// Append to the container at a path
    pub fn append(&self, rel: &str, value: impl Into<Value>) -> Result<()> {
        let full = self.full(rel)?;
        self.checked(&full, AccessOp::Append)?;
        self.data_container(&full)?;
        self.tx.borrow_mut().apply_append(&full, value.into())
    }

    /// Append several values in order
    pub fn extend(&self, rel: &str, values: Vec<Value>) -> Result<()> {
        let full = self.full(rel)?;
        self.checked(&full, AccessOp::Append)?;
        self.data_container(&full)?;
        self.tx.borrow_mut().apply_extend(&full, values)
    }

    /// Insert into the sequence at a path (append capability: insertion
    /// only grows the container)
    pub fn insert(&self, rel: &str, index: usize, value: impl Into<Value>) -> Result<()> {
        let full = self.full(rel)?;
        self.checked(&full, AccessOp::Append)?;
        self.data_container(&full)?;
        self.tx.borrow_mut().apply_insert(&full, index, value.into())
    }

    /// Pop from the sequence at a path (last element, or at `index`)
    pub fn pop(&self, rel: &str, index: Option<usize>) -> Result<Value> {
        let full = self.full(rel)?;
        self.checked(&full, AccessOp::Delete)?;
        self.data_container(&full)?;
        self.tx.borrow_mut().apply_pop(&full, index)
    }

    /// Remove a set member or mapping key
    pub fn remove(&self, rel: &str, member: &str) -> Result<()> {
        let full = self.full(rel)?;
        self.checked(&full, AccessOp::Delete)?;
        self.data_container(&full)?;
        self.tx.borrow_mut().apply_remove(&full, member)
    }

    /// Remove and return the last entry of the mapping at a path
    pub fn popitem(&self, rel: &str) -> Result<(String, Value)> {
        let full = self.full(rel)?;
        self.checked(&full, AccessOp::Delete)?;
        self.data_container(&full)?;
        self.tx.borrow_mut().apply_popitem(&full)
    }

    /// Empty the container at a path
    pub fn clear(&self, rel: &str) -> Result<()> {
        let full = self.full(rel)?;
        self.checked(&full, AccessOp::Delete)?;
        self.data_container(&full)?;
        self.tx.borrow_mut().apply_clear(&full)
    }

    /// Reverse the sequence at a path
    pub fn reverse(&self, rel: &str) -> Result<()> {
        let full = self.full(rel)?;
        self.checked(&full, AccessOp::Update)?;
        self.data_container(&full)?;
        self.tx.borrow_mut().apply_reverse(&full)
    }

    /// Sort the sequence at a path
    pub fn sort(&self, rel: &str) -> Result<()> {
        let full = self.full(rel)?;
        self.checked(&full, AccessOp::Update)?;
        self.data_container(&full)?;
        self.tx.borrow_mut().apply_sort(&full)
    }

    /// Merge entries into the mapping at a path
    pub fn update(&self, rel: &str, entries: ValueMap) -> Result<()> {
        let full = self.full(rel)?;
        self.checked(&full, AccessOp::Update)?;
        self.data_container(&full)?;
        self.tx.borrow_mut().apply_update(&full, entries)
    }

    /// Container methods only apply to data-tree values; signal slots are
    /// written whole and heavy slots hold opaque handles
    fn data_container(&self, full: &ContextPath) -> Result<()> {
        match self.physics.zone_of(full) {
            Zone::Signal => Err(TheusError::invalid_input(format!(
                "'{full}' is a signal slot; signals are written whole"
            ))),
            Zone::Heavy => Err(TheusError::invalid_input(format!(
                "'{full}' holds an opaque heavy handle"
            ))),
            _ => Ok(()),
        }
    }

    /// Replace a heavy asset by name
    pub fn set_heavy(&self, rel: &str, handle: HeavyHandle) -> Result<()> {
        self.set(rel, Value::Heavy(handle))
    }

    // =========================================================================
    // Outbox
    // =========================================================================

    /// Enqueue a message for post-commit delivery
    ///
    /// The outbox is system plumbing: no zone or contract check applies,
    /// and nothing is delivered unless the transaction commits.
    pub fn send(&self, topic: impl Into<String>, payload: Value) -> Result<()> {
        self.tx
            .borrow_mut()
            .send(OutboxMessage::new(topic, payload))
    }

    // =========================================================================
    // Access pipeline
    // =========================================================================

    fn full(&self, rel: &str) -> Result<ContextPath> {
        let rel: ContextPath = rel.parse()?;
        Ok(self.prefix.join(&rel))
    }

    fn checked(&self, full: &ContextPath, op: AccessOp) -> Result<()> {
        match self.check(full, op)? {
            Access::Allowed => Ok(()),
            // Hidden only arises for reads
            Access::Hidden => Ok(()),
        }
    }

    fn check(&self, full: &ContextPath, op: AccessOp) -> Result<Access> {
        let top = full
            .top_level()
            .ok_or_else(|| TheusError::invalid_input("path must start with a key"))?;

        // (4) System plumbing passes through unconditionally
        if self.physics.is_system(top) {
            return Ok(Access::Allowed);
        }

        let admin = self.tx.borrow().is_admin();
        let zone = self.physics.zone_of(full);

        // (2) Zone physics
        if zone == Zone::Constant && op != AccessOp::Read {
            return Err(TheusError::permission_denied(
                full.to_string(),
                "constant zone is read-only, admin included",
            ));
        }
        if zone == Zone::Private && !admin {
            if op == AccessOp::Read {
                // Hidden sentinel, decided before the contract is consulted
                return Ok(Access::Hidden);
            }
            return Err(TheusError::permission_denied(
                full.to_string(),
                "private zone requires admin elevation",
            ));
        }
        let mask = self.physics.effective_mask(full, admin);
        if !mask.allows(op) {
            return Err(TheusError::permission_denied(
                full.to_string(),
                format!("{zone} zone denies {op} (effective mask: {mask})"),
            ));
        }

        // (3) Contract
        if self.pure && op != AccessOp::Read {
            return Err(TheusError::contract_violation(
                self.process.as_ref(),
                format!("pure process attempted to {op} '{full}'"),
            ));
        }
        let patterns = if op == AccessOp::Read {
            &self.inputs
        } else {
            &self.outputs
        };
        if !patterns.matches(full) {
            let reason = format!(
                "'{full}' not declared in {} (declared: {:?})",
                if op == AccessOp::Read {
                    "inputs"
                } else {
                    "outputs"
                },
                patterns.as_strings()
            );
            if self.strict || self.pure {
                return Err(TheusError::contract_violation(self.process.as_ref(), reason));
            }
            tracing::warn!(process = %self.process, %full, %op, "contract violation (non-strict)");
        }

        Ok(Access::Allowed)
    }

    fn route_read(&self, full: &ContextPath) -> Option<Value> {
        match self.physics.zone_of(full) {
            Zone::Signal => {
                let key = full.to_string();
                let tx = self.tx.borrow();
                tx.pending_signal()
                    .get(&key)
                    .cloned()
                    .or_else(|| tx.snapshot().get_signal(&key).cloned())
            }
            Zone::Heavy => {
                let key = full.to_string();
                let tx = self.tx.borrow();
                tx.pending_heavy()
                    .get(&key)
                    .cloned()
                    .or_else(|| tx.snapshot().get_heavy(&key).cloned())
                    .map(Value::Heavy)
            }
            _ => self.tx.borrow().read(full),
        }
    }
}

/// RAII admin elevation over a transaction
///
/// Dropping the scope ends the elevation (LIFO with nesting).
pub struct AdminScope<'t> {
    tx: &'t RefCell<Transaction>,
}

impl Drop for AdminScope<'_> {
    fn drop(&mut self) {
        // The scope was opened by construction; closing cannot underflow
        let _ = self.tx.borrow_mut().end_admin();
    }
}
