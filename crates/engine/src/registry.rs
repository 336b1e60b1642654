//! Process registry and declarative outputs
//!
//! A registered process is a name, a [`Contract`] and a handler closure.
//! Registration enforces the semantic firewall: PURE processes may not
//! declare signal- or meta-zone inputs (ephemeral and diagnostic state
//! would make them impure by construction).
//!
//! Handlers return a [`ProcessOutput`]; besides mutating state through the
//! guard, a process may return a declarative [`StateUpdate`] (or a plain
//! value for single-output contracts) that the engine folds into the
//! pending patch under output-permission checks.

use crate::guard::ContextGuard;
use std::collections::HashMap;
use theus_core::contract::{Contract, Semantic};
use theus_core::error::{Result, TheusError};
use theus_core::value::{Value, ValueMap};
use theus_core::zone::Zone;

/// Declarative state update returned by a process
///
/// `key`/`value` assign a single path; `data` assigns several
/// (`path → value`). Paths under the `heavy` root stage handle
/// replacements instead of data writes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StateUpdate {
    /// Single assignment target
    pub key: Option<String>,
    /// Value for `key`
    pub value: Option<Value>,
    /// Bulk assignments, path → value
    pub data: Vec<(String, Value)>,
}

impl StateUpdate {
    /// Assign one path
    pub fn assign(key: impl Into<String>, value: Value) -> Self {
        StateUpdate {
            key: Some(key.into()),
            value: Some(value),
            data: Vec::new(),
        }
    }

    /// Add a bulk assignment
    pub fn with(mut self, path: impl Into<String>, value: Value) -> Self {
        self.data.push((path.into(), value));
        self
    }

    /// Every (path, value) pair carried by this update
    pub fn assignments(&self) -> Vec<(String, Value)> {
        let mut out = Vec::new();
        if let (Some(key), Some(value)) = (&self.key, &self.value) {
            out.push((key.clone(), value.clone()));
        }
        out.extend(self.data.iter().cloned());
        out
    }
}

/// What a process hands back to the engine
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessOutput {
    /// Nothing beyond guard mutations
    Unit,
    /// A result value, mapped onto the contract's outputs where it fits
    Value(Value),
    /// An explicit declarative update
    Update(StateUpdate),
}

impl From<()> for ProcessOutput {
    fn from(_: ()) -> Self {
        ProcessOutput::Unit
    }
}

impl From<Value> for ProcessOutput {
    fn from(v: Value) -> Self {
        ProcessOutput::Value(v)
    }
}

impl From<StateUpdate> for ProcessOutput {
    fn from(u: StateUpdate) -> Self {
        ProcessOutput::Update(u)
    }
}

/// Handler signature for registered processes
///
/// The guard is the only window onto state; `kwargs` are the call
/// arguments.
pub type ProcessFn =
    dyn for<'t> Fn(&ContextGuard<'t>, &ValueMap) -> Result<ProcessOutput> + Send + Sync;

/// A registered process
pub struct RegisteredProcess {
    /// Process name
    pub name: String,
    /// Declared access surface
    pub contract: Contract,
    /// The user function
    pub handler: Box<ProcessFn>,
}

/// Name → process table
#[derive(Default)]
pub struct ProcessRegistry {
    processes: HashMap<String, RegisteredProcess>,
}

impl ProcessRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        ProcessRegistry::default()
    }

    /// Register a process, validating its contract
    ///
    /// # Errors
    /// `ContractViolation` when a PURE contract declares signal- or
    /// meta-zone inputs.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        contract: Contract,
        handler: Box<ProcessFn>,
    ) -> Result<()> {
        let name = name.into();
        if contract.semantic == Semantic::Pure {
            for pattern in contract.inputs.patterns() {
                let prefix = pattern.prefix_path();
                let top_is_ephemeral = prefix
                    .top_level()
                    .is_some_and(|t| t == "signal" || t == "meta");
                let leaf_is_ephemeral = prefix
                    .leaf_key()
                    .map(Zone::of_key)
                    .is_some_and(|z| z == Zone::Signal || z == Zone::Meta);
                if top_is_ephemeral || leaf_is_ephemeral {
                    return Err(TheusError::contract_violation(
                        &name,
                        format!(
                            "pure process cannot take inputs from the signal/meta zones (found '{}')",
                            pattern.as_str()
                        ),
                    ));
                }
            }
        }
        self.processes.insert(
            name.clone(),
            RegisteredProcess {
                name,
                contract,
                handler,
            },
        );
        Ok(())
    }

    /// Look up a process by name
    pub fn get(&self, name: &str) -> Result<&RegisteredProcess> {
        self.processes
            .get(name)
            .ok_or_else(|| TheusError::ProcessNotFound(name.to_string()))
    }

    /// Registered process names
    pub fn names(&self) -> Vec<&str> {
        self.processes.keys().map(String::as_str).collect()
    }

    /// Number of registered processes
    pub fn len(&self) -> usize {
        self.processes.len()
    }

    /// True when nothing is registered
    pub fn is_empty(&self) -> bool {
        self.processes.is_empty()
    }
}
