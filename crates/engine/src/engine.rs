//! Engine facade: orchestration of a single `execute`
//!
//! One execution runs the pipeline:
//!
//! 1. look up the process and its contract
//! 2. open a transaction on the store (signals from the previous hop are
//!    cleared first - the signal zone lives for exactly one hop)
//! 3. validate inputs (audit verdicts fail fast - they are deterministic)
//! 4. build the root guard and run the user function
//! 5. replay the delta log into the pending patch and fold in any
//!    declarative return, under output-permission checks
//! 6. validate outputs, then gate contract compliance over the delta log
//! 7. CAS at the transaction's base version
//! 8. on success: drain the outbox to the worker, record the audit
//!    success, return; on conflict: ask the controller, sleep, retry with
//!    a fresh transaction (the outbox is carried forward so earlier
//!    attempts' messages survive); on anything else: roll back and
//!    propagate
//!
//! Exactly one version increment happens per successful execution.

use crate::guard::ContextGuard;
use crate::physics::PhysicsRegistry;
use crate::registry::{ProcessFn, ProcessOutput, ProcessRegistry, RegisteredProcess};
use parking_lot::Mutex;
use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use theus_audit::{AuditSystem, Validator};
use theus_concurrency::{
    CasMode, OutboxMessage, PendingPatch, RetryController, StateSnapshot, Transaction,
    VersionedStore,
};
use theus_core::config::EngineConfig;
use theus_core::contract::Contract;
use theus_core::error::{Result, TheusError};
use theus_core::heavy::{HeavyHandle, HeavyStore};
use theus_core::path::{ContextPath, PatternSet};
use theus_core::tree::map_set_at_path;
use theus_core::value::{Value, ValueMap};
use theus_core::zone::{AccessOp, FieldAnnotation, Zone};

/// Per-call execution options
#[derive(Debug, Clone, Default)]
pub struct ExecuteOptions {
    /// Number of retries allowed after CAS conflicts (0 = single attempt)
    pub retries: u32,
    /// Requester identity for the priority-ticket gate
    pub requester: Option<String>,
}

impl ExecuteOptions {
    /// Options with a retry budget
    pub fn with_retries(retries: u32) -> Self {
        ExecuteOptions {
            retries,
            requester: None,
        }
    }

    /// Attach a requester identity
    pub fn requester(mut self, requester: impl Into<String>) -> Self {
        self.requester = Some(requester.into());
        self
    }
}

/// Offload hook for `parallel: true` processes
///
/// The core never owns a pool; a host that has one implements this trait
/// and attaches it. Without a dispatcher, parallel processes run locally.
pub trait ParallelDispatch: Send + Sync {
    /// Run the named process out-of-band and return its output
    fn dispatch(&self, name: &str, kwargs: &ValueMap, pool_size: usize) -> Result<ProcessOutput>;
}

/// Outbox relay callback
pub type OutboxWorker = dyn Fn(&OutboxMessage) + Send + Sync;

/// The Theus runtime engine
///
/// # Example
///
/// ```ignore
/// use theus_engine::{Engine, ExecuteOptions};
/// use theus_core::{Contract, EngineConfig, Value};
///
/// let mut engine = Engine::from_json(
///     serde_json::json!({"counter": 0}),
///     EngineConfig::default(),
/// )?;
/// engine.register("bump", Contract::new(["counter"], ["counter"])?, Box::new(|ctx, _| {
///     let n = ctx.get_or("counter", Value::Int(0))?.as_int().unwrap_or(0);
///     ctx.set("counter", Value::Int(n + 1))?;
///     Ok(().into())
/// }))?;
/// engine.execute("bump", Default::default(), ExecuteOptions::default())?;
/// assert_eq!(engine.state().get(&"counter".parse()?), Some(&Value::Int(1)));
/// ```
pub struct Engine {
    config: EngineConfig,
    store: Arc<VersionedStore>,
    physics: Arc<PhysicsRegistry>,
    audit: Option<Arc<AuditSystem>>,
    validator: Option<Validator>,
    controller: RetryController,
    registry: ProcessRegistry,
    heavy: HeavyStore,
    worker: Mutex<Option<Box<OutboxWorker>>>,
    backlog: Mutex<VecDeque<OutboxMessage>>,
    dispatcher: Mutex<Option<Arc<dyn ParallelDispatch>>>,
    next_tx_id: AtomicU64,
}

impl Engine {
    /// Create an engine over an initial context
    ///
    /// The context seeds the store as the world at version 0.
    pub fn new(context: ValueMap, config: EngineConfig) -> Result<Self> {
        let mode = if config.strict_cas {
            CasMode::Strict
        } else {
            CasMode::Smart
        };
        let store = Arc::new(VersionedStore::new(
            mode,
            Duration::from_millis(config.write_timeout_ms),
            config.commit_history,
        ));
        if !context.is_empty() {
            store.hydrate(context)?;
        }

        let physics = Arc::new(PhysicsRegistry::new(&config.namespaces));
        let (audit, validator) = match &config.audit {
            Some(audit_config) => {
                let audit = Arc::new(AuditSystem::new(audit_config.clone()));
                let validator = Validator::new(&audit_config.process_recipes, Arc::clone(&audit))?;
                (Some(audit), Some(validator))
            }
            None => (None, None),
        };
        let controller = RetryController::new(
            Arc::clone(&store),
            Duration::from_millis(config.ticket_ttl_ms),
            config.ticket_cancel_after,
        );
        let heavy = HeavyStore::with_capacity_mb(config.heap_size_mb);

        Ok(Engine {
            config,
            store,
            physics,
            audit,
            validator,
            controller,
            registry: ProcessRegistry::new(),
            heavy,
            worker: Mutex::new(None),
            backlog: Mutex::new(VecDeque::new()),
            dispatcher: Mutex::new(None),
            next_tx_id: AtomicU64::new(0),
        })
    }

    /// Create an engine from a JSON context object
    pub fn from_json(context: serde_json::Value, config: EngineConfig) -> Result<Self> {
        match Value::from_json(context) {
            Value::Map(map) => Engine::new(map, config),
            other => Err(TheusError::invalid_input(format!(
                "context must be an object, got {}",
                other.type_name()
            ))),
        }
    }

    /// Register a process under a contract
    pub fn register(
        &mut self,
        name: impl Into<String>,
        contract: Contract,
        handler: Box<ProcessFn>,
    ) -> Result<()> {
        self.registry.register(name, contract, handler)
    }

    /// Register an explicit physics annotation for a path
    pub fn annotate(&self, path: &str, annotation: FieldAnnotation) -> Result<()> {
        let path: ContextPath = path.parse()?;
        self.physics.register_override(&path, annotation);
        Ok(())
    }

    /// Snapshot of the committed state
    pub fn state(&self) -> StateSnapshot {
        self.store.current()
    }

    /// Current committed version
    pub fn version(&self) -> u64 {
        self.store.version()
    }

    /// The heavy-asset allocator
    pub fn heavy(&self) -> &HeavyStore {
        &self.heavy
    }

    /// The audit system, when configured
    pub fn audit(&self) -> Option<&Arc<AuditSystem>> {
        self.audit.as_ref()
    }

    /// Attach the outbox relay worker
    pub fn attach_worker(&self, worker: Box<OutboxWorker>) {
        *self.worker.lock() = Some(worker);
    }

    /// Attach the parallel-offload dispatcher
    pub fn attach_dispatcher(&self, dispatcher: Arc<dyn ParallelDispatch>) {
        *self.dispatcher.lock() = Some(dispatcher);
    }

    /// Deliver any backlogged outbox messages through the worker
    ///
    /// Messages commit into the backlog when no worker is attached; this
    /// drains them manually.
    pub fn process_outbox(&self) {
        let worker = self.worker.lock();
        let Some(worker) = worker.as_ref() else {
            return;
        };
        let mut backlog = self.backlog.lock();
        while let Some(message) = backlog.pop_front() {
            worker(&message);
        }
    }

    /// Direct CAS escape hatch
    ///
    /// Applies a raw data/heavy/signal patch under the engine's CAS mode,
    /// bypassing guards and contracts (host-level batching and tests).
    pub fn compare_and_swap(
        &self,
        expected_version: u64,
        data: Option<ValueMap>,
        heavy: Option<HashMap<String, HeavyHandle>>,
        signal: Option<ValueMap>,
        requester: Option<&str>,
    ) -> Result<u64> {
        let patch = data.map(|data| PendingPatch {
            data,
            deletions: Vec::new(),
        });
        self.store.compare_and_swap(
            expected_version,
            patch.as_ref(),
            heavy.as_ref(),
            signal.as_ref(),
            requester,
        )
    }

    /// Open a manual transaction scope
    pub fn transaction(&self) -> TransactionScope<'_> {
        self.scope(false)
    }

    /// Open a manual transaction scope with admin elevation
    pub fn admin_transaction(&self) -> TransactionScope<'_> {
        self.scope(true)
    }

    fn scope(&self, admin: bool) -> TransactionScope<'_> {
        let mut tx = Transaction::open(self.allocate_tx_id(), self.store.current());
        if admin {
            tx.begin_admin();
        }
        TransactionScope {
            engine: self,
            tx: RefCell::new(tx),
        }
    }

    /// Execute a registered process
    ///
    /// Returns the process's result value. See the module docs for the
    /// full pipeline; on failure the state version is unchanged, no outbox
    /// message is delivered, and no heavy handle is updated.
    pub fn execute(&self, name: &str, kwargs: ValueMap, opts: ExecuteOptions) -> Result<Value> {
        let process = self.registry.get(name)?;

        // Signals from the previous execution are consumed; this one
        // starts with a clean signal map.
        self.store.clear_signals()?;

        // One identity flows through the controller and the ticket gate;
        // it defaults to the process name so a granted ticket actually
        // admits the executions it was granted for.
        let identity = opts.requester.clone().unwrap_or_else(|| name.to_string());

        let mut carried_outbox = VecDeque::new();
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            if attempt > self.config.max_loops {
                return Err(TheusError::invalid_state(format!(
                    "retry loop ceiling ({}) reached for '{name}'",
                    self.config.max_loops
                )));
            }

            match self.attempt_execute(process, &kwargs, &mut carried_outbox, Some(&identity)) {
                Ok((result, version)) => {
                    self.controller.report_success(&identity);
                    if let Some(audit) = &self.audit {
                        audit.log_success(name);
                    }
                    tracing::debug!(process = name, version, attempt, "execution committed");
                    return Ok(result);
                }
                Err(e) if e.is_retryable() => {
                    let decision = self.controller.report_conflict(&identity);
                    if decision.should_retry && attempt <= opts.retries {
                        tracing::debug!(
                            process = name,
                            attempt,
                            wait_ms = decision.wait.as_millis() as u64,
                            "conflict, retrying"
                        );
                        std::thread::sleep(decision.wait);
                        continue;
                    }
                    return Err(e);
                }
                Err(e) => return Err(self.audit_failure(name, e)),
            }
        }
    }

    // =========================================================================
    // Internals
    // =========================================================================

    fn allocate_tx_id(&self) -> u64 {
        self.next_tx_id.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// One attempt: open, validate, run, build, gate, CAS
    fn attempt_execute(
        &self,
        process: &RegisteredProcess,
        kwargs: &ValueMap,
        carried_outbox: &mut VecDeque<OutboxMessage>,
        requester: Option<&str>,
    ) -> Result<(Value, u64)> {
        let contract = &process.contract;
        let mut tx = Transaction::open(self.allocate_tx_id(), self.store.current());
        tx.adopt_outbox(std::mem::take(carried_outbox));
        let tx_cell = RefCell::new(tx);

        if let Some(validator) = &self.validator {
            validator.validate_inputs(&process.name, kwargs)?;
        }

        let is_pure = contract.is_pure();
        // Take the dispatcher handle out of the lock before any user code
        // runs, so host code may call back into the engine
        let dispatcher = if contract.parallel {
            self.dispatcher.lock().clone()
        } else {
            None
        };
        let output = match dispatcher {
            Some(dispatcher) => dispatcher.dispatch(&process.name, kwargs, self.config.pool_size)?,
            None => {
                let guard = ContextGuard::new(
                    &tx_cell,
                    Arc::new(contract.inputs.clone()),
                    Arc::new(contract.outputs.clone()),
                    Arc::clone(&self.physics),
                    Arc::from(process.name.as_str()),
                    self.config.strict_guards,
                    is_pure,
                );
                (process.handler)(&guard, kwargs)?
            }
        };

        let mut tx = tx_cell.into_inner();
        let mut patch = tx.build_pending()?;
        let result = self.merge_declarative(&process.name, contract, output, &mut patch, &mut tx)?;

        if let Some(validator) = &self.validator {
            validator.validate_outputs(&process.name, &patch.data)?;
        }

        self.validate_contract_compliance(&process.name, contract, &tx, &patch)?;

        tx.mark_validating()?;
        match self.store.compare_and_swap(
            tx.base_version(),
            Some(&patch),
            Some(tx.pending_heavy()),
            Some(tx.pending_signal()),
            requester,
        ) {
            Ok(version) => {
                tx.mark_committed()?;
                self.deliver(tx.take_outbox());
                Ok((result, version))
            }
            Err(e) => {
                // Keep staged messages so a retry does not lose them
                *carried_outbox = tx.take_outbox();
                let _ = tx.mark_aborted(e.to_string());
                Err(e)
            }
        }
    }

    /// Fold a declarative return into the pending patch
    fn merge_declarative(
        &self,
        name: &str,
        contract: &Contract,
        output: ProcessOutput,
        patch: &mut PendingPatch,
        tx: &mut Transaction,
    ) -> Result<Value> {
        match output {
            ProcessOutput::Unit => Ok(Value::Null),
            ProcessOutput::Update(update) => {
                for (path, value) in update.assignments() {
                    self.apply_declarative(name, contract, patch, tx, &path, value)?;
                }
                Ok(Value::Null)
            }
            ProcessOutput::Value(value) => {
                let patterns = contract.outputs.patterns();
                if let Value::Map(entries) = &value {
                    // Map mode: keys matching declared outputs (full path or
                    // leaf) are assigned to those outputs
                    let mut matched = false;
                    for pattern in patterns {
                        if pattern.is_match_all() {
                            continue;
                        }
                        let full = pattern.as_str();
                        let leaf = pattern.prefix_path().leaf_key().unwrap_or(full);
                        if let Some(v) = entries.get(full).or_else(|| entries.get(leaf)) {
                            self.apply_declarative(name, contract, patch, tx, full, v.clone())?;
                            matched = true;
                        }
                    }
                    if matched {
                        return Ok(value);
                    }
                }
                // Single plain output: the return value is its new state
                if patterns.len() == 1 && !patterns[0].is_match_all() && !value.is_null() {
                    let target = patterns[0].as_str().to_string();
                    self.apply_declarative(name, contract, patch, tx, &target, value.clone())?;
                }
                Ok(value)
            }
        }
    }

    /// Permission-checked declarative assignment
    fn apply_declarative(
        &self,
        name: &str,
        contract: &Contract,
        patch: &mut PendingPatch,
        tx: &mut Transaction,
        path: &str,
        value: Value,
    ) -> Result<()> {
        let parsed: ContextPath = path.parse()?;
        if !contract.allows_output(&parsed) {
            return Err(TheusError::contract_violation(
                name,
                format!("declarative write to '{path}' is not declared in outputs"),
            ));
        }

        // `heavy.<key>` routes to the pending handle map
        if let Some(key) = path.strip_prefix("heavy.") {
            return match value {
                Value::Heavy(handle) => tx.stage_heavy(key, handle),
                other => Err(TheusError::invalid_input(format!(
                    "declarative heavy output '{path}' takes a handle, got {}",
                    other.type_name()
                ))),
            };
        }
        // Declarative writes obey zone physics like any other write
        let zone = self.physics.zone_of(&parsed);
        if zone == Zone::Constant {
            return Err(TheusError::permission_denied(
                path,
                "constant zone is read-only, admin included",
            ));
        }
        if !self
            .physics
            .effective_mask(&parsed, tx.is_admin())
            .allows(AccessOp::Update)
        {
            return Err(TheusError::permission_denied(
                path,
                format!("{zone} zone denies update"),
            ));
        }
        match zone {
            Zone::Signal => tx.stage_signal(parsed.to_string(), value),
            _ => {
                patch.retract_deletion(&parsed);
                map_set_at_path(&mut patch.data, &parsed, value)
            }
        }
    }

    /// Commit gate: every recorded write must be covered by the contract
    fn validate_contract_compliance(
        &self,
        name: &str,
        contract: &Contract,
        tx: &Transaction,
        patch: &PendingPatch,
    ) -> Result<()> {
        if contract.is_pure() {
            if !tx.delta_log().is_empty()
                || !patch.is_empty()
                || !tx.pending_heavy().is_empty()
                || !tx.pending_signal().is_empty()
            {
                return Err(TheusError::contract_violation(
                    name,
                    "pure process produced side effects",
                ));
            }
            return Ok(());
        }
        if !self.config.strict_guards {
            return Ok(());
        }
        for path in tx.delta_log().written_paths() {
            let top = path.top_level().unwrap_or_default();
            if self.physics.is_system(top) {
                continue;
            }
            if !contract.allows_output(path) {
                return Err(TheusError::contract_violation(
                    name,
                    format!(
                        "modified '{path}' which is not declared in outputs (declared: {:?})",
                        contract.outputs.as_strings()
                    ),
                ));
            }
        }
        Ok(())
    }

    /// Chain an audit failure record onto a failing execution
    ///
    /// The audit record itself can escalate (Block/Abort/Stop); when it
    /// does, the escalation is surfaced and the original error is logged
    /// alongside it.
    fn audit_failure(&self, name: &str, error: TheusError) -> TheusError {
        if let Some(audit) = &self.audit {
            if let Err(audit_error) = audit.log_fail(name, None, None) {
                tracing::error!(process = name, original = %error, "audit escalation on failure");
                return audit_error;
            }
        }
        error
    }

    fn deliver(&self, messages: VecDeque<OutboxMessage>) {
        if messages.is_empty() {
            return;
        }
        let worker = self.worker.lock();
        match worker.as_ref() {
            Some(worker) => {
                for message in &messages {
                    worker(message);
                }
            }
            None => self.backlog.lock().extend(messages),
        }
    }
}

/// Manual transaction scope (tests and host-driven batches)
///
/// Obtain a guard with [`TransactionScope::guard`], mutate, then
/// [`TransactionScope::commit`]. Dropping the scope without committing
/// discards everything.
pub struct TransactionScope<'e> {
    engine: &'e Engine,
    tx: RefCell<Transaction>,
}

impl TransactionScope<'_> {
    /// A wildcard-contract guard over this scope's transaction
    pub fn guard(&self) -> ContextGuard<'_> {
        ContextGuard::new(
            &self.tx,
            Arc::new(PatternSet::all()),
            Arc::new(PatternSet::all()),
            Arc::clone(&self.engine.physics),
            Arc::from("transaction"),
            self.engine.config.strict_guards,
            false,
        )
    }

    /// Base version this scope isolates against
    pub fn base_version(&self) -> u64 {
        self.tx.borrow().base_version()
    }

    /// Commit the scope's writes through the store's CAS
    pub fn commit(self) -> Result<u64> {
        let mut tx = self.tx.into_inner();
        let patch = tx.build_pending()?;
        tx.mark_validating()?;
        match self.engine.store.compare_and_swap(
            tx.base_version(),
            Some(&patch),
            Some(tx.pending_heavy()),
            Some(tx.pending_signal()),
            None,
        ) {
            Ok(version) => {
                tx.mark_committed()?;
                self.engine.deliver(tx.take_outbox());
                Ok(version)
            }
            Err(e) => {
                let _ = tx.mark_aborted(e.to_string());
                Err(e)
            }
        }
    }

    /// Discard the scope without committing
    pub fn rollback(self) {
        let mut tx = self.tx.into_inner();
        let _ = tx.mark_aborted("rolled back");
    }
}
