//! # Theus
//!
//! A runtime for process-oriented state management: a host registers
//! declarative "processes" (functions over a shared context) and the
//! runtime executes them under optimistic, versioned, capability-checked
//! transactions that roll back on error, detect conflicting concurrent
//! writes, and enforce per-field zone policies.
//!
//! # Quick Start
//!
//! ```
//! use theus::{Contract, Engine, EngineConfig, ExecuteOptions, Value, ValueMap};
//!
//! fn main() -> theus::Result<()> {
//!     let mut engine = Engine::from_json(
//!         serde_json::json!({"counter": 0, "log_events": []}),
//!         EngineConfig::default(),
//!     )?;
//!
//!     engine.register(
//!         "bump",
//!         Contract::new(["counter"], ["counter", "log_events"])?,
//!         Box::new(|ctx, _kwargs| {
//!             let n = ctx.get_or("counter", Value::Int(0))?.as_int().unwrap_or(0);
//!             ctx.set("counter", Value::Int(n + 1))?;
//!             ctx.append("log_events", Value::from("bumped"))?;
//!             Ok(().into())
//!         }),
//!     )?;
//!
//!     engine.execute("bump", ValueMap::new(), ExecuteOptions::default())?;
//!     assert_eq!(engine.version(), 1);
//!     assert_eq!(
//!         engine.state().get(&"counter".parse()?),
//!         Some(&Value::Int(1))
//!     );
//!     Ok(())
//! }
//! ```
//!
//! # Zones
//!
//! Every path is classified by its leaf key prefix. `log_` fields only
//! grow, `const_` fields never change (not even under admin elevation),
//! `internal_` fields are invisible outside admin scopes, `sig_` fields
//! live for exactly one execution hop.
//!
//! # Architecture
//!
//! | Crate | Role |
//! |-------|------|
//! | `theus-core` | values, paths, zones, contracts, errors, config |
//! | `theus-concurrency` | versioned store, transactions, delta log, retry controller |
//! | `theus-audit` | audit counters, ring buffer, rule validation |
//! | `theus-engine` | context guard, physics registry, engine facade |
//!
//! Only the surface re-exported here is considered stable.

pub use theus_audit::{AuditLogEntry, AuditSystem, Validator};
pub use theus_concurrency::{
    CasMode, DeltaEntry, DeltaLog, DeltaOp, OutboxMessage, PendingPatch, RetryController,
    RetryDecision, StateSnapshot, Transaction, TransactionStatus, VersionedStore,
    TICKET_THRESHOLD,
};
pub use theus_core::{
    deep_merge, AccessOp, AuditConfig, AuditLevel, CapabilityMask, Contract, ContextPath,
    EngineConfig, FieldAnnotation, HeavyHandle, HeavyStore, NamespaceConfig, NamespacePolicy,
    PathPattern, PathSegment, PatternSet, ProcessRecipe, Result, RuleSpec, Semantic, TheusError,
    Value, ValueMap, Zone,
};
pub use theus_engine::{
    AdminScope, ContextGuard, Engine, ExecuteOptions, ParallelDispatch, ProcessOutput,
    StateUpdate, TransactionScope,
};
