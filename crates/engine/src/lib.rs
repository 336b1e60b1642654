//! Engine layer for Theus
//!
//! This crate assembles the runtime surface:
//! - PhysicsRegistry: annotation overrides + namespace policies
//! - ContextGuard: the capability-checked proxy handed to user code
//! - ProcessRegistry: name → contract + handler, with the PURE firewall
//! - Engine: the `execute` facade (validation, commit, retry, outbox)

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod engine;
pub mod guard;
pub mod physics;
pub mod registry;

pub use engine::{Engine, ExecuteOptions, OutboxWorker, ParallelDispatch, TransactionScope};
pub use guard::{AdminScope, ContextGuard};
pub use physics::{PhysicsRegistry, SYSTEM_KEYS};
pub use registry::{ProcessFn, ProcessOutput, ProcessRegistry, RegisteredProcess, StateUpdate};
