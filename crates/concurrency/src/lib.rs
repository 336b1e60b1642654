//! Concurrency layer for Theus
//!
//! This crate implements the optimistic transaction machinery:
//! - VersionedStore: canonical state + version counter, strict/smart CAS,
//!   priority-ticket gate
//! - Transaction: delta log, shadow cache, pending heavy/signal maps, outbox
//! - ShadowCache: copy-on-first-write isolation
//! - DeltaLog / PendingPatch: the record of intended writes and the patch
//!   replayed from it
//! - RetryController: full-jitter backoff and priority-ticket escalation

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod controller;
pub mod delta;
pub mod outbox;
pub mod shadow;
pub mod store;
pub mod transaction;

pub use controller::{RetryController, RetryDecision, TICKET_THRESHOLD};
pub use delta::{DeltaEntry, DeltaLog, DeltaOp, PendingPatch};
pub use outbox::OutboxMessage;
pub use shadow::ShadowCache;
pub use store::{CasMode, StateSnapshot, VersionedStore};
pub use transaction::{Transaction, TransactionStatus};
