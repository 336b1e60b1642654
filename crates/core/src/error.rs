//! Error types for the Theus runtime
//!
//! This module defines the unified error taxonomy exposed at the engine
//! boundary. We use `thiserror` for automatic `Display` and `Error` trait
//! implementations.
//!
//! ## Error Categories
//!
//! - **Contract**: a process touched state outside its declared patterns
//! - **Permission**: zone physics or capability mask denied an operation
//! - **Concurrency**: CAS version mismatch, priority-ticket busy, isolation
//!   failure during shadowing
//! - **Validation**: rule or schema violation on inputs/outputs
//! - **Audit**: counter thresholds reached (Block / Abort / Stop)
//!
//! ## Usage
//!
//! ```ignore
//! match engine.execute("transfer", kwargs, Default::default()) {
//!     Err(e) if e.is_retryable() => { /* back off and retry */ }
//!     Err(TheusError::AuditBlock { key, count }) => {
//!         println!("blocked by audit rule {key} after {count} failures");
//!     }
//!     Err(e) => return Err(e),
//!     Ok(result) => { /* success */ }
//! }
//! ```

use crate::path::PathParseError;
use thiserror::Error;

/// Result type alias for Theus operations
pub type Result<T> = std::result::Result<T, TheusError>;

/// Unified error type for all Theus operations
#[derive(Debug, Error)]
pub enum TheusError {
    // =========================================================================
    // Contract Errors
    // =========================================================================
    /// A process read or wrote a path not covered by its contract.
    ///
    /// Fatal to the execution; never retried.
    #[error("contract violation in '{process}': {reason}")]
    ContractViolation {
        /// Name of the offending process
        process: String,
        /// What was accessed and why it was denied
        reason: String,
    },

    // =========================================================================
    // Permission / Zone Errors
    // =========================================================================
    /// Zone physics or the capability mask denied an operation.
    ///
    /// Examples: writing a `const_` field (even under admin elevation),
    /// popping from a `log_` list, updating a `meta_` field.
    #[error("permission denied on '{path}': {reason}")]
    PermissionDenied {
        /// Full dotted path of the denied access
        path: String,
        /// Which rule fired
        reason: String,
    },

    // =========================================================================
    // Concurrency Errors
    // =========================================================================
    /// Smart CAS rejected the patch because a concurrent commit touched
    /// overlapping top-level keys.
    ///
    /// This error is **retryable** - a fresh transaction against the current
    /// version may succeed.
    #[error("CAS Version Mismatch: expected {expected}, current {current}, conflicting keys {conflicting_keys:?}")]
    CasVersionMismatch {
        /// Version the transaction was built against
        expected: u64,
        /// Version found at commit time
        current: u64,
        /// Top-level keys touched by both sides
        conflicting_keys: Vec<String>,
    },

    /// Strict CAS rejected the patch because the version moved at all.
    ///
    /// Retryable, like [`TheusError::CasVersionMismatch`].
    #[error("Strict CAS Mismatch: expected {expected}, current {current}")]
    StrictCasMismatch {
        /// Version the transaction was built against
        expected: u64,
        /// Version found at commit time
        current: u64,
    },

    /// The store is gated by a priority ticket held by another requester,
    /// or the store's write lock could not be acquired within the timeout.
    ///
    /// Retryable.
    #[error("System Busy: {reason}")]
    SystemBusy {
        /// Ticket holder or timeout description
        reason: String,
    },

    /// A value could not be detached into the shadow cache.
    ///
    /// Shadowing never silently falls back to sharing the original value;
    /// the whole transaction fails instead.
    #[error("transaction isolation failure at '{path}': {reason}")]
    TransactionIsolation {
        /// Path whose subtree failed to clone
        path: String,
        /// Why the clone was refused
        reason: String,
    },

    // =========================================================================
    // Validation Errors
    // =========================================================================
    /// A schema check on the pending patch failed.
    #[error("schema violation: {message}")]
    SchemaViolation {
        /// Description of the failed check
        message: String,
    },

    /// Invalid input parameters (bad path, malformed pattern, bad config).
    #[error("invalid input: {message}")]
    InvalidInput {
        /// What is wrong with the input
        message: String,
    },

    // =========================================================================
    // Audit Errors
    // =========================================================================
    /// Audit counter for `key` crossed its maximum threshold at level Block.
    ///
    /// The current execution fails; the counter persists until a success
    /// resets it.
    #[error("audit block on '{key}' (count {count})")]
    AuditBlock {
        /// Audit counter key
        key: String,
        /// Failure count at the time of the block
        count: u64,
    },

    /// Audit counter for `key` crossed its maximum threshold at level Abort.
    ///
    /// The pipeline should stop; this is not retryable.
    #[error("audit abort on '{key}' (count {count})")]
    AuditAbort {
        /// Audit counter key
        key: String,
        /// Failure count at the time of the abort
        count: u64,
    },

    /// Audit level Stop: the first failure halts immediately.
    #[error("audit stop on '{key}'")]
    AuditStop {
        /// Audit counter key
        key: String,
    },

    /// Soft audit warning. Normally logged, not raised; the variant exists
    /// so hosts can surface warnings as values when they choose to.
    #[error("audit warning on '{key}': {message}")]
    AuditWarning {
        /// Audit counter key
        key: String,
        /// Warning text
        message: String,
    },

    // =========================================================================
    // Lifecycle / Resource Errors
    // =========================================================================
    /// An operation was attempted on a transaction in the wrong state.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// `execute` was called with an unregistered process name.
    #[error("process not found: '{0}'")]
    ProcessNotFound(String),

    /// A resource limit was exceeded (heavy heap, value depth, patch size).
    #[error("capacity exceeded: {resource} (limit {limit}, requested {requested})")]
    CapacityExceeded {
        /// Which resource ran out
        resource: String,
        /// The configured limit
        limit: usize,
        /// What was requested
        requested: usize,
    },

    /// A path string failed to parse.
    #[error(transparent)]
    Path(#[from] PathParseError),
}

impl TheusError {
    // =========================================================================
    // Constructors
    // =========================================================================

    /// Create a ContractViolation error
    pub fn contract_violation(process: impl Into<String>, reason: impl Into<String>) -> Self {
        TheusError::ContractViolation {
            process: process.into(),
            reason: reason.into(),
        }
    }

    /// Create a PermissionDenied error
    pub fn permission_denied(path: impl Into<String>, reason: impl Into<String>) -> Self {
        TheusError::PermissionDenied {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Create a CasVersionMismatch error
    pub fn cas_mismatch(expected: u64, current: u64, conflicting_keys: Vec<String>) -> Self {
        TheusError::CasVersionMismatch {
            expected,
            current,
            conflicting_keys,
        }
    }

    /// Create a SystemBusy error
    pub fn busy(reason: impl Into<String>) -> Self {
        TheusError::SystemBusy {
            reason: reason.into(),
        }
    }

    /// Create a TransactionIsolation error
    pub fn isolation(path: impl Into<String>, reason: impl Into<String>) -> Self {
        TheusError::TransactionIsolation {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Create a SchemaViolation error
    pub fn schema(message: impl Into<String>) -> Self {
        TheusError::SchemaViolation {
            message: message.into(),
        }
    }

    /// Create an InvalidInput error
    pub fn invalid_input(message: impl Into<String>) -> Self {
        TheusError::InvalidInput {
            message: message.into(),
        }
    }

    /// Create an InvalidState error
    pub fn invalid_state(message: impl Into<String>) -> Self {
        TheusError::InvalidState(message.into())
    }

    /// Create a CapacityExceeded error
    pub fn capacity_exceeded(resource: impl Into<String>, limit: usize, requested: usize) -> Self {
        TheusError::CapacityExceeded {
            resource: resource.into(),
            limit,
            requested,
        }
    }

    // =========================================================================
    // Classification Methods
    // =========================================================================

    /// Check if this is a CAS conflict (smart or strict)
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            TheusError::CasVersionMismatch { .. } | TheusError::StrictCasMismatch { .. }
        )
    }

    /// Check if the store refused access because of a ticket or lock timeout
    pub fn is_busy(&self) -> bool {
        matches!(self, TheusError::SystemBusy { .. })
    }

    /// Check if this error may succeed on retry
    ///
    /// Only concurrency outcomes are retryable. Audit verdicts are
    /// deterministic: retrying re-triggers them, so they fail fast.
    pub fn is_retryable(&self) -> bool {
        self.is_conflict() || self.is_busy()
    }

    /// Check if this is an audit threshold error (Block / Abort / Stop)
    pub fn is_audit(&self) -> bool {
        matches!(
            self,
            TheusError::AuditBlock { .. }
                | TheusError::AuditAbort { .. }
                | TheusError::AuditStop { .. }
        )
    }

    /// Check if this is a contract or permission error
    pub fn is_access_denied(&self) -> bool {
        matches!(
            self,
            TheusError::ContractViolation { .. } | TheusError::PermissionDenied { .. }
        )
    }
}
