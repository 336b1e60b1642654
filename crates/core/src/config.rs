//! Engine configuration
//!
//! Typed configuration for the engine and its subsystems, deserializable
//! from JSON and overridable through environment variables:
//!
//! | Variable | Effect | Default |
//! |---|---|---|
//! | `THEUS_MAX_LOOPS` | Ceiling on engine retry-loop iterations | 10000 |
//! | `THEUS_HEAP_SIZE` | Heavy-asset heap capacity (MB) | 512 |
//! | `THEUS_POOL_SIZE` | Size hint surfaced to the parallel dispatcher | 4 |

use crate::zone::CapabilityMask;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Severity level of an audit rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuditLevel {
    /// Count failures, take no action
    #[serde(alias = "C")]
    Count,
    /// Warn at the minimum threshold, fail the execution at the maximum
    #[serde(alias = "B")]
    Block,
    /// Warn at the minimum threshold, stop the pipeline at the maximum
    #[serde(alias = "A")]
    Abort,
    /// Halt immediately on the first failure
    #[serde(alias = "S")]
    Stop,
}

/// A single validation rule from an audit recipe
///
/// All predicates are optional; absent predicates pass. Numeric bounds
/// apply to int/float values, length bounds to strings, lists, maps and
/// sets, the regex to strings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct RuleSpec {
    /// Field name (for inputs) or dotted path (for outputs)
    pub field: String,
    /// Minimum numeric value (inclusive)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    /// Maximum numeric value (inclusive)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
    /// Required value
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eq: Option<serde_json::Value>,
    /// Forbidden value
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub neq: Option<serde_json::Value>,
    /// Minimum length
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_len: Option<usize>,
    /// Maximum length
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_len: Option<usize>,
    /// Pattern the (string) value must match
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub regex: Option<String>,
    /// Severity override for this rule
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub level: Option<AuditLevel>,
    /// Message recorded in the audit log on violation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Per-rule maximum-threshold override
    #[serde(default, skip_serializing_if = "Option::is_none", alias = "max_threshold")]
    pub threshold_max: Option<u64>,
}

/// Validation rules for one process
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ProcessRecipe {
    /// Rules applied to call arguments before execution
    #[serde(default)]
    pub inputs: Vec<RuleSpec>,
    /// Rules applied to the pending patch before commit
    #[serde(default)]
    pub outputs: Vec<RuleSpec>,
}

/// Audit subsystem configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditConfig {
    /// Default severity for failures without a per-rule override
    #[serde(default = "default_audit_level")]
    pub level: AuditLevel,
    /// Failure count at which a warning is emitted
    #[serde(default = "default_threshold_min")]
    pub threshold_min: u64,
    /// Failure count at which the level's action fires
    #[serde(default = "default_threshold_max")]
    pub threshold_max: u64,
    /// Clear a key's counter when the process succeeds
    #[serde(default = "default_true")]
    pub reset_on_success: bool,
    /// Ring buffer capacity
    #[serde(default = "default_ring_capacity")]
    pub ring_capacity: usize,
    /// Per-process validation rules
    #[serde(default)]
    pub process_recipes: HashMap<String, ProcessRecipe>,
}

fn default_audit_level() -> AuditLevel {
    AuditLevel::Block
}

fn default_threshold_min() -> u64 {
    1
}

fn default_threshold_max() -> u64 {
    3
}

fn default_true() -> bool {
    true
}

fn default_ring_capacity() -> usize {
    256
}

impl Default for AuditConfig {
    fn default() -> Self {
        AuditConfig {
            level: default_audit_level(),
            threshold_min: default_threshold_min(),
            threshold_max: default_threshold_max(),
            reset_on_success: true,
            ring_capacity: default_ring_capacity(),
            process_recipes: HashMap::new(),
        }
    }
}

/// Access policy for one isolation namespace
///
/// Intersected with the contract when a guard is built for paths under the
/// namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamespacePolicy {
    /// Permit reads
    #[serde(default = "default_true")]
    pub allow_read: bool,
    /// Permit in-place updates
    #[serde(default = "default_true")]
    pub allow_update: bool,
    /// Permit appends
    #[serde(default = "default_true")]
    pub allow_append: bool,
    /// Permit deletes
    #[serde(default)]
    pub allow_delete: bool,
}

impl Default for NamespacePolicy {
    fn default() -> Self {
        NamespacePolicy {
            allow_read: true,
            allow_update: true,
            allow_append: true,
            allow_delete: false,
        }
    }
}

impl NamespacePolicy {
    /// Convert the policy to a capability mask
    pub fn to_mask(&self) -> CapabilityMask {
        let mut mask = CapabilityMask::NONE;
        if self.allow_read {
            mask = mask | CapabilityMask::READ;
        }
        if self.allow_update {
            mask = mask | CapabilityMask::UPDATE;
        }
        if self.allow_append {
            mask = mask | CapabilityMask::APPEND;
        }
        if self.allow_delete {
            mask = mask | CapabilityMask::DELETE;
        }
        mask
    }
}

/// A registered isolation namespace
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamespaceConfig {
    /// Top-level key this namespace governs
    pub name: String,
    /// Access policy
    #[serde(default)]
    pub policy: NamespacePolicy,
}

impl NamespaceConfig {
    /// Namespace with the default policy
    pub fn new(name: impl Into<String>) -> Self {
        NamespaceConfig {
            name: name.into(),
            policy: NamespacePolicy::default(),
        }
    }
}

/// Top-level engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// When true, contract violations raise; when false they only log
    #[serde(default = "default_true")]
    pub strict_guards: bool,
    /// True = strict CAS, false = smart CAS
    #[serde(default)]
    pub strict_cas: bool,
    /// Timeout on the store's exclusive write lock (milliseconds)
    #[serde(default = "default_write_timeout_ms")]
    pub write_timeout_ms: u64,
    /// Hard ceiling on retry-loop iterations, regardless of caller budget
    #[serde(default = "default_max_loops")]
    pub max_loops: u32,
    /// Heavy-asset heap capacity in megabytes
    #[serde(default = "default_heap_mb")]
    pub heap_size_mb: usize,
    /// Size hint surfaced to the parallel dispatcher
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
    /// Commit-history window used by smart CAS disjointness proofs
    #[serde(default = "default_commit_history")]
    pub commit_history: usize,
    /// Priority-ticket wall-clock TTL (milliseconds)
    #[serde(default = "default_ticket_ttl_ms")]
    pub ticket_ttl_ms: u64,
    /// Failed commits after which a held ticket is cancelled
    #[serde(default = "default_ticket_cancel_after")]
    pub ticket_cancel_after: u32,
    /// Registered isolation namespaces
    #[serde(default)]
    pub namespaces: Vec<NamespaceConfig>,
    /// Audit configuration; None disables the audit/validation pipeline
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audit: Option<AuditConfig>,
}

fn default_write_timeout_ms() -> u64 {
    5000
}

fn default_max_loops() -> u32 {
    10_000
}

fn default_heap_mb() -> usize {
    512
}

fn default_pool_size() -> usize {
    4
}

fn default_commit_history() -> usize {
    64
}

fn default_ticket_ttl_ms() -> u64 {
    5000
}

fn default_ticket_cancel_after() -> u32 {
    3
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            strict_guards: true,
            strict_cas: false,
            write_timeout_ms: default_write_timeout_ms(),
            max_loops: default_max_loops(),
            heap_size_mb: default_heap_mb(),
            pool_size: default_pool_size(),
            commit_history: default_commit_history(),
            ticket_ttl_ms: default_ticket_ttl_ms(),
            ticket_cancel_after: default_ticket_cancel_after(),
            namespaces: Vec::new(),
            audit: None,
        }
    }
}

impl EngineConfig {
    /// Defaults with environment overrides applied
    pub fn from_env() -> Self {
        let mut config = EngineConfig::default();
        config.apply_env();
        config
    }

    /// Apply `THEUS_*` environment overrides to this configuration
    pub fn apply_env(&mut self) {
        if let Some(v) = env_parse::<u32>("THEUS_MAX_LOOPS") {
            self.max_loops = v;
        }
        if let Some(v) = env_parse::<usize>("THEUS_HEAP_SIZE") {
            self.heap_size_mb = v;
        }
        if let Some(v) = env_parse::<usize>("THEUS_POOL_SIZE") {
            self.pool_size = v;
        }
    }

    /// Register a namespace, replacing any existing entry of the same name
    pub fn with_namespace(mut self, ns: NamespaceConfig) -> Self {
        self.namespaces.retain(|n| n.name != ns.name);
        self.namespaces.push(ns);
        self
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}
