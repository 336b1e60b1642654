//! Audit system: violation counters and the ring buffer
//!
//! A process-wide, multi-producer tracker. Counters are keyed by arbitrary
//! string (by convention `"<process>"` or `"<process>:input:<field>"`); a
//! fixed-capacity ring buffer keeps the most recent log entries.
//!
//! ## Severity levels
//!
//! | Level | At `threshold_min` | At `threshold_max` |
//! |---|---|---|
//! | Count | - | increment only |
//! | Block | warning | `AuditBlock` (execution fails) |
//! | Abort | warning | `AuditAbort` (pipeline stops) |
//! | Stop  | `AuditStop` on first failure | `AuditStop` on first failure |

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::VecDeque;
use theus_core::config::{AuditConfig, AuditLevel};
use theus_core::error::{Result, TheusError};

/// One entry in the audit ring buffer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditLogEntry {
    /// When the entry was recorded
    pub timestamp: DateTime<Utc>,
    /// Counter key the entry belongs to
    pub key: String,
    /// Entry text
    pub message: String,
}

/// Shared audit state
///
/// Safe for concurrent executions: the counter table is sharded, the ring
/// buffer sits behind a short mutex.
pub struct AuditSystem {
    config: AuditConfig,
    counters: DashMap<String, u64>,
    ring: Mutex<VecDeque<AuditLogEntry>>,
}

impl AuditSystem {
    /// Create an audit system from its configuration
    pub fn new(config: AuditConfig) -> Self {
        AuditSystem {
            counters: DashMap::new(),
            ring: Mutex::new(VecDeque::with_capacity(config.ring_capacity.min(1024))),
            config,
        }
    }

    /// The active configuration
    pub fn config(&self) -> &AuditConfig {
        &self.config
    }

    /// Write a generic message to the ring buffer
    pub fn log(&self, key: &str, message: impl Into<String>) {
        let mut ring = self.ring.lock();
        if ring.len() == self.config.ring_capacity {
            ring.pop_front();
        }
        ring.push_back(AuditLogEntry {
            timestamp: Utc::now(),
            key: key.to_string(),
            message: message.into(),
        });
    }

    /// Record a success for `key`
    ///
    /// Clears the failure counter when `reset_on_success` is set.
    pub fn log_success(&self, key: &str) {
        if self.config.reset_on_success {
            self.counters.remove(key);
        }
    }

    /// Record a failure for `key` and apply threshold actions
    ///
    /// `level` and `threshold_max` override the configured defaults for
    /// this call (used by per-rule settings).
    ///
    /// # Errors
    /// - `AuditStop` at level Stop, on the first failure
    /// - `AuditBlock` / `AuditAbort` once the counter reaches the maximum
    ///   threshold
    pub fn log_fail(
        &self,
        key: &str,
        level: Option<AuditLevel>,
        threshold_max: Option<u64>,
    ) -> Result<()> {
        let count = {
            let mut entry = self.counters.entry(key.to_string()).or_insert(0);
            *entry += 1;
            *entry
        };

        let level = level.unwrap_or(self.config.level);
        let threshold_max = threshold_max.unwrap_or(self.config.threshold_max);

        match level {
            AuditLevel::Count => Ok(()),
            AuditLevel::Stop => {
                self.log(key, format!("STOP after failure #{count}"));
                Err(TheusError::AuditStop {
                    key: key.to_string(),
                })
            }
            AuditLevel::Block | AuditLevel::Abort => {
                // The maximum threshold is a tolerance: the action fires on
                // the failure that exceeds it
                if count > threshold_max {
                    self.log(
                        key,
                        format!("threshold {threshold_max} reached (count {count})"),
                    );
                    if level == AuditLevel::Block {
                        Err(TheusError::AuditBlock {
                            key: key.to_string(),
                            count,
                        })
                    } else {
                        Err(TheusError::AuditAbort {
                            key: key.to_string(),
                            count,
                        })
                    }
                } else {
                    if count >= self.config.threshold_min {
                        tracing::warn!(key, count, threshold_max, "audit warning");
                        self.log(key, format!("warning: failure #{count}"));
                    }
                    Ok(())
                }
            }
        }
    }

    /// Current failure count for `key`
    pub fn get_count(&self, key: &str) -> u64 {
        self.counters.get(key).map(|c| *c).unwrap_or(0)
    }

    /// Snapshot of the ring buffer contents, oldest first
    pub fn get_logs(&self) -> Vec<AuditLogEntry> {
        self.ring.lock().iter().cloned().collect()
    }

    /// Number of entries currently in the ring buffer
    pub fn ring_buffer_len(&self) -> usize {
        self.ring.lock().len()
    }
}
