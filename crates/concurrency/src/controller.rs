//! Retry / priority-ticket controller
//!
//! Decides, after a CAS conflict or `SystemBusy`, whether an execution
//! should retry and how long to wait. Backoff is exponential with full
//! jitter, capped at one second:
//!
//! ```text
//! wait_ms = uniform(0, min(1000, 50 * 2^(retry - 1)))
//! ```
//!
//! A process that loses five CAS races in a row is chronically starved; the
//! controller grants it a **priority ticket** through the store, which makes
//! every other requester's CAS fail with `SystemBusy` until the holder
//! commits once, exhausts its failure allowance, or the wall-clock TTL
//! expires.

use crate::store::VersionedStore;
use dashmap::DashMap;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;

/// Consecutive conflicts after which a ticket is granted
pub const TICKET_THRESHOLD: u32 = 5;

/// Cap on the jittered backoff window
pub const MAX_BACKOFF: Duration = Duration::from_millis(1000);

/// Base backoff doubled per retry
pub const BASE_BACKOFF_MS: u64 = 50;

/// What the engine should do about a conflict
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryDecision {
    /// Retry (subject to the caller's remaining budget)
    pub should_retry: bool,
    /// How long to sleep before the retry
    pub wait: Duration,
    /// A priority ticket was granted to this requester
    pub ticket_granted: bool,
}

/// Shared conflict bookkeeping
///
/// The counter table is keyed by process name and safe for concurrent
/// executions; the store owns the actual ticket gate.
pub struct RetryController {
    store: Arc<VersionedStore>,
    conflicts: DashMap<String, u32>,
    ticket_ttl: Duration,
    ticket_cancel_after: u32,
}

impl RetryController {
    /// Create a controller over a store
    pub fn new(store: Arc<VersionedStore>, ticket_ttl: Duration, ticket_cancel_after: u32) -> Self {
        RetryController {
            store,
            conflicts: DashMap::new(),
            ticket_ttl,
            ticket_cancel_after,
        }
    }

    /// Record a conflict for `name` and decide the retry
    ///
    /// Every conflict increments the consecutive-loss counter. At
    /// [`TICKET_THRESHOLD`] losses the requester is escalated to a priority
    /// ticket. The decision always advises a retry - the engine bounds the
    /// loop with the caller's retry budget and the configured loop ceiling.
    pub fn report_conflict(&self, name: &str) -> RetryDecision {
        let attempt = {
            let mut entry = self.conflicts.entry(name.to_string()).or_insert(0);
            *entry += 1;
            *entry
        };

        // A losing ticket holder burns its failure allowance; cancellation
        // demotes it back to ordinary contention (fresh counter)
        let mut cancelled = false;
        if self.store.ticket_holder().as_deref() == Some(name) {
            cancelled = self.store.note_ticket_failure(name);
            if cancelled {
                self.conflicts.insert(name.to_string(), 0);
            }
        }

        let mut ticket_granted = false;
        if !cancelled && attempt >= TICKET_THRESHOLD && self.store.ticket_holder().is_none() {
            self.store
                .grant_ticket(name, self.ticket_ttl, self.ticket_cancel_after);
            ticket_granted = true;
        }

        let wait = backoff_with_jitter(attempt);
        tracing::debug!(
            process = name,
            attempt,
            wait_ms = wait.as_millis() as u64,
            ticket_granted,
            "conflict reported"
        );
        RetryDecision {
            should_retry: true,
            wait,
            ticket_granted,
        }
    }

    /// Clear the counter for `name` and release its ticket, if held
    pub fn report_success(&self, name: &str) {
        self.conflicts.remove(name);
        self.store.release_ticket(name);
    }

    /// Current consecutive-conflict count for `name`
    pub fn conflict_count(&self, name: &str) -> u32 {
        self.conflicts.get(name).map(|c| *c).unwrap_or(0)
    }
}

/// Exponential backoff with full jitter, capped at [`MAX_BACKOFF`]
fn backoff_with_jitter(attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(16);
    let raw_ms = BASE_BACKOFF_MS.saturating_mul(1u64 << exp);
    let ceiling = raw_ms.min(MAX_BACKOFF.as_millis() as u64);
    let jittered = rand::thread_rng().gen_range(0..=ceiling);
    Duration::from_millis(jittered)
}
