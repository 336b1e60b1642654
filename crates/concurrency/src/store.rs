//! Versioned state store
//!
//! Holds the canonical data / heavy / signal maps and the monotonic version
//! counter, and serializes commits through [`VersionedStore::compare_and_swap`].
//!
//! ## CAS modes
//!
//! - **Strict**: the patch applies only when `expected_version` equals the
//!   current version. Any mismatch fails.
//! - **Smart** (default): on a version mismatch, the store consults its
//!   commit history for the top-level keys changed in
//!   `(expected_version, current_version]`. If that set is disjoint from the
//!   submitted patch's top-level keys, the patch deep-merges against the
//!   *current* state and a new version is minted; otherwise the CAS fails
//!   naming the overlapping keys.
//!
//! ## Thread safety
//!
//! The CAS path takes a short exclusive lock (with a caller-visible
//! timeout); read snapshots clone `Arc`s under the read lock and are
//! wait-free afterwards. Without the exclusive lock, a validate-then-apply
//! race could let two commits both observe a clean history and interleave
//! their merges.

use crate::delta::PendingPatch;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use theus_core::error::{Result, TheusError};
use theus_core::heavy::HeavyHandle;
use theus_core::path::ContextPath;
use theus_core::tree::{map_delete_at_path, map_get_at_path};
use theus_core::value::{merged_map, Value, ValueMap};

/// Conflict-detection mode, chosen at engine construction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CasMode {
    /// Reject every version mismatch
    Strict,
    /// Merge disjoint-key commits across versions
    Smart,
}

/// Immutable snapshot of the store at one version
///
/// Cloning a snapshot is cheap (`Arc` bumps); the underlying maps never
/// mutate after publication.
#[derive(Debug, Clone)]
pub struct StateSnapshot {
    version: u64,
    data: Arc<ValueMap>,
    heavy: Arc<HashMap<String, HeavyHandle>>,
    signal: Arc<ValueMap>,
}

impl StateSnapshot {
    /// Version this snapshot was taken at
    pub fn version(&self) -> u64 {
        self.version
    }

    /// The data tree
    pub fn data(&self) -> &ValueMap {
        &self.data
    }

    /// The heavy-asset map
    pub fn heavy(&self) -> &HashMap<String, HeavyHandle> {
        &self.heavy
    }

    /// The signal map
    pub fn signal(&self) -> &ValueMap {
        &self.signal
    }

    /// Read a value in the data tree by path
    pub fn get(&self, path: &ContextPath) -> Option<&Value> {
        map_get_at_path(&self.data, path)
    }

    /// Read a heavy handle by name
    pub fn get_heavy(&self, name: &str) -> Option<&HeavyHandle> {
        self.heavy.get(name)
    }

    /// Read a signal by key
    pub fn get_signal(&self, key: &str) -> Option<&Value> {
        self.signal.get(key)
    }
}

/// Top-level keys changed by one commit
///
/// The store keeps a bounded ring of these so smart CAS can prove
/// disjointness for expected versions inside the window.
#[derive(Debug, Clone)]
struct CommitRecord {
    version: u64,
    touched: BTreeSet<String>,
}

/// Priority-ticket grant
///
/// While held, CAS from any other requester fails with `SystemBusy`. The
/// grant ends when the holder commits once, fails `cancel_after` times, or
/// the wall-clock TTL expires (dead-worker safety).
#[derive(Debug, Clone)]
struct Ticket {
    holder: String,
    granted_at: Instant,
    ttl: Duration,
    failures: u32,
    cancel_after: u32,
}

impl Ticket {
    fn expired(&self) -> bool {
        self.granted_at.elapsed() > self.ttl
    }
}

struct StoreInner {
    version: u64,
    data: Arc<ValueMap>,
    heavy: Arc<HashMap<String, HeavyHandle>>,
    signal: Arc<ValueMap>,
    history: VecDeque<CommitRecord>,
}

/// The canonical state holder
pub struct VersionedStore {
    inner: RwLock<StoreInner>,
    mode: CasMode,
    write_timeout: Duration,
    history_cap: usize,
    ticket: Mutex<Option<Ticket>>,
}

impl VersionedStore {
    /// Create a store at version 0 with empty maps
    pub fn new(mode: CasMode, write_timeout: Duration, history_cap: usize) -> Self {
        VersionedStore {
            inner: RwLock::new(StoreInner {
                version: 0,
                data: Arc::new(ValueMap::new()),
                heavy: Arc::new(HashMap::new()),
                signal: Arc::new(ValueMap::new()),
                history: VecDeque::new(),
            }),
            mode,
            write_timeout,
            history_cap: history_cap.max(1),
            ticket: Mutex::new(None),
        }
    }

    /// Create a store with default timeout and history window
    pub fn with_mode(mode: CasMode) -> Self {
        VersionedStore::new(mode, Duration::from_millis(5000), 64)
    }

    /// The configured CAS mode
    pub fn mode(&self) -> CasMode {
        self.mode
    }

    /// Current version
    pub fn version(&self) -> u64 {
        self.inner.read().version
    }

    /// Take an immutable snapshot of the current state
    pub fn current(&self) -> StateSnapshot {
        let inner = self.inner.read();
        StateSnapshot {
            version: inner.version,
            data: Arc::clone(&inner.data),
            heavy: Arc::clone(&inner.heavy),
            signal: Arc::clone(&inner.signal),
        }
    }

    /// Seed initial state in place
    ///
    /// Hydration is only valid while the store is still at version 0 and
    /// does not mint a version - seeded state is the world as of v0.
    pub fn hydrate(&self, data: ValueMap) -> Result<()> {
        let mut inner = self.write_locked()?;
        if inner.version != 0 {
            return Err(TheusError::invalid_state(format!(
                "hydrate requires version 0, store is at {}",
                inner.version
            )));
        }
        inner.data = Arc::new(data);
        Ok(())
    }

    /// Atomic compare-and-swap commit
    ///
    /// Applies the data patch (merge + tombstones), heavy replacements and
    /// signal writes as one commit, minting exactly one new version.
    ///
    /// # Arguments
    /// * `expected_version` - version the caller built its patch against
    /// * `patch` - data-tree patch (touched subtrees + tombstones)
    /// * `heavy_patch` - heavy handles to replace, by name
    /// * `signal_patch` - signal keys to write
    /// * `requester` - identity for the priority-ticket gate
    ///
    /// # Errors
    /// - `SystemBusy` - ticket held by someone else, or write-lock timeout
    /// - `StrictCasMismatch` - strict mode, version moved
    /// - `CasVersionMismatch` - smart mode, overlapping top-level keys (or
    ///   the expected version fell outside the history window)
    pub fn compare_and_swap(
        &self,
        expected_version: u64,
        patch: Option<&PendingPatch>,
        heavy_patch: Option<&HashMap<String, HeavyHandle>>,
        signal_patch: Option<&ValueMap>,
        requester: Option<&str>,
    ) -> Result<u64> {
        self.check_ticket(requester)?;
        let mut inner = self.write_locked()?;

        let current = inner.version;
        if current != expected_version {
            match self.mode {
                CasMode::Strict => {
                    return Err(TheusError::StrictCasMismatch {
                        expected: expected_version,
                        current,
                    });
                }
                CasMode::Smart => {
                    if expected_version > current {
                        return Err(TheusError::cas_mismatch(expected_version, current, vec![]));
                    }
                    let submitted = patch.map(PendingPatch::top_level_keys).unwrap_or_default();
                    let overlap = self.conflicting_keys(&inner, expected_version, &submitted)?;
                    if !overlap.is_empty() {
                        tracing::debug!(
                            expected = expected_version,
                            current,
                            keys = ?overlap,
                            "smart CAS rejected overlapping commit"
                        );
                        return Err(TheusError::cas_mismatch(
                            expected_version,
                            current,
                            overlap.into_iter().collect(),
                        ));
                    }
                }
            }
        }

        // Apply against the current state (deep merge, then tombstones)
        let mut touched = BTreeSet::new();
        if let Some(patch) = patch {
            if !patch.is_empty() {
                let mut new_data = merged_map(&inner.data, &patch.data);
                for path in &patch.deletions {
                    map_delete_at_path(&mut new_data, path);
                }
                touched = patch.changed_keys();
                inner.data = Arc::new(new_data);
            }
        }
        if let Some(heavy_patch) = heavy_patch {
            if !heavy_patch.is_empty() {
                let mut new_heavy = (*inner.heavy).clone();
                for (name, handle) in heavy_patch {
                    new_heavy.insert(name.clone(), handle.clone());
                }
                inner.heavy = Arc::new(new_heavy);
            }
        }
        if let Some(signal_patch) = signal_patch {
            if !signal_patch.is_empty() {
                let mut new_signal = (*inner.signal).clone();
                for (key, value) in signal_patch {
                    new_signal.insert(key.clone(), value.clone());
                }
                inner.signal = Arc::new(new_signal);
            }
        }

        inner.version += 1;
        let new_version = inner.version;
        inner.history.push_back(CommitRecord {
            version: new_version,
            touched,
        });
        while inner.history.len() > self.history_cap {
            inner.history.pop_front();
        }
        drop(inner);

        // A committing holder releases its grant
        self.release_ticket_if_holder(requester);

        tracing::debug!(version = new_version, requester, "commit applied");
        Ok(new_version)
    }

    /// Wipe the signal map (ephemeral zone)
    ///
    /// Signals written by one execution survive until the next execution
    /// opens; clearing does not mint a version.
    pub fn clear_signals(&self) -> Result<()> {
        let mut inner = self.write_locked()?;
        if !inner.signal.is_empty() {
            inner.signal = Arc::new(ValueMap::new());
        }
        Ok(())
    }

    // =========================================================================
    // Priority tickets
    // =========================================================================

    /// Grant exclusive commit access to a requester
    ///
    /// Replaces any existing grant (the controller only escalates one
    /// chronic loser at a time).
    pub fn grant_ticket(&self, holder: impl Into<String>, ttl: Duration, cancel_after: u32) {
        let holder = holder.into();
        tracing::info!(holder = %holder, ?ttl, "priority ticket granted");
        *self.ticket.lock() = Some(Ticket {
            holder,
            granted_at: Instant::now(),
            ttl,
            failures: 0,
            cancel_after,
        });
    }

    /// Release the ticket if `holder` owns it
    pub fn release_ticket(&self, holder: &str) {
        let mut ticket = self.ticket.lock();
        if ticket.as_ref().is_some_and(|t| t.holder == holder) {
            tracing::info!(holder, "priority ticket released");
            *ticket = None;
        }
    }

    /// Record a failed commit by the holder; cancels the grant once the
    /// failure allowance is used up. Returns true if the ticket was
    /// cancelled.
    pub fn note_ticket_failure(&self, holder: &str) -> bool {
        let mut ticket = self.ticket.lock();
        if let Some(t) = ticket.as_mut() {
            if t.holder == holder {
                t.failures += 1;
                if t.failures >= t.cancel_after {
                    tracing::warn!(holder, failures = t.failures, "priority ticket cancelled");
                    *ticket = None;
                    return true;
                }
            }
        }
        false
    }

    /// Current ticket holder, if any (expired grants are collected here)
    pub fn ticket_holder(&self) -> Option<String> {
        let mut ticket = self.ticket.lock();
        if ticket.as_ref().is_some_and(Ticket::expired) {
            tracing::warn!("priority ticket expired, force-released");
            *ticket = None;
        }
        ticket.as_ref().map(|t| t.holder.clone())
    }

    fn check_ticket(&self, requester: Option<&str>) -> Result<()> {
        if let Some(holder) = self.ticket_holder() {
            if requester != Some(holder.as_str()) {
                return Err(TheusError::busy(format!(
                    "priority ticket held by '{holder}'"
                )));
            }
        }
        Ok(())
    }

    fn release_ticket_if_holder(&self, requester: Option<&str>) {
        if let Some(requester) = requester {
            self.release_ticket(requester);
        }
    }

    // =========================================================================
    // Internals
    // =========================================================================

    fn write_locked(&self) -> Result<parking_lot::RwLockWriteGuard<'_, StoreInner>> {
        self.inner.try_write_for(self.write_timeout).ok_or_else(|| {
            TheusError::busy(format!(
                "store write lock not acquired within {:?}",
                self.write_timeout
            ))
        })
    }

    /// Keys of the submitted patch that collide with commits in
    /// `(expected, current]`
    ///
    /// Fails when the history window no longer covers the range - without
    /// full coverage disjointness cannot be proven, so the commit is
    /// rejected conservatively.
    fn conflicting_keys(
        &self,
        inner: &StoreInner,
        expected: u64,
        submitted: &BTreeSet<String>,
    ) -> Result<BTreeSet<String>> {
        let covered = inner
            .history
            .front()
            .map(|r| r.version <= expected + 1)
            .unwrap_or(false);
        if !covered {
            return Err(TheusError::cas_mismatch(
                expected,
                inner.version,
                submitted.iter().cloned().collect(),
            ));
        }
        let mut overlap = BTreeSet::new();
        for record in inner.history.iter().filter(|r| r.version > expected) {
            for key in record.touched.intersection(submitted) {
                overlap.insert(key.clone());
            }
        }
        Ok(overlap)
    }
}
