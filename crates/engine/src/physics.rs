//! Zone physics and policy registry
//!
//! Process-wide map of explicit field annotations (`Mutable`, `AppendOnly`,
//! `Immutable`) plus the registered namespace policies. Guards consult this
//! registry to compute the effective capability mask for a path:
//!
//! 1. an explicit annotation for the exact path wins over the prefix rule,
//!    but never over the CONSTANT ceiling;
//! 2. otherwise the zone ceiling applies (lifted under admin elevation,
//!    except CONSTANT);
//! 3. the result is intersected with the namespace policy of the path's
//!    top-level key, when one is registered.
//!
//! A few top-level keys are system plumbing rather than state; paths under
//! them bypass zone physics and contracts entirely.

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use theus_core::config::{NamespaceConfig, NamespacePolicy};
use theus_core::path::ContextPath;
use theus_core::zone::{CapabilityMask, FieldAnnotation, Zone};

/// Top-level keys exempt from zone physics and contract checks
pub const SYSTEM_KEYS: &[&str] = &["outbox", "local"];

/// Shared physics/policy state
pub struct PhysicsRegistry {
    overrides: RwLock<FxHashMap<String, CapabilityMask>>,
    namespaces: FxHashMap<String, NamespacePolicy>,
}

impl PhysicsRegistry {
    /// Build a registry from the configured namespaces
    pub fn new(namespaces: &[NamespaceConfig]) -> Self {
        PhysicsRegistry {
            overrides: RwLock::new(FxHashMap::default()),
            namespaces: namespaces
                .iter()
                .map(|ns| (ns.name.clone(), ns.policy))
                .collect(),
        }
    }

    /// Register an explicit annotation for a fully-qualified path
    pub fn register_override(&self, path: &ContextPath, annotation: FieldAnnotation) {
        self.overrides
            .write()
            .insert(path.to_string(), annotation.mask());
    }

    /// Drop every registered annotation (engine re-initialization)
    pub fn clear_overrides(&self) {
        self.overrides.write().clear();
    }

    /// Annotation mask for an exact path, if registered
    pub fn override_for(&self, path: &ContextPath) -> Option<CapabilityMask> {
        self.overrides.read().get(&path.to_string()).copied()
    }

    /// True when the top-level key is system plumbing (ungoverned)
    pub fn is_system(&self, top: &str) -> bool {
        SYSTEM_KEYS.contains(&top)
    }

    /// Namespace policy mask for a top-level key, when registered
    pub fn namespace_mask(&self, top: &str) -> Option<CapabilityMask> {
        self.namespaces.get(top).map(NamespacePolicy::to_mask)
    }

    /// Zone of a path (by its leaf key prefix)
    pub fn zone_of(&self, path: &ContextPath) -> Zone {
        path.leaf_key().map(Zone::of_key).unwrap_or(Zone::Data)
    }

    /// Effective capability mask for a path
    ///
    /// Combines annotation override, zone ceiling (with admin elevation)
    /// and namespace policy. CONSTANT never rises above read.
    pub fn effective_mask(&self, path: &ContextPath, admin: bool) -> CapabilityMask {
        let zone = self.zone_of(path);
        let mut mask = match self.override_for(path) {
            Some(annotated) if zone != Zone::Constant => annotated,
            Some(_) => Zone::Constant.ceiling(),
            None => zone.ceiling_for(admin),
        };
        if let Some(top) = path.top_level() {
            if let Some(ns_mask) = self.namespace_mask(top) {
                mask = mask & ns_mask;
            }
        }
        mask
    }
}
