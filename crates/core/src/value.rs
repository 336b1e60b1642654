//! Value types for the state tree
//!
//! This module defines:
//! - [`Value`]: tagged variant over every shape the state tree can hold
//!   (scalars, sequences, mappings, sets, heavy handles)
//! - Checked deep cloning (isolation-safe detachment with a depth cap)
//! - Deep merge, the patch semantics used by smart CAS
//! - Conversions to/from `serde_json::Value`
//!
//! # Nesting Limit
//!
//! Recursive operations (clone, merge, depth measurement) are bounded by
//! [`MAX_VALUE_DEPTH`]. Owned trees cannot form reference cycles, so the
//! depth cap is what protects the shadowing machinery from runaway
//! recursion; exceeding it is treated as a refused clone.

use crate::heavy::HeavyHandle;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

/// Maximum nesting depth of a value tree (100 levels)
///
/// Checked during shadow detachment and merges.
pub const MAX_VALUE_DEPTH: usize = 100;

/// Mapping node type used throughout the state tree
///
/// `BTreeMap` keeps iteration deterministic, which matters for replaying
/// delta logs and for stable conflict diagnostics.
pub type ValueMap = BTreeMap<String, Value>;

/// Error type for refused deep clones
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CloneError {
    /// Value nesting exceeds [`MAX_VALUE_DEPTH`]
    #[error("value nesting depth exceeds maximum of {max} levels")]
    NestingTooDeep {
        /// Maximum allowed depth
        max: usize,
    },
}

/// Unified value type for the state tree
///
/// The guard dispatches on the tag to decide which destructive methods are
/// applicable: `append`/`pop`/`sort`/`reverse` on sequences, `update`/
/// `popitem` on mappings, `insert`/`remove` on sets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    /// Null value
    Null,
    /// Boolean value
    Bool(bool),
    /// 64-bit signed integer
    Int(i64),
    /// 64-bit floating point
    Float(f64),
    /// UTF-8 string
    String(String),
    /// Ordered sequence of values
    List(Vec<Value>),
    /// Mapping from string keys to values
    Map(ValueMap),
    /// Set of string members
    Set(BTreeSet<String>),
    /// Opaque large-asset handle (never deep-copied)
    Heavy(HeavyHandle),
}

impl Value {
    /// An empty mapping
    pub fn map() -> Self {
        Value::Map(ValueMap::new())
    }

    /// An empty sequence
    pub fn list() -> Self {
        Value::List(Vec::new())
    }

    /// An empty set
    pub fn set() -> Self {
        Value::Set(BTreeSet::new())
    }

    /// Tag name, used in diagnostics and guard dispatch
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::String(_) => "string",
            Value::List(_) => "list",
            Value::Map(_) => "map",
            Value::Set(_) => "set",
            Value::Heavy(_) => "heavy",
        }
    }

    /// True for list / map / set
    pub fn is_container(&self) -> bool {
        matches!(self, Value::List(_) | Value::Map(_) | Value::Set(_))
    }

    /// True for Null
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Borrow as integer
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Borrow as float (integers widen)
    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    /// Borrow as bool
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Borrow as string slice
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Borrow as sequence
    pub fn as_list(&self) -> Option<&Vec<Value>> {
        match self {
            Value::List(l) => Some(l),
            _ => None,
        }
    }

    /// Borrow as mutable sequence
    pub fn as_list_mut(&mut self) -> Option<&mut Vec<Value>> {
        match self {
            Value::List(l) => Some(l),
            _ => None,
        }
    }

    /// Borrow as mapping
    pub fn as_map(&self) -> Option<&ValueMap> {
        match self {
            Value::Map(m) => Some(m),
            _ => None,
        }
    }

    /// Borrow as mutable mapping
    pub fn as_map_mut(&mut self) -> Option<&mut ValueMap> {
        match self {
            Value::Map(m) => Some(m),
            _ => None,
        }
    }

    /// Borrow as set
    pub fn as_set(&self) -> Option<&BTreeSet<String>> {
        match self {
            Value::Set(s) => Some(s),
            _ => None,
        }
    }

    /// Borrow as mutable set
    pub fn as_set_mut(&mut self) -> Option<&mut BTreeSet<String>> {
        match self {
            Value::Set(s) => Some(s),
            _ => None,
        }
    }

    /// Borrow as heavy handle
    pub fn as_heavy(&self) -> Option<&HeavyHandle> {
        match self {
            Value::Heavy(h) => Some(h),
            _ => None,
        }
    }

    /// Maximum nesting depth of this value
    ///
    /// Scalars and heavy handles have depth 0; each container level adds 1.
    pub fn nesting_depth(&self) -> usize {
        match self {
            Value::List(items) => 1 + items.iter().map(Value::nesting_depth).max().unwrap_or(0),
            Value::Map(entries) => {
                1 + entries
                    .values()
                    .map(Value::nesting_depth)
                    .max()
                    .unwrap_or(0)
            }
            Value::Set(_) => 1,
            _ => 0,
        }
    }

    /// Detach a deep copy of this value for shadowing
    ///
    /// Heavy handles are copied by refcount bump, never by payload copy.
    /// Nesting beyond [`MAX_VALUE_DEPTH`] refuses the clone - the caller
    /// must fail its transaction rather than share the original.
    pub fn deep_clone(&self) -> Result<Value, CloneError> {
        self.deep_clone_at(0)
    }

    fn deep_clone_at(&self, depth: usize) -> Result<Value, CloneError> {
        if depth > MAX_VALUE_DEPTH {
            return Err(CloneError::NestingTooDeep {
                max: MAX_VALUE_DEPTH,
            });
        }
        match self {
            Value::List(items) => {
                let cloned = items
                    .iter()
                    .map(|v| v.deep_clone_at(depth + 1))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Value::List(cloned))
            }
            Value::Map(entries) => {
                let cloned = entries
                    .iter()
                    .map(|(k, v)| Ok((k.clone(), v.deep_clone_at(depth + 1)?)))
                    .collect::<Result<ValueMap, CloneError>>()?;
                Ok(Value::Map(cloned))
            }
            // Scalars, sets of scalars, and heavy handles are flat copies;
            // a heavy "copy" is a refcount bump.
            other => Ok(other.clone()),
        }
    }

    /// Convert from a `serde_json::Value`
    ///
    /// JSON arrays become lists, objects become maps. There is no JSON shape
    /// for sets or heavy handles; those only arise natively.
    pub fn from_json(json: serde_json::Value) -> Value {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Value::Int(i)
                } else {
                    Value::Float(n.as_f64().unwrap_or(0.0))
                }
            }
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(items) => {
                Value::List(items.into_iter().map(Value::from_json).collect())
            }
            serde_json::Value::Object(entries) => Value::Map(
                entries
                    .into_iter()
                    .map(|(k, v)| (k, Value::from_json(v)))
                    .collect(),
            ),
        }
    }

    /// Convert to a `serde_json::Value`
    ///
    /// Sets render as sorted arrays; heavy handles render as a descriptor
    /// object (`{"$heavy": name, "len": n}`) - payloads never serialize.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Int(i) => serde_json::Value::Number((*i).into()),
            Value::Float(f) => serde_json::Number::from_f64(*f)
                .map_or(serde_json::Value::Null, serde_json::Value::Number),
            Value::String(s) => serde_json::Value::String(s.clone()),
            Value::List(items) => {
                serde_json::Value::Array(items.iter().map(Value::to_json).collect())
            }
            Value::Map(entries) => serde_json::Value::Object(
                entries
                    .iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect(),
            ),
            Value::Set(members) => serde_json::Value::Array(
                members
                    .iter()
                    .map(|m| serde_json::Value::String(m.clone()))
                    .collect(),
            ),
            Value::Heavy(handle) => serde_json::json!({
                "$heavy": handle.name(),
                "len": handle.len(),
            }),
        }
    }
}

// From implementations for common types

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v as i64)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl From<HeavyHandle> for Value {
    fn from(v: HeavyHandle) -> Self {
        Value::Heavy(v)
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(v: Vec<T>) -> Self {
        Value::List(v.into_iter().map(Into::into).collect())
    }
}

impl From<ValueMap> for Value {
    fn from(v: ValueMap) -> Self {
        Value::Map(v)
    }
}

// Display renders the JSON projection; heavy handles show as descriptors.
impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_json())
    }
}

// =============================================================================
// Deep merge
// =============================================================================

/// Merge a patch into a base value, in place
///
/// Semantics (the contract smart CAS relies on):
/// - When both sides are mappings, merge key by key, recursing.
/// - An **empty** patch sub-map means "no change at this subtree" - it marks
///   the key as touched for conflict detection but never overwrites data.
/// - In every other case the patch value replaces the base value.
///
/// Applying the same patch twice yields the same result as applying it once.
pub fn deep_merge(base: &mut Value, patch: &Value) {
    match (base, patch) {
        (Value::Map(base_map), Value::Map(patch_map)) => {
            for (key, patch_val) in patch_map {
                match base_map.get_mut(key) {
                    Some(base_val) => deep_merge(base_val, patch_val),
                    None => {
                        // Empty sub-maps are markers, not writes
                        if !is_empty_map(patch_val) {
                            base_map.insert(key.clone(), patch_val.clone());
                        }
                    }
                }
            }
        }
        (base_slot, patch_val) => {
            if !is_empty_map(patch_val) {
                *base_slot = patch_val.clone();
            }
        }
    }
}

/// Merge a patch map into a base map, returning the merged copy
pub fn merged_map(base: &ValueMap, patch: &ValueMap) -> ValueMap {
    let mut out = Value::Map(base.clone());
    deep_merge(&mut out, &Value::Map(patch.clone()));
    match out {
        Value::Map(m) => m,
        _ => unreachable!("merging maps yields a map"),
    }
}

fn is_empty_map(value: &Value) -> bool {
    matches!(value, Value::Map(m) if m.is_empty())
}
