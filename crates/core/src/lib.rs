//! Core types for the Theus runtime
//!
//! This crate defines the foundational types used throughout the system:
//! - Value: tagged variant over everything the state tree can hold
//! - ContextPath / PathPattern: dotted paths and contract patterns
//! - Zone / CapabilityMask: zone physics and per-path capabilities
//! - HeavyHandle / HeavyStore: refcounted large-asset handles
//! - Contract: declared access surface of a process
//! - TheusError: the error taxonomy exposed at the engine boundary
//! - EngineConfig: typed configuration with environment overrides

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod contract;
pub mod error;
pub mod heavy;
pub mod path;
pub mod tree;
pub mod value;
pub mod zone;

// Re-export commonly used types
pub use config::{
    AuditConfig, AuditLevel, EngineConfig, NamespaceConfig, NamespacePolicy, ProcessRecipe,
    RuleSpec,
};
pub use contract::{Contract, Semantic};
pub use error::{Result, TheusError};
pub use heavy::{HeavyHandle, HeavyStore};
pub use path::{ContextPath, PathParseError, PathPattern, PathSegment, PatternSet};
pub use value::{deep_merge, merged_map, CloneError, Value, ValueMap, MAX_VALUE_DEPTH};
pub use zone::{AccessOp, CapabilityMask, FieldAnnotation, Zone};
