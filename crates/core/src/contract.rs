//! Process contracts
//!
//! A contract declares what a process may touch: input patterns (readable
//! paths), output patterns (writable paths), its semantic class, and
//! whether it is eligible for offload to a parallel pool.

use crate::error::Result;
use crate::path::{ContextPath, PatternSet};
use serde::{Deserialize, Serialize};

/// Semantic class of a process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Semantic {
    /// Pure function over its declared inputs; may not mutate state
    Pure,
    /// Ordinary effectful process
    Effect,
}

/// Declared access surface of a registered process
///
/// # Examples
///
/// ```
/// use theus_core::contract::Contract;
///
/// let contract = Contract::new(["domain.user"], ["domain.user.balance"]).unwrap();
/// assert!(contract.allows_input(&"domain.user.name".parse().unwrap()));
/// assert!(contract.allows_output(&"domain.user.balance".parse().unwrap()));
/// assert!(!contract.allows_output(&"domain.other".parse().unwrap()));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Contract {
    /// Patterns the process may read
    pub inputs: PatternSet,
    /// Patterns the process may write
    pub outputs: PatternSet,
    /// Semantic class
    pub semantic: Semantic,
    /// Eligible for offload to an external pool
    pub parallel: bool,
}

impl Contract {
    /// Create an effectful contract from pattern strings
    pub fn new<I, O, S1, S2>(inputs: I, outputs: O) -> Result<Self>
    where
        I: IntoIterator<Item = S1>,
        O: IntoIterator<Item = S2>,
        S1: AsRef<str>,
        S2: AsRef<str>,
    {
        Ok(Contract {
            inputs: PatternSet::from_strs(inputs)?,
            outputs: PatternSet::from_strs(outputs)?,
            semantic: Semantic::Effect,
            parallel: false,
        })
    }

    /// Create a pure contract (inputs only, no outputs)
    pub fn pure<I, S>(inputs: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Ok(Contract {
            inputs: PatternSet::from_strs(inputs)?,
            outputs: PatternSet::default(),
            semantic: Semantic::Pure,
            parallel: false,
        })
    }

    /// Mark the process as eligible for parallel offload
    pub fn with_parallel(mut self) -> Self {
        self.parallel = true;
        self
    }

    /// True if the contract permits reading the path
    pub fn allows_input(&self, path: &ContextPath) -> bool {
        self.inputs.matches(path)
    }

    /// True if the contract permits writing the path
    pub fn allows_output(&self, path: &ContextPath) -> bool {
        self.outputs.matches(path)
    }

    /// True for PURE semantics
    pub fn is_pure(&self) -> bool {
        self.semantic == Semantic::Pure
    }
}
