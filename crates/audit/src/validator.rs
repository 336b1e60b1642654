//! Rule-driven validation of inputs and pending outputs
//!
//! The validator reads a static recipe (`process name → input/output rules`)
//! and enforces it through the audit system: a violated rule writes a ring
//! entry and calls `log_fail` with the rule's level and threshold overrides,
//! which is what escalates repeated violations into `AuditBlock`/`AuditAbort`.
//!
//! Audit keys follow the `"<process>:input:<field>"` /
//! `"<process>:output:<path>"` convention.

use crate::system::AuditSystem;
use regex::Regex;
use std::collections::HashMap;
use std::sync::Arc;
use theus_core::config::{ProcessRecipe, RuleSpec};
use theus_core::error::{Result, TheusError};
use theus_core::path::ContextPath;
use theus_core::tree::map_get_at_path;
use theus_core::value::{Value, ValueMap};

struct CompiledRule {
    spec: RuleSpec,
    regex: Option<Regex>,
}

struct CompiledRecipe {
    inputs: Vec<CompiledRule>,
    outputs: Vec<CompiledRule>,
}

/// Recipe-driven input/output gate
pub struct Validator {
    recipes: HashMap<String, CompiledRecipe>,
    audit: Arc<AuditSystem>,
}

impl Validator {
    /// Compile a recipe book against an audit system
    ///
    /// # Errors
    /// `InvalidInput` when a rule's regex fails to compile.
    pub fn new(recipes: &HashMap<String, ProcessRecipe>, audit: Arc<AuditSystem>) -> Result<Self> {
        let mut compiled = HashMap::new();
        for (name, recipe) in recipes {
            compiled.insert(
                name.clone(),
                CompiledRecipe {
                    inputs: compile_rules(name, &recipe.inputs)?,
                    outputs: compile_rules(name, &recipe.outputs)?,
                },
            );
        }
        Ok(Validator {
            recipes: compiled,
            audit,
        })
    }

    /// The audit system violations feed into
    pub fn audit(&self) -> &Arc<AuditSystem> {
        &self.audit
    }

    /// Check call arguments against the process's input rules
    ///
    /// Absent fields are skipped - rules gate values, not presence.
    pub fn validate_inputs(&self, process: &str, kwargs: &ValueMap) -> Result<()> {
        let Some(recipe) = self.recipes.get(process) else {
            return Ok(());
        };
        for rule in &recipe.inputs {
            let Some(value) = kwargs.get(&rule.spec.field) else {
                continue;
            };
            self.check_rule(process, &format!("input:{}", rule.spec.field), value, rule)?;
        }
        Ok(())
    }

    /// Check the pending patch against the process's output rules
    ///
    /// Rule fields are dotted paths resolved inside the patch data; paths
    /// the patch does not touch are skipped.
    pub fn validate_outputs(&self, process: &str, pending: &ValueMap) -> Result<()> {
        let Some(recipe) = self.recipes.get(process) else {
            return Ok(());
        };
        for rule in &recipe.outputs {
            let Ok(path) = rule.spec.field.parse::<ContextPath>() else {
                continue;
            };
            let Some(value) = map_get_at_path(pending, &path) else {
                continue;
            };
            self.check_rule(process, &format!("output:{}", rule.spec.field), value, rule)?;
        }
        Ok(())
    }

    fn check_rule(
        &self,
        process: &str,
        key_suffix: &str,
        value: &Value,
        rule: &CompiledRule,
    ) -> Result<()> {
        let Some(violation) = evaluate(value, rule) else {
            return Ok(());
        };

        let audit_key = format!("{process}:{key_suffix}");
        let message = rule.spec.message.clone().unwrap_or_else(|| violation.clone());
        self.audit.log(&audit_key, format!("VIOLATION: {message}"));
        tracing::debug!(key = %audit_key, %violation, "validation rule violated");
        self.audit
            .log_fail(&audit_key, rule.spec.level, rule.spec.threshold_max)
    }
}

fn compile_rules(process: &str, specs: &[RuleSpec]) -> Result<Vec<CompiledRule>> {
    specs
        .iter()
        .map(|spec| {
            let regex = match &spec.regex {
                Some(pattern) => Some(Regex::new(pattern).map_err(|e| {
                    TheusError::invalid_input(format!(
                        "bad regex in rule '{}' of '{process}': {e}",
                        spec.field
                    ))
                })?),
                None => None,
            };
            Ok(CompiledRule {
                spec: spec.clone(),
                regex,
            })
        })
        .collect()
}

/// Evaluate all predicates; the last violated predicate wins
fn evaluate(value: &Value, rule: &CompiledRule) -> Option<String> {
    let spec = &rule.spec;
    let mut violation = None;

    // Numeric checks (ints and floats only)
    if let Some(n) = numeric(value) {
        if let Some(min) = spec.min {
            if n < min {
                violation = Some(format!("value {n} < min {min}"));
            }
        }
        if violation.is_none() {
            if let Some(max) = spec.max {
                if n > max {
                    violation = Some(format!("value {n} > max {max}"));
                }
            }
        }
        if violation.is_none() {
            if let Some(eq) = &spec.eq {
                let expected = Value::from_json(eq.clone());
                if numeric(&expected).map_or(true, |e| e != n) {
                    violation = Some(format!("value {n} != required"));
                }
            }
        }
        if violation.is_none() {
            if let Some(neq) = &spec.neq {
                let forbidden = Value::from_json(neq.clone());
                if numeric(&forbidden) == Some(n) {
                    violation = Some(format!("value {n} is forbidden"));
                }
            }
        }
    }

    // Length checks (strings and containers)
    if let Some(len) = length(value) {
        if let Some(min_len) = spec.min_len {
            if len < min_len {
                violation = Some(format!("length {len} < min_len {min_len}"));
            }
        }
        if let Some(max_len) = spec.max_len {
            if len > max_len {
                violation = Some(format!("length {len} > max_len {max_len}"));
            }
        }
    }

    // Regex check (strings; anchored at the start, like a match)
    if let (Some(regex), Some(s)) = (&rule.regex, value.as_str()) {
        let matched = regex.find(s).map_or(false, |m| m.start() == 0);
        if !matched {
            violation = Some(format!("'{s}' failed regex '{}'", regex.as_str()));
        }
    }

    violation
}

fn numeric(value: &Value) -> Option<f64> {
    match value {
        Value::Int(_) | Value::Float(_) => value.as_float(),
        _ => None,
    }
}

fn length(value: &Value) -> Option<usize> {
    match value {
        Value::String(s) => Some(s.chars().count()),
        Value::List(l) => Some(l.len()),
        Value::Map(m) => Some(m.len()),
        Value::Set(s) => Some(s.len()),
        _ => None,
    }
}
