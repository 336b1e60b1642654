//! Engine integration suite
//!
//! End-to-end scenarios through `Engine::execute`: zone enforcement,
//! contract gating, outbox atomicity, audit thresholds, retry behavior
//! under contention, and property checks over the guard.

mod audit_pipeline;
mod cas_modes;
mod heavy_assets;
mod properties;
mod retries;

use theus::{ContextPath, Engine, EngineConfig, Value, ValueMap};

/// Parse a path fixture
pub fn path(s: &str) -> ContextPath {
    s.parse().unwrap()
}

/// Engine over a JSON context with default configuration
pub fn engine_with(json: serde_json::Value) -> Engine {
    Engine::from_json(json, EngineConfig::default()).unwrap()
}

/// Kwargs fixture
pub fn kwargs(json: serde_json::Value) -> ValueMap {
    match Value::from_json(json) {
        Value::Map(m) => m,
        _ => panic!("fixture must be an object"),
    }
}
