//! Audit pipeline end to end
//!
//! Validator rules feed the audit system; thresholds escalate into
//! Block/Abort/Stop across executions; the ring buffer records the trail.

use crate::{kwargs, path};
use theus::{
    AuditConfig, AuditLevel, Contract, Engine, EngineConfig, ExecuteOptions, TheusError, Value,
    ValueMap,
};

fn engine_with_recipe(recipe: serde_json::Value, level: AuditLevel, threshold_max: u64) -> Engine {
    let mut config = EngineConfig::default();
    config.audit = Some(AuditConfig {
        level,
        threshold_min: 1,
        threshold_max,
        process_recipes: serde_json::from_value(recipe).unwrap(),
        ..Default::default()
    });
    Engine::from_json(serde_json::json!({"balance": 100}), config).unwrap()
}

fn register_transfer(engine: &mut Engine) {
    engine
        .register(
            "transfer",
            Contract::new(["balance"], ["balance"]).unwrap(),
            Box::new(|ctx, kw| {
                let amount = kw.get("amount").and_then(Value::as_int).unwrap_or(0);
                let balance = ctx.get_or("balance", Value::Int(0))?.as_int().unwrap_or(0);
                ctx.set("balance", Value::Int(balance - amount))?;
                Ok(().into())
            }),
        )
        .unwrap();
}

#[test]
fn stop_level_halts_on_first_violation() {
    let mut engine = engine_with_recipe(
        serde_json::json!({
            "transfer": {"inputs": [{"field": "amount", "max": 50, "level": "S"}]}
        }),
        AuditLevel::Count,
        100,
    );
    register_transfer(&mut engine);

    let err = engine
        .execute(
            "transfer",
            kwargs(serde_json::json!({"amount": 1000})),
            ExecuteOptions::default(),
        )
        .unwrap_err();
    assert!(matches!(err, TheusError::AuditStop { .. }));
    assert_eq!(engine.version(), 0);
    assert_eq!(
        engine.state().get(&path("balance")),
        Some(&Value::Int(100))
    );
}

#[test]
fn abort_level_escalates_after_tolerance() {
    let mut engine = engine_with_recipe(
        serde_json::json!({
            "transfer": {"inputs": [{"field": "amount", "max": 50, "level": "A", "threshold_max": 1}]}
        }),
        AuditLevel::Count,
        100,
    );
    register_transfer(&mut engine);

    // First violation is tolerated and the execution commits
    engine
        .execute(
            "transfer",
            kwargs(serde_json::json!({"amount": 1000})),
            ExecuteOptions::default(),
        )
        .unwrap();
    assert_eq!(engine.version(), 1);

    // Second violation aborts the pipeline
    let err = engine
        .execute(
            "transfer",
            kwargs(serde_json::json!({"amount": 1000})),
            ExecuteOptions::default(),
        )
        .unwrap_err();
    assert!(matches!(err, TheusError::AuditAbort { .. }));
    assert_eq!(engine.version(), 1);
}

#[test]
fn output_rules_gate_the_pending_patch() {
    let mut engine = engine_with_recipe(
        serde_json::json!({
            "transfer": {"outputs": [{"field": "balance", "min": 0, "level": "B", "threshold_max": 0}]}
        }),
        AuditLevel::Count,
        100,
    );
    register_transfer(&mut engine);

    // Within bounds: commits
    engine
        .execute(
            "transfer",
            kwargs(serde_json::json!({"amount": 30})),
            ExecuteOptions::default(),
        )
        .unwrap();
    assert_eq!(engine.state().get(&path("balance")), Some(&Value::Int(70)));

    // Overdraft: the pending balance is negative, the output gate blocks
    // before the CAS and nothing commits
    let err = engine
        .execute(
            "transfer",
            kwargs(serde_json::json!({"amount": 500})),
            ExecuteOptions::default(),
        )
        .unwrap_err();
    assert!(matches!(err, TheusError::AuditBlock { .. }));
    assert_eq!(engine.state().get(&path("balance")), Some(&Value::Int(70)));
    assert_eq!(engine.version(), 1);
}

#[test]
fn ring_buffer_keeps_the_violation_trail() {
    let mut engine = engine_with_recipe(
        serde_json::json!({
            "transfer": {"inputs": [
                {"field": "amount", "max": 50, "message": "amount too large"}
            ]}
        }),
        AuditLevel::Count,
        100,
    );
    register_transfer(&mut engine);

    for _ in 0..3 {
        engine
            .execute(
                "transfer",
                kwargs(serde_json::json!({"amount": 1000})),
                ExecuteOptions::default(),
            )
            .unwrap();
    }

    let audit = engine.audit().unwrap();
    assert_eq!(audit.get_count("transfer:input:amount"), 3);
    let logs = audit.get_logs();
    assert!(logs.len() >= 3);
    assert!(logs
        .iter()
        .any(|entry| entry.message.contains("amount too large")));
    assert!(audit.ring_buffer_len() >= 3);
}

#[test]
fn success_resets_process_counter() {
    let mut engine = engine_with_recipe(serde_json::json!({}), AuditLevel::Block, 100);
    register_transfer(&mut engine);
    let audit = engine.audit().unwrap().clone();

    // Record a failure against the process key, then a clean run
    audit.log_fail("transfer", None, None).unwrap();
    assert_eq!(audit.get_count("transfer"), 1);

    engine
        .execute(
            "transfer",
            kwargs(serde_json::json!({"amount": 1})),
            ExecuteOptions::default(),
        )
        .unwrap();
    assert_eq!(audit.get_count("transfer"), 0);
}

#[test]
fn user_error_is_recorded_against_the_process() {
    let mut config = EngineConfig::default();
    config.audit = Some(AuditConfig {
        level: AuditLevel::Count,
        ..Default::default()
    });
    let mut engine = Engine::from_json(serde_json::json!({"a": 0}), config).unwrap();
    engine
        .register(
            "brittle",
            Contract::new(["a"], ["a"]).unwrap(),
            Box::new(|_, _| Err(TheusError::invalid_input("boom"))),
        )
        .unwrap();

    for _ in 0..2 {
        let _ = engine.execute("brittle", ValueMap::new(), ExecuteOptions::default());
    }
    assert_eq!(engine.audit().unwrap().get_count("brittle"), 2);
}
