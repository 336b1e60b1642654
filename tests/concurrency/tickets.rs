//! Priority-ticket escalation
//!
//! A requester that keeps losing CAS races gets temporary exclusive
//! access; everyone else sees `System Busy` until the holder commits once
//! or the grant lapses.

use crate::{patch_with, seeded};
use std::sync::Arc;
use std::time::Duration;
use theus::{RetryController, Value, TICKET_THRESHOLD};

fn controller_over(store: &Arc<theus::VersionedStore>) -> RetryController {
    RetryController::new(Arc::clone(store), Duration::from_secs(5), 3)
}

#[test]
fn chronic_loser_gets_exclusive_access() {
    let store = Arc::new(seeded(serde_json::json!({"hot": 0})));
    let controller = controller_over(&store);

    for _ in 0..TICKET_THRESHOLD {
        controller.report_conflict("starved");
    }

    // Everyone else is gated
    let err = store
        .compare_and_swap(
            0,
            Some(&patch_with(&[("hot", Value::Int(1))])),
            None,
            None,
            Some("winner"),
        )
        .unwrap_err();
    assert!(err.is_busy());
    assert!(err.to_string().contains("starved"));

    // The holder commits and thereby releases the grant
    store
        .compare_and_swap(
            0,
            Some(&patch_with(&[("hot", Value::Int(2))])),
            None,
            None,
            Some("starved"),
        )
        .unwrap();
    store
        .compare_and_swap(
            1,
            Some(&patch_with(&[("hot", Value::Int(3))])),
            None,
            None,
            Some("winner"),
        )
        .unwrap();
}

#[test]
fn success_report_releases_grant() {
    let store = Arc::new(seeded(serde_json::json!({"hot": 0})));
    let controller = controller_over(&store);

    for _ in 0..TICKET_THRESHOLD {
        controller.report_conflict("starved");
    }
    assert!(store.ticket_holder().is_some());

    controller.report_success("starved");
    assert!(store.ticket_holder().is_none());
}

#[test]
fn expired_grant_is_force_released() {
    let store = Arc::new(seeded(serde_json::json!({"hot": 0})));
    store.grant_ticket("ghost", Duration::from_millis(1), 3);
    std::thread::sleep(Duration::from_millis(10));

    // A dead worker cannot wedge the store
    store
        .compare_and_swap(
            0,
            Some(&patch_with(&[("hot", Value::Int(1))])),
            None,
            None,
            Some("alive"),
        )
        .unwrap();
}

#[test]
fn backoff_decisions_stay_capped() {
    let store = Arc::new(seeded(serde_json::json!({})));
    let controller = controller_over(&store);

    for _ in 0..20 {
        let decision = controller.report_conflict("p");
        assert!(decision.should_retry);
        assert!(decision.wait <= Duration::from_millis(1000));
    }
}
