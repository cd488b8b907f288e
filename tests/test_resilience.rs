//! Retry, circuit breaker and checkpoint behaviour seen from outside the
//! crate.

mod common;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use isolab::resilience::{
    with_retry, CircuitBreaker, CircuitState, RecoveryManager, RetryOptions, CHECKPOINT_LIMIT,
};
use isolab::sandbox::AssessmentError;
use proptest::prelude::*;
use serde_json::json;

fn always_failing(counter: &Arc<AtomicU32>) -> impl FnMut() -> std::future::Ready<isolab::sandbox::Result<()>> + '_ {
    move || {
        counter.fetch_add(1, Ordering::SeqCst);
        std::future::ready(Err(AssessmentError::ContainerCreation("daemon unavailable".into())))
    }
}

proptest! {
    #![proptest_config(ProptestConfig { cases: 20, ..common::proptest_config() })]

    #[test]
    fn retry_calls_operation_exactly_max_attempts(max_attempts in 1u32..8) {
        let counter = Arc::new(AtomicU32::new(0));
        let options = RetryOptions::new(common::fast_policy(max_attempts));
        let outcome = common::block_on(with_retry(always_failing(&counter), &options, "always-fails"));

        prop_assert!(!outcome.success());
        prop_assert_eq!(outcome.attempts, max_attempts);
        prop_assert_eq!(counter.load(Ordering::SeqCst), max_attempts);
    }

    #[test]
    fn rejecting_condition_calls_operation_once(max_attempts in 1u32..8) {
        let counter = Arc::new(AtomicU32::new(0));
        let options = RetryOptions::new(common::fast_policy(max_attempts)).with_condition(|_| false);
        let outcome = common::block_on(with_retry(always_failing(&counter), &options, "no-retry"));

        prop_assert!(!outcome.success());
        prop_assert_eq!(outcome.attempts, 1);
        prop_assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}

#[tokio::test(start_paused = true)]
async fn test_breaker_opens_then_recovers_after_timeout() {
    let timeout = Duration::from_secs(30);
    let breaker = CircuitBreaker::new("runtime", 2, timeout, 1);
    let calls = &AtomicU32::new(0);

    for _ in 0..2 {
        let result: isolab::sandbox::Result<()> = breaker
            .call(move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(AssessmentError::ContainerStart("boom".into()))
            })
            .await;
        assert!(result.is_err());
    }
    assert_eq!(breaker.state(), CircuitState::Open);

    let rejected: isolab::sandbox::Result<()> = breaker
        .call(move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .await;
    assert_eq!(rejected.unwrap_err().code(), "CIRCUIT_OPEN");
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    tokio::time::advance(timeout + Duration::from_millis(1)).await;

    let probe = breaker
        .call(move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(42)
        })
        .await
        .unwrap();
    assert_eq!(probe, 42);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(breaker.state(), CircuitState::Closed);
}

#[test]
fn test_checkpoint_ring_evicts_oldest() {
    let recovery = RecoveryManager::default();
    for i in 0..15 {
        recovery.create_checkpoint("env-a", &format!("step-{}", i), json!({ "index": i }), None);
    }
    recovery.create_checkpoint("env-b", "other", json!({}), None);

    let kept = recovery.checkpoints("env-a");
    assert_eq!(kept.len(), CHECKPOINT_LIMIT);
    let names: Vec<String> = kept.iter().map(|c| c.step_name.clone()).collect();
    let expected: Vec<String> = (5..15).map(|i| format!("step-{}", i)).collect();
    assert_eq!(names, expected);
    assert_eq!(kept[0].state, json!({ "index": 5 }));
    assert_eq!(recovery.checkpoints("env-b").len(), 1);
}
