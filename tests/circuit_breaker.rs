//! Circuit Breaker Integration Tests
//!
//! Tests for the closed -> open -> half-open -> closed cycle and for
//! composition with the retry policy.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use carecrew::core::{CircuitBreaker, CircuitState, RetryPolicy, TaskError};

async fn guarded(
    breaker: &CircuitBreaker,
    calls: &AtomicU32,
    succeed: bool,
) -> Result<&'static str, TaskError> {
    breaker
        .call(move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            if succeed {
                Ok("row")
            } else {
                Err(TaskError::transient("connection", "database unreachable"))
            }
        })
        .await
}

#[tokio::test]
async fn test_open_breaker_skips_collaborator() {
    let breaker = CircuitBreaker::new("warehouse", 2, Duration::from_secs(60));
    let calls = AtomicU32::new(0);

    assert!(guarded(&breaker, &calls, false).await.is_err());
    assert!(guarded(&breaker, &calls, false).await.is_err());
    assert_eq!(breaker.state(), CircuitState::Open);

    let err = guarded(&breaker, &calls, true).await.unwrap_err();
    assert!(matches!(err, TaskError::CircuitOpen { ref name } if name == "warehouse"));
    // Third call never reached the collaborator
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_half_open_probe_success_closes() {
    let breaker = CircuitBreaker::new("warehouse", 1, Duration::from_millis(30));
    let calls = AtomicU32::new(0);

    assert!(guarded(&breaker, &calls, false).await.is_err());
    assert_eq!(breaker.state(), CircuitState::Open);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(breaker.state(), CircuitState::HalfOpen);

    assert_eq!(guarded(&breaker, &calls, true).await.unwrap(), "row");
    assert_eq!(breaker.state(), CircuitState::Closed);
    assert_eq!(breaker.snapshot().consecutive_failures, 0);
}

#[tokio::test]
async fn test_half_open_probe_failure_reopens() {
    let breaker = CircuitBreaker::new("warehouse", 1, Duration::from_millis(30));
    let calls = AtomicU32::new(0);

    assert!(guarded(&breaker, &calls, false).await.is_err());
    tokio::time::sleep(Duration::from_millis(50)).await;

    let err = guarded(&breaker, &calls, false).await.unwrap_err();
    assert_eq!(err.kind(), "connection");
    assert_eq!(breaker.state(), CircuitState::Open);

    // Timer restarted by the failed probe
    assert_eq!(guarded(&breaker, &calls, true).await.unwrap_err().kind(), "circuit_open");
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_half_open_admits_single_probe() {
    let breaker = Arc::new(CircuitBreaker::new("warehouse", 1, Duration::from_millis(10)));
    let calls = AtomicU32::new(0);

    assert!(guarded(&breaker, &calls, false).await.is_err());
    tokio::time::sleep(Duration::from_millis(30)).await;

    let (admitted_tx, admitted_rx) = tokio::sync::oneshot::channel::<()>();
    let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
    let probe = {
        let breaker = Arc::clone(&breaker);
        tokio::spawn(async move {
            breaker
                .call(move || async move {
                    let _ = admitted_tx.send(());
                    let _ = release_rx.await;
                    Ok::<_, TaskError>(())
                })
                .await
        })
    };

    admitted_rx.await.unwrap();

    // The probe slot is taken; everyone else is rejected
    let err = guarded(&breaker, &calls, true).await.unwrap_err();
    assert_eq!(err.kind(), "circuit_open");

    release_tx.send(()).unwrap();
    probe.await.unwrap().unwrap();
    assert_eq!(breaker.state(), CircuitState::Closed);
}

#[tokio::test]
async fn test_breaker_wraps_retry() {
    // One breaker failure per exhausted retry sequence
    let breaker = CircuitBreaker::new("api", 2, Duration::from_secs(60));
    let policy = RetryPolicy::new(2, Duration::from_millis(1), Duration::from_millis(5));
    let calls = AtomicU32::new(0);

    let (policy, calls) = (&policy, &calls);

    for _ in 0..2 {
        let result: Result<(), TaskError> = breaker
            .call(move || {
                policy.execute(move || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(TaskError::transient("timeout", "upstream slow"))
                })
            })
            .await;
        assert!(result.is_err());
    }

    assert_eq!(calls.load(Ordering::SeqCst), 6);
    assert_eq!(breaker.snapshot().consecutive_failures, 2);
    assert_eq!(breaker.state(), CircuitState::Open);
}
