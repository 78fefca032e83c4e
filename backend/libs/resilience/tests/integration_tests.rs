/// Integration tests for resilience library
use resilience::{retry_until_stopped, RetryOutcome, RetryPolicy};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;

// ==================== Retry Sequence Tests ====================

#[tokio::test]
async fn test_eventual_success_within_budget() {
    let (_tx, mut rx) = watch::channel(false);
    let policy = RetryPolicy::new(5, Duration::from_millis(5));
    let attempts = Arc::new(AtomicU32::new(0));
    let attempts_clone = attempts.clone();

    let outcome = retry_until_stopped(&policy, &mut rx, move || {
        let n = attempts_clone.fetch_add(1, Ordering::SeqCst);
        async move {
            if n < 4 {
                Err(format!("attempt {} failed", n))
            } else {
                Ok(n)
            }
        }
    })
    .await;

    assert_eq!(outcome, RetryOutcome::Succeeded { value: 4, retries: 4 });
    assert_eq!(attempts.load(Ordering::SeqCst), 5);
}

#[tokio::test]
async fn test_always_failing_uses_exactly_max_attempts() {
    let (_tx, mut rx) = watch::channel(false);
    let policy = RetryPolicy::new(3, Duration::from_millis(1));
    let attempts = Arc::new(AtomicU32::new(0));
    let attempts_clone = attempts.clone();

    let outcome = retry_until_stopped(&policy, &mut rx, move || {
        attempts_clone.fetch_add(1, Ordering::SeqCst);
        async { Err::<(), _>("down") }
    })
    .await;

    assert!(matches!(outcome, RetryOutcome::Exhausted { retries: 3, .. }));
    assert_eq!(attempts.load(Ordering::SeqCst), policy.max_attempts());
}

#[tokio::test]
async fn test_dropped_stop_sender_cancels() {
    let (tx, mut rx) = watch::channel(false);
    let policy = RetryPolicy::new(5, Duration::from_secs(60));

    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(tx);
    });

    let started = Instant::now();
    let outcome = retry_until_stopped(&policy, &mut rx, || async { Err::<(), _>("down") }).await;

    assert_eq!(outcome, RetryOutcome::Cancelled { retries: 1 });
    assert!(started.elapsed() < Duration::from_secs(5));
}
