/// Resilience patterns for destination delivery
///
/// - **Retry**: linear backoff (1, 2, 3, ... units) with a bounded retry budget
/// - **Stop-aware**: a `tokio::sync::watch` stop flag interrupts backoff and in-flight attempts
///
/// # Example
///
/// ```rust,no_run
/// use resilience::{retry_until_stopped, RetryOutcome, RetryPolicy};
/// use tokio::sync::watch;
///
/// #[tokio::main]
/// async fn main() {
///     let (_stop_tx, mut stop_rx) = watch::channel(false);
///     let policy = RetryPolicy::default();
///
///     let outcome = retry_until_stopped(&policy, &mut stop_rx, || async {
///         // Your delivery call here
///         Ok::<_, String>(())
///     })
///     .await;
///
///     assert!(matches!(outcome, RetryOutcome::Succeeded { .. }));
/// }
/// ```

pub mod retry;

pub use retry::{retry_until_stopped, RetryOutcome, RetryPolicy};
