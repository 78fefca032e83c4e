use async_trait::async_trait;
use event_schema::Event;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum HandlerError {
    #[error("destination rejected event: {0}")]
    Rejected(String),

    #[error("destination unavailable: {0}")]
    Unavailable(String),

    #[error("delivery timed out after {0:?}")]
    Timeout(Duration),
}

/// Delivers one event to one destination.
///
/// Records are redelivered after a crash or rebalance, so implementations must tolerate
/// seeing the same event more than once. The controller imposes no timeout of its own;
/// a handler must bound its own calls.
#[async_trait]
pub trait DeliveryHandler: Send + Sync {
    async fn handle(&self, event: &Event) -> Result<(), HandlerError>;

    fn success_count(&self) -> u64;

    fn failure_count(&self) -> u64;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureMode {
    Never,
    Always,
    /// Fail the first `n` calls, then succeed
    FirstAttempts(u64),
}

/// In-process handler with a fixed delay and scripted failures
#[derive(Debug)]
pub struct MockHandler {
    delay: Duration,
    failure_mode: FailureMode,
    calls: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
}

impl MockHandler {
    pub fn new(delay: Duration, failure_mode: FailureMode) -> Self {
        Self {
            delay,
            failure_mode,
            calls: AtomicU64::new(0),
            successes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        }
    }

    pub fn succeeding(delay: Duration) -> Self {
        Self::new(delay, FailureMode::Never)
    }

    pub fn failing(delay: Duration) -> Self {
        Self::new(delay, FailureMode::Always)
    }
}

#[async_trait]
impl DeliveryHandler for MockHandler {
    async fn handle(&self, _event: &Event) -> Result<(), HandlerError> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        let fail = match self.failure_mode {
            FailureMode::Never => false,
            FailureMode::Always => true,
            FailureMode::FirstAttempts(n) => call < n,
        };

        if fail {
            self.failures.fetch_add(1, Ordering::SeqCst);
            return Err(HandlerError::Rejected("Handler failed".to_string()));
        }

        self.successes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn success_count(&self) -> u64 {
        self.successes.load(Ordering::SeqCst)
    }

    fn failure_count(&self) -> u64 {
        self.failures.load(Ordering::SeqCst)
    }
}
