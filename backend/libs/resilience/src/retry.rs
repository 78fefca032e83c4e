/// Retry policy with linear backoff and a stop signal
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Retry `n` waits `n` units before running
    pub backoff_unit: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            backoff_unit: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, backoff_unit: Duration) -> Self {
        Self {
            max_retries,
            backoff_unit,
        }
    }

    /// Wait inserted before retry number `retry` (1-based): 1, 2, 3, ... units
    pub fn backoff(&self, retry: u32) -> Duration {
        self.backoff_unit.saturating_mul(retry)
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }
}

/// How a retry sequence ended
#[derive(Debug, PartialEq, Eq)]
pub enum RetryOutcome<T, E> {
    Succeeded { value: T, retries: u32 },
    Exhausted { error: E, retries: u32 },
    /// The stop signal fired before the sequence reached a verdict
    Cancelled { retries: u32 },
}

impl<T, E> RetryOutcome<T, E> {
    pub fn retries(&self) -> u32 {
        match self {
            RetryOutcome::Succeeded { retries, .. }
            | RetryOutcome::Exhausted { retries, .. }
            | RetryOutcome::Cancelled { retries } => *retries,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, RetryOutcome::Cancelled { .. })
    }
}

/// Run `attempt` until it succeeds, the policy is exhausted, or `stop` flips to `true`.
///
/// The stop signal interrupts both the backoff sleep and an in-flight attempt; the
/// interrupted attempt future is dropped. A closed stop channel counts as a stop.
pub async fn retry_until_stopped<F, Fut, T, E>(
    policy: &RetryPolicy,
    stop: &mut watch::Receiver<bool>,
    mut attempt: F,
) -> RetryOutcome<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let mut retries = 0;

    loop {
        if *stop.borrow() {
            return RetryOutcome::Cancelled { retries };
        }

        let result = tokio::select! {
            biased;
            _ = stopped(stop) => return RetryOutcome::Cancelled { retries },
            result = attempt() => result,
        };

        let error = match result {
            Ok(value) => return RetryOutcome::Succeeded { value, retries },
            Err(error) => error,
        };

        if retries >= policy.max_retries {
            warn!(
                retries,
                max_retries = policy.max_retries,
                error = %error,
                "Retry budget exhausted"
            );
            return RetryOutcome::Exhausted { error, retries };
        }

        retries += 1;
        let delay = policy.backoff(retries);
        debug!(
            retry = retries,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "Attempt failed, backing off"
        );

        tokio::select! {
            biased;
            _ = stopped(stop) => return RetryOutcome::Cancelled { retries },
            _ = tokio::time::sleep(delay) => {}
        }

        info!(retry = retries, "Retrying");
    }
}

async fn stopped(stop: &mut watch::Receiver<bool>) {
    // Err means the sender is gone, which is treated the same as a stop
    let _ = stop.wait_for(|stopped| *stopped).await;
}
