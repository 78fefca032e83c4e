use super::{DeliveryHandler, HandlerError};
use async_trait::async_trait;
use event_schema::Event;
use reqwest::Client;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::debug;

/// Delivers events as JSON `POST`s to an HTTP endpoint.
///
/// Every request carries its own timeout, so a hung endpoint surfaces as
/// [`HandlerError::Timeout`] and goes through the normal retry budget.
pub struct WebhookHandler {
    url: String,
    timeout: Duration,
    http_client: Client,
    successes: AtomicU64,
    failures: AtomicU64,
}

impl WebhookHandler {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, HandlerError> {
        let http_client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| HandlerError::Unavailable(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            url: url.into(),
            timeout,
            http_client,
            successes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        })
    }

    async fn post(&self, event: &Event) -> Result<(), HandlerError> {
        let response = self
            .http_client
            .post(&self.url)
            .json(event)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    HandlerError::Timeout(self.timeout)
                } else {
                    HandlerError::Unavailable(e.to_string())
                }
            })?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        Err(HandlerError::Rejected(format!("{status}: {body}")))
    }
}

#[async_trait]
impl DeliveryHandler for WebhookHandler {
    async fn handle(&self, event: &Event) -> Result<(), HandlerError> {
        match self.post(event).await {
            Ok(()) => {
                self.successes.fetch_add(1, Ordering::Relaxed);
                debug!(url = %self.url, key = %event.key, "Webhook accepted event");
                Ok(())
            }
            Err(e) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                Err(e)
            }
        }
    }

    fn success_count(&self) -> u64 {
        self.successes.load(Ordering::Relaxed)
    }

    fn failure_count(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }
}
