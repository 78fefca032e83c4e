//! Forwarding events into the durable log
mod kafka;

use crate::error::ForwardError;
use async_trait::async_trait;
use event_schema::Event;
use serde::{Deserialize, Serialize};

pub use kafka::KafkaForwarder;

/// Broker acknowledgement of a forwarded event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
}

/// Publishes events into the log, keyed by `Event::key`.
///
/// `forward` resolves only once the broker has acknowledged the write (or failed to).
#[async_trait]
pub trait EventForwarder: Send + Sync {
    async fn forward(&self, event: &Event) -> Result<Ack, ForwardError>;

    /// Release broker resources. Later `forward` calls fail with [`ForwardError::Closed`].
    async fn close(&self);
}
