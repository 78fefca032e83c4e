//! Durable log seam
//!
//! The controller only needs three things from the log: a bounded poll, an explicit
//! per-partition commit, and a way to leave its consumer group. Kafka provides them in
//! production; [`memory::MemoryLog`] provides the same group semantics in-process.

pub mod kafka;
pub mod memory;

use crate::destination::DestinationIdentity;
use crate::error::{BrokerError, StartError};
use async_trait::async_trait;
use std::time::Duration;

pub use kafka::KafkaLog;
pub use memory::{MemoryForwarder, MemoryLog};

/// A record as read from the log, detached from the client's buffers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub partition: i32,
    pub offset: i64,
    pub key: Option<Vec<u8>>,
    pub payload: Option<Vec<u8>>,
}

/// Factory for group-bound consumers
pub trait EventLog: Send + Sync {
    /// Join `destination.group_id` and subscribe to `destination.topic`.
    ///
    /// New groups start from the earliest retained record; automatic commits are off.
    fn subscribe(&self, destination: &DestinationIdentity)
        -> Result<Box<dyn LogConsumer>, StartError>;
}

/// One member of a consumer group
#[async_trait]
pub trait LogConsumer: Send {
    /// Wait up to `timeout` for the next record. `Ok(None)` means nothing arrived.
    async fn poll(&mut self, timeout: Duration) -> Result<Option<LogRecord>, BrokerError>;

    /// Record `next_offset` as the group's position for `partition`
    fn commit(&mut self, partition: i32, next_offset: i64) -> Result<(), BrokerError>;

    /// Leave the group. Further polls return [`BrokerError::Closed`].
    fn unsubscribe(&mut self);
}
