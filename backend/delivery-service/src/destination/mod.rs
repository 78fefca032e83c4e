//! Destination delivery: one controller per destination instance, each with its own
//! consumer group position and its own delivery handler.
mod controller;
mod handler;
mod webhook;

use event_schema::Event;
use serde::Serialize;

pub use controller::{Controller, ControllerSettings, ControllerState, DestinationController};
pub use handler::{DeliveryHandler, FailureMode, HandlerError, MockHandler};
pub use webhook::WebhookHandler;

/// A logical delivery target. Instances sharing both fields split the topic's partitions.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct DestinationIdentity {
    pub topic: String,
    pub group_id: String,
}

impl DestinationIdentity {
    pub fn new(topic: impl Into<String>, group_id: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            group_id: group_id.into(),
        }
    }
}

/// A decoded record owned by the controller for the length of one retry sequence
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryRecord {
    pub event: Event,
    pub partition: i32,
    pub offset: i64,
    pub key: Vec<u8>,
}

impl DeliveryRecord {
    /// Offset to commit once this record is finished with
    pub fn next_offset(&self) -> i64 {
        self.offset + 1
    }

    pub fn key_str(&self) -> String {
        String::from_utf8_lossy(&self.key).into_owned()
    }
}
