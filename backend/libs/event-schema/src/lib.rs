/// Event schema for records moved through the delivery log
///
/// An [`Event`] is created once at the ingest boundary, forwarded into the log and
/// afterwards only exists as log-resident records. Every destination decodes the same
/// bytes independently, so the wire form is the only contract between the two sides.
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised while moving an [`Event`] to or from its wire form
#[derive(Debug, Error)]
pub enum EventCodecError {
    #[error("failed to encode event: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("failed to decode event: {0}")]
    Decode(#[source] serde_json::Error),

    /// The log record carried no value at all (tombstone)
    #[error("record has no payload")]
    MissingPayload,
}

/// The unit of data delivered to every destination
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// User identifier, used as the partition key. Empty means "no ordering affinity".
    #[serde(rename = "user_id", alias = "UserID", alias = "key", default)]
    pub key: String,

    /// Opaque payload handed to destination handlers as-is
    #[serde(alias = "Payload")]
    pub payload: String,
}

impl Event {
    pub fn new(key: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            payload: payload.into(),
        }
    }

    /// Key used for partition routing, `None` when the event is keyless
    pub fn partition_key(&self) -> Option<&str> {
        if self.key.is_empty() {
            None
        } else {
            Some(&self.key)
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, EventCodecError> {
        serde_json::to_vec(self).map_err(EventCodecError::Encode)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, EventCodecError> {
        serde_json::from_slice(bytes).map_err(EventCodecError::Decode)
    }

    /// Decode the value of a log record, treating an absent value as an error
    pub fn from_record_value(value: Option<&[u8]>) -> Result<Self, EventCodecError> {
        match value {
            Some(bytes) => Self::from_slice(bytes),
            None => Err(EventCodecError::MissingPayload),
        }
    }
}
