//! Event delivery over a partitioned log.
//!
//! Events submitted over HTTP are forwarded once into a shared topic. Every
//! destination reads that topic through its own consumer group, so each one
//! progresses independently, and replicas of the same destination split its
//! partitions between them.
pub mod config;
pub mod destination;
pub mod error;
pub mod forwarder;
pub mod handlers;
pub mod log;

pub use config::{Config, DestinationSpec, DestinationTarget, KafkaSettings, LogBackend};
pub use destination::{
    Controller, ControllerSettings, ControllerState, DeliveryHandler, DestinationController,
    DestinationIdentity, FailureMode, HandlerError, MockHandler, WebhookHandler,
};
pub use error::{AppError, BrokerError, ConfigError, ForwardError, StartError};
pub use forwarder::{Ack, EventForwarder, KafkaForwarder};
pub use log::{EventLog, KafkaLog, LogConsumer, LogRecord, MemoryForwarder, MemoryLog};
