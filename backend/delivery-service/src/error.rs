use actix_web::{error::ResponseError, http::StatusCode, HttpResponse};
use event_schema::EventCodecError;
use serde::Serialize;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, AppError>;

/// A destination controller could not begin consuming. Fatal for that instance.
#[derive(Debug, Error)]
pub enum StartError {
    #[error("failed to create consumer for group {group_id}: {reason}")]
    ConsumerCreate { group_id: String, reason: String },

    #[error("failed to subscribe group {group_id} to topic {topic}: {reason}")]
    Subscribe {
        topic: String,
        group_id: String,
        reason: String,
    },
}

/// Forwarding an event into the log failed. Surfaced to the submitter as-is.
#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("Serialization error: {0}")]
    Serialization(#[from] EventCodecError),

    #[error("Topic creation failed for {topic}: {reason}")]
    TopicCreation { topic: String, reason: String },

    #[error("Broker error: {0}")]
    Broker(String),

    #[error("Forwarder is closed")]
    Closed,
}

/// Transient broker condition observed while polling or committing.
///
/// Logged by the controller and otherwise ignored; the client reconnects on its own.
#[derive(Debug, Clone, Error)]
pub enum BrokerError {
    #[error("Kafka error: {0}")]
    Kafka(String),

    #[error("partition {partition} is not assigned to this member")]
    NotAssigned { partition: i32 },

    #[error("consumer is closed")]
    Closed,
}

impl From<rdkafka::error::KafkaError> for BrokerError {
    fn from(err: rdkafka::error::KafkaError) -> Self {
        BrokerError::Kafka(err.to_string())
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Environment error: {0}")]
    Env(#[from] envy::Error),

    #[error("Invalid destination '{0}': expected `group_id` or `group_id=url`")]
    InvalidDestination(String),

    #[error("Unknown log backend '{0}': expected `kafka` or `memory`")]
    UnknownBackend(String),
}

/// Errors returned by the HTTP entry point
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Failed to forward event: {0}")]
    Forward(#[from] ForwardError),
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    message: String,
}

impl ResponseError for AppError {
    fn status_code(&self) -> StatusCode {
        match self {
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::Forward(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        let error_type = match self {
            AppError::BadRequest(_) => "BAD_REQUEST",
            AppError::Forward(_) => "FORWARD_ERROR",
        };

        HttpResponse::build(self.status_code()).json(ErrorResponse {
            error: error_type.to_string(),
            message: self.to_string(),
        })
    }
}
