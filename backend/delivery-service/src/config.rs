//! Configuration for the delivery service
//!
//! Loaded once at process start and handed to constructors; nothing below `main`
//! reads the environment.
use crate::destination::ControllerSettings;
use crate::error::ConfigError;
use resilience::RetryPolicy;
use serde::Deserialize;
use std::time::Duration;

/// Main configuration struct, loaded from environment variables
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Kafka broker addresses
    #[serde(default = "default_kafka_brokers")]
    pub kafka_brokers: String,

    /// Topic every event is forwarded to and every destination reads from
    #[serde(default = "default_events_topic")]
    pub events_topic: String,

    /// Partition count used when the topic is created
    #[serde(default = "default_topic_partitions")]
    pub topic_partitions: i32,

    #[serde(default = "default_replication_factor")]
    pub topic_replication_factor: i32,

    /// Delete the topic when the forwarder closes (test environments only)
    #[serde(default)]
    pub delete_topic_on_close: bool,

    /// Retries after the first failed delivery attempt
    #[serde(default = "default_retry_count")]
    pub retry_count: u32,

    /// Backoff unit; retry n waits n units
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,

    /// Upper bound of a single poll, and so of stop latency
    #[serde(default = "default_poll_timeout_ms")]
    pub poll_timeout_ms: u64,

    /// Producer acknowledgement timeout
    #[serde(default = "default_delivery_timeout_ms")]
    pub delivery_timeout_ms: u64,

    #[serde(default = "default_http_host")]
    pub http_host: String,

    #[serde(default = "default_http_port")]
    pub http_port: u16,

    /// `kafka` or `memory`
    #[serde(default = "default_log_backend")]
    pub log_backend: String,

    /// Comma separated `group_id` or `group_id=webhook_url` entries
    #[serde(default = "default_destinations")]
    pub destinations: Vec<String>,

    #[serde(default = "default_webhook_timeout_ms")]
    pub webhook_timeout_ms: u64,
}

fn default_kafka_brokers() -> String {
    "127.0.0.1:9092".to_string()
}

fn default_events_topic() -> String {
    "events".to_string()
}

fn default_topic_partitions() -> i32 {
    20
}

fn default_replication_factor() -> i32 {
    1
}

fn default_retry_count() -> u32 {
    5
}

fn default_retry_backoff_ms() -> u64 {
    1000
}

fn default_poll_timeout_ms() -> u64 {
    100
}

fn default_delivery_timeout_ms() -> u64 {
    30_000
}

fn default_http_host() -> String {
    "0.0.0.0".to_string()
}

fn default_http_port() -> u16 {
    8080
}

fn default_log_backend() -> String {
    "kafka".to_string()
}

fn default_destinations() -> Vec<String> {
    vec!["destination1".to_string(), "destination2".to_string()]
}

fn default_webhook_timeout_ms() -> u64 {
    10_000
}

/// Connection and topic settings shared by the Kafka forwarder and consumers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KafkaSettings {
    pub brokers: String,
    pub partitions: i32,
    pub replication_factor: i32,
    pub delivery_timeout: Duration,
    pub delete_topic_on_close: bool,
}

impl Default for KafkaSettings {
    fn default() -> Self {
        Self {
            brokers: default_kafka_brokers(),
            partitions: default_topic_partitions(),
            replication_factor: default_replication_factor(),
            delivery_timeout: Duration::from_millis(default_delivery_timeout_ms()),
            delete_topic_on_close: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogBackend {
    Kafka,
    Memory,
}

/// Where a destination's handler delivers to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DestinationTarget {
    /// In-process handler that accepts every event (demo and local runs)
    Mock,
    Webhook(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DestinationSpec {
    pub group_id: String,
    pub target: DestinationTarget,
}

impl DestinationSpec {
    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        let raw = raw.trim();
        let (group_id, target) = match raw.split_once('=') {
            Some((group_id, url)) => {
                let url = url.trim();
                if url.is_empty() {
                    return Err(ConfigError::InvalidDestination(raw.to_string()));
                }
                (group_id.trim(), DestinationTarget::Webhook(url.to_string()))
            }
            None => (raw, DestinationTarget::Mock),
        };

        if group_id.is_empty() {
            return Err(ConfigError::InvalidDestination(raw.to_string()));
        }

        Ok(Self {
            group_id: group_id.to_string(),
            target,
        })
    }
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(std::env::vars())
    }

    /// Blank values count as unset and fall back to their defaults
    pub fn from_vars<I>(vars: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let vars = vars.into_iter().filter(|(_, value)| !value.trim().is_empty());
        Ok(envy::from_iter(vars)?)
    }

    pub fn kafka_settings(&self) -> KafkaSettings {
        KafkaSettings {
            brokers: self.kafka_brokers.clone(),
            partitions: self.topic_partitions,
            replication_factor: self.topic_replication_factor,
            delivery_timeout: Duration::from_millis(self.delivery_timeout_ms),
            delete_topic_on_close: self.delete_topic_on_close,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.retry_count,
            Duration::from_millis(self.retry_backoff_ms),
        )
    }

    pub fn controller_settings(&self) -> ControllerSettings {
        ControllerSettings {
            retry: self.retry_policy(),
            poll_timeout: Duration::from_millis(self.poll_timeout_ms),
        }
    }

    pub fn log_backend(&self) -> Result<LogBackend, ConfigError> {
        match self.log_backend.trim().to_ascii_lowercase().as_str() {
            "kafka" => Ok(LogBackend::Kafka),
            "memory" => Ok(LogBackend::Memory),
            other => Err(ConfigError::UnknownBackend(other.to_string())),
        }
    }

    pub fn destination_specs(&self) -> Result<Vec<DestinationSpec>, ConfigError> {
        self.destinations
            .iter()
            .filter(|raw| !raw.trim().is_empty())
            .map(|raw| DestinationSpec::parse(raw))
            .collect()
    }

    pub fn webhook_timeout(&self) -> Duration {
        Duration::from_millis(self.webhook_timeout_ms)
    }

    pub fn http_bind_address(&self) -> String {
        format!("{}:{}", self.http_host, self.http_port)
    }
}
