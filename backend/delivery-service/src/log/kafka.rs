//! Kafka-backed log: consumer groups via rdkafka's `StreamConsumer`, topic admin via `AdminClient`
use super::{EventLog, LogConsumer, LogRecord};
use crate::config::KafkaSettings;
use crate::destination::DestinationIdentity;
use crate::error::{BrokerError, ForwardError, StartError};
use async_trait::async_trait;
use rdkafka::admin::{AdminClient, AdminOptions, NewTopic, TopicReplication};
use rdkafka::client::DefaultClientContext;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::Message;
use rdkafka::types::RDKafkaErrorCode;
use rdkafka::{ClientConfig, Offset, TopicPartitionList};
use std::time::Duration;
use tracing::{debug, info};

const ADMIN_OPERATION_TIMEOUT: Duration = Duration::from_secs(60);

/// Consumer factory bound to one Kafka cluster
#[derive(Debug, Clone)]
pub struct KafkaLog {
    settings: KafkaSettings,
}

impl KafkaLog {
    pub fn new(settings: KafkaSettings) -> Self {
        Self { settings }
    }
}

impl EventLog for KafkaLog {
    fn subscribe(
        &self,
        destination: &DestinationIdentity,
    ) -> Result<Box<dyn LogConsumer>, StartError> {
        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", &self.settings.brokers)
            .set("group.id", &destination.group_id)
            .set("enable.auto.commit", "false") // Offsets only move when the controller commits
            .set("auto.offset.reset", "earliest")
            .set("session.timeout.ms", "45000")
            .set("max.poll.interval.ms", "300000")
            .set("enable.partition.eof", "false")
            .create()
            .map_err(|e| StartError::ConsumerCreate {
                group_id: destination.group_id.clone(),
                reason: e.to_string(),
            })?;

        consumer
            .subscribe(&[destination.topic.as_str()])
            .map_err(|e| StartError::Subscribe {
                topic: destination.topic.clone(),
                group_id: destination.group_id.clone(),
                reason: e.to_string(),
            })?;

        info!(
            topic = %destination.topic,
            group_id = %destination.group_id,
            "Kafka consumer subscribed"
        );

        Ok(Box::new(KafkaConsumer {
            consumer,
            topic: destination.topic.clone(),
            closed: false,
        }))
    }
}

struct KafkaConsumer {
    consumer: StreamConsumer,
    topic: String,
    closed: bool,
}

#[async_trait]
impl LogConsumer for KafkaConsumer {
    async fn poll(&mut self, timeout: Duration) -> Result<Option<LogRecord>, BrokerError> {
        if self.closed {
            return Err(BrokerError::Closed);
        }

        match tokio::time::timeout(timeout, self.consumer.recv()).await {
            Err(_) => Ok(None),
            Ok(Ok(message)) => Ok(Some(LogRecord {
                partition: message.partition(),
                offset: message.offset(),
                key: message.key().map(<[u8]>::to_vec),
                payload: message.payload().map(<[u8]>::to_vec),
            })),
            Ok(Err(e)) => Err(e.into()),
        }
    }

    fn commit(&mut self, partition: i32, next_offset: i64) -> Result<(), BrokerError> {
        if self.closed {
            return Err(BrokerError::Closed);
        }

        let mut tpl = TopicPartitionList::new();
        tpl.add_partition_offset(&self.topic, partition, Offset::Offset(next_offset))?;
        self.consumer.commit(&tpl, CommitMode::Async)?;
        Ok(())
    }

    fn unsubscribe(&mut self) {
        if !self.closed {
            self.consumer.unsubscribe();
            self.closed = true;
            debug!(topic = %self.topic, "Kafka consumer unsubscribed");
        }
    }
}

fn admin_client(brokers: &str) -> Result<AdminClient<DefaultClientContext>, String> {
    ClientConfig::new()
        .set("bootstrap.servers", brokers)
        .create()
        .map_err(|e| format!("Failed to create Kafka admin client: {}", e))
}

/// Create `topic` unless it already exists. Returns `true` when it was created.
pub async fn ensure_topic(settings: &KafkaSettings, topic: &str) -> Result<bool, ForwardError> {
    let topic_error = |reason: String| ForwardError::TopicCreation {
        topic: topic.to_string(),
        reason,
    };

    let admin = admin_client(&settings.brokers).map_err(topic_error)?;
    let new_topic = NewTopic::new(
        topic,
        settings.partitions,
        TopicReplication::Fixed(settings.replication_factor),
    );
    let options = AdminOptions::new().operation_timeout(Some(ADMIN_OPERATION_TIMEOUT));

    let results = admin
        .create_topics([&new_topic], &options)
        .await
        .map_err(|e| topic_error(e.to_string()))?;

    for result in results {
        match result {
            Ok(name) => {
                info!(topic = %name, partitions = settings.partitions, "Created topic");
                return Ok(true);
            }
            Err((name, RDKafkaErrorCode::TopicAlreadyExists)) => {
                debug!(topic = %name, "Topic already exists");
            }
            Err((_, code)) => return Err(topic_error(code.to_string())),
        }
    }

    Ok(false)
}

pub async fn delete_topic(settings: &KafkaSettings, topic: &str) -> Result<(), BrokerError> {
    let admin = admin_client(&settings.brokers).map_err(BrokerError::Kafka)?;
    let options = AdminOptions::new().operation_timeout(Some(ADMIN_OPERATION_TIMEOUT));

    let results = admin.delete_topics(&[topic], &options).await?;
    for result in results {
        if let Err((name, code)) = result {
            return Err(BrokerError::Kafka(format!(
                "failed to delete topic {}: {}",
                name, code
            )));
        }
    }

    info!(topic = %topic, "Deleted topic");
    Ok(())
}
