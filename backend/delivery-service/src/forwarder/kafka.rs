use super::{Ack, EventForwarder};
use crate::config::KafkaSettings;
use crate::error::ForwardError;
use crate::log::kafka::{delete_topic, ensure_topic};
use async_trait::async_trait;
use event_schema::Event;
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::ClientConfig;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, error, info, warn};

/// Kafka forwarder with broker acknowledgement per event
pub struct KafkaForwarder {
    producer: FutureProducer,
    topic: String,
    settings: KafkaSettings,
    closed: AtomicBool,
}

impl KafkaForwarder {
    /// Ensure the topic exists, then create the producer
    pub async fn connect(
        settings: KafkaSettings,
        topic: impl Into<String>,
    ) -> Result<Self, ForwardError> {
        let topic = topic.into();
        ensure_topic(&settings, &topic).await?;

        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &settings.brokers)
            .set("enable.idempotence", "true")
            .set("acks", "all")
            .set(
                "message.timeout.ms",
                settings.delivery_timeout.as_millis().to_string(),
            )
            .create()
            .map_err(|e| ForwardError::Broker(e.to_string()))?;

        info!(
            brokers = %settings.brokers,
            topic = %topic,
            "Kafka forwarder initialized"
        );

        Ok(Self {
            producer,
            topic,
            settings,
            closed: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl EventForwarder for KafkaForwarder {
    async fn forward(&self, event: &Event) -> Result<Ack, ForwardError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ForwardError::Closed);
        }

        let body = event.to_bytes()?;
        let timeout = self.settings.delivery_timeout;

        // Keyless events carry no key at all so the partitioner spreads them
        let delivery = match event.partition_key() {
            Some(key) => {
                let record = FutureRecord::to(&self.topic).key(key).payload(&body);
                self.producer.send(record, timeout).await
            }
            None => {
                let record = FutureRecord::<(), Vec<u8>>::to(&self.topic).payload(&body);
                self.producer.send(record, timeout).await
            }
        };

        match delivery {
            Ok((partition, offset)) => {
                info!(
                    key = %event.key,
                    topic = %self.topic,
                    partition = partition,
                    offset = offset,
                    "Delivered message"
                );
                Ok(Ack {
                    topic: self.topic.clone(),
                    partition,
                    offset,
                })
            }
            Err((err, _)) => {
                error!(
                    key = %event.key,
                    topic = %self.topic,
                    error = %err,
                    "Kafka delivery failed"
                );
                Err(ForwardError::Broker(err.to_string()))
            }
        }
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        let producer = self.producer.clone();
        let timeout = self.settings.delivery_timeout;
        match tokio::task::spawn_blocking(move || producer.flush(timeout)).await {
            Ok(Ok(())) => debug!(topic = %self.topic, "Producer flushed"),
            Ok(Err(e)) => warn!(topic = %self.topic, error = %e, "Producer flush failed"),
            Err(e) => warn!(topic = %self.topic, error = %e, "Producer flush task failed"),
        }

        if self.settings.delete_topic_on_close {
            if let Err(e) = delete_topic(&self.settings, &self.topic).await {
                warn!(topic = %self.topic, error = %e, "Failed to delete topic on close");
            }
        }

        info!(topic = %self.topic, "Kafka forwarder closed");
    }
}
