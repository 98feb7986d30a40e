//! Quarantine path for poison messages

use async_trait::async_trait;
use chrono::Utc;
use rdkafka::message::{Header, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord};
use std::time::Duration;
use tracing::{error, info};

use crate::error::{IdempotencyError, IdempotencyResult};
use crate::message::Message;

/// Destination for messages that exhausted their retry budget
#[async_trait]
pub trait DeadLetterQueue: Send + Sync {
    async fn quarantine(&self, message: &Message, error: &str, attempts: u32) -> IdempotencyResult<()>;
}

/// Records quarantined messages in the log only
#[derive(Debug, Default, Clone)]
pub struct LoggingDeadLetterQueue;

#[async_trait]
impl DeadLetterQueue for LoggingDeadLetterQueue {
    async fn quarantine(&self, message: &Message, error: &str, attempts: u32) -> IdempotencyResult<()> {
        error!(
            key = %message.key,
            topic = %message.topic,
            partition = message.partition,
            offset = message.offset,
            attempts = attempts,
            payload_bytes = message.payload.len(),
            error = %error,
            "Message quarantined"
        );
        Ok(())
    }
}

/// Re-publishes quarantined messages to a dead-letter topic
///
/// The original key, payload and headers are kept so the message can be
/// replayed after the cause is fixed. Quarantine details travel as `x-dlq-*`
/// headers.
pub struct KafkaDeadLetterQueue {
    producer: FutureProducer,
    topic: String,
    delivery_timeout: Duration,
}

impl KafkaDeadLetterQueue {
    /// Create a new dead-letter publisher
    ///
    /// # Arguments
    ///
    /// * `producer` - Kafka producer (should have `enable.idempotence=true`)
    /// * `topic` - Dead-letter topic
    pub fn new(producer: FutureProducer, topic: impl Into<String>) -> Self {
        Self {
            producer,
            topic: topic.into(),
            delivery_timeout: Duration::from_secs(30),
        }
    }

    pub fn with_delivery_timeout(mut self, delivery_timeout: Duration) -> Self {
        self.delivery_timeout = delivery_timeout;
        self
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }
}

/// Headers attached to a dead-lettered record, in publish order
pub(crate) fn dead_letter_headers(
    message: &Message,
    error: &str,
    attempts: u32,
) -> Vec<(String, String)> {
    let mut headers: Vec<(String, String)> = message
        .headers
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    headers.sort();

    headers.extend([
        ("x-dlq-key".to_string(), message.key.clone()),
        ("x-dlq-source-topic".to_string(), message.topic.clone()),
        ("x-dlq-source-partition".to_string(), message.partition.to_string()),
        ("x-dlq-source-offset".to_string(), message.offset.to_string()),
        ("x-dlq-error".to_string(), error.to_string()),
        ("x-dlq-attempts".to_string(), attempts.to_string()),
        ("x-dlq-quarantined-at".to_string(), Utc::now().to_rfc3339()),
    ]);
    headers
}

#[async_trait]
impl DeadLetterQueue for KafkaDeadLetterQueue {
    async fn quarantine(&self, message: &Message, error: &str, attempts: u32) -> IdempotencyResult<()> {
        let headers = dead_letter_headers(message, error, attempts);
        let kafka_headers = headers.iter().fold(OwnedHeaders::new(), |acc, (key, value)| {
            acc.insert(Header {
                key: key.as_str(),
                value: Some(value.as_bytes()),
            })
        });

        let record = FutureRecord::to(&self.topic)
            .key(&message.key)
            .payload(&message.payload)
            .headers(kafka_headers);

        self.producer
            .send(record, self.delivery_timeout)
            .await
            .map_err(|(err, _)| IdempotencyError::Kafka(err))?;

        info!(
            key = %message.key,
            source_topic = %message.topic,
            dlq_topic = %self.topic,
            attempts = attempts,
            "Message published to dead-letter topic"
        );

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dead_letter_headers_keep_originals_and_add_context() {
        let message = Message::new("ORD-13", "trade.orders", 2, 99, b"{}".to_vec())
            .with_header("event_type", "trade.order.placed");

        let headers = dead_letter_headers(&message, "permanent processing error: bad side", 6);
        let lookup = |name: &str| {
            headers
                .iter()
                .find(|(k, _)| k == name)
                .map(|(_, v)| v.as_str())
        };

        assert_eq!(lookup("event_type"), Some("trade.order.placed"));
        assert_eq!(lookup("x-dlq-key"), Some("ORD-13"));
        assert_eq!(lookup("x-dlq-source-partition"), Some("2"));
        assert_eq!(lookup("x-dlq-source-offset"), Some("99"));
        assert_eq!(lookup("x-dlq-attempts"), Some("6"));
        assert!(lookup("x-dlq-error").unwrap().contains("bad side"));
    }

    #[tokio::test]
    async fn test_logging_queue_accepts_everything() {
        let message = Message::new("ORD-14", "trade.orders", 0, 0, Vec::new());
        LoggingDeadLetterQueue
            .quarantine(&message, "boom", 1)
            .await
            .unwrap();
    }
}
