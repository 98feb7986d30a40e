//! Kafka adapter for [`MessageSource`]
//!
//! Auto-commit is disabled: offsets are committed only when the consumption
//! loop acknowledges a message, so anything not acknowledged before a crash or
//! rebalance is redelivered from the last committed position.

use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{BaseConsumer, CommitMode, Consumer, ConsumerContext, Rebalance, StreamConsumer};
use rdkafka::error::KafkaResult;
use rdkafka::message::{BorrowedMessage, Headers};
use rdkafka::{ClientContext, Message as KafkaMessage, Offset, TopicPartitionList};
use std::collections::HashMap;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info, warn};

use crate::consumer::{MessageSource, SourceEvent};
use crate::error::IdempotencyResult;
use crate::message::{extract_key, ConsumerPosition, Message, TopicPartition};

/// Connection settings for [`KafkaMessageSource`]
#[derive(Debug, Clone)]
pub struct KafkaSourceConfig {
    pub brokers: String,
    pub group_id: String,
    pub topics: Vec<String>,
    pub session_timeout_ms: u32,
    pub max_poll_interval_ms: u32,
}

impl KafkaSourceConfig {
    pub fn new(brokers: impl Into<String>, group_id: impl Into<String>, topics: Vec<String>) -> Self {
        Self {
            brokers: brokers.into(),
            group_id: group_id.into(),
            topics,
            session_timeout_ms: 45_000,
            max_poll_interval_ms: 300_000,
        }
    }

    fn client_config(&self) -> ClientConfig {
        let mut config = ClientConfig::new();
        config
            .set("bootstrap.servers", &self.brokers)
            .set("group.id", &self.group_id)
            .set("enable.auto.commit", "false")
            .set("enable.auto.offset.store", "false")
            .set("auto.offset.reset", "earliest")
            .set("enable.partition.eof", "false")
            .set("session.timeout.ms", self.session_timeout_ms.to_string())
            .set("max.poll.interval.ms", self.max_poll_interval_ms.to_string());
        config
    }
}

fn partitions_of(list: &TopicPartitionList) -> Vec<TopicPartition> {
    list.elements()
        .iter()
        .map(|elem| TopicPartition::new(elem.topic(), elem.partition()))
        .collect()
}

/// Forwards rebalances from librdkafka's callback thread to the async side
pub struct RebalanceContext {
    events: mpsc::UnboundedSender<SourceEvent>,
}

impl ClientContext for RebalanceContext {}

impl ConsumerContext for RebalanceContext {
    fn pre_rebalance(&self, _base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance) {
        match rebalance {
            Rebalance::Revoke(partitions) => {
                if partitions.count() == 0 {
                    return;
                }
                let revoked = partitions_of(partitions);
                info!(partitions = ?revoked, "Partitions being revoked");
                if let Err(e) = self.events.send(SourceEvent::Revoked(revoked)) {
                    error!("Failed to forward revoke event: {}", e);
                }
            }
            Rebalance::Assign(partitions) => {
                debug!("Pre-rebalance assign event for {} partitions", partitions.count());
            }
            Rebalance::Error(e) => {
                error!("Rebalance error: {}", e);
            }
        }
    }

    fn post_rebalance(&self, _base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance) {
        if let Rebalance::Assign(partitions) = rebalance {
            if partitions.count() == 0 {
                return;
            }
            let assigned = partitions_of(partitions);
            info!(partitions = ?assigned, "Partitions assigned");
            if let Err(e) = self.events.send(SourceEvent::Assigned(assigned)) {
                error!("Failed to forward assign event: {}", e);
            }
        }
    }

    fn commit_callback(&self, result: KafkaResult<()>, offsets: &TopicPartitionList) {
        match result {
            Ok(()) => debug!("Committed offsets for {} partitions", offsets.count()),
            Err(e) => warn!("Failed to commit offsets: {}", e),
        }
    }
}

/// Kafka consumer with manual, per-message offset commits
pub struct KafkaMessageSource {
    consumer: StreamConsumer<RebalanceContext>,
    rebalances: Mutex<mpsc::UnboundedReceiver<SourceEvent>>,
}

impl KafkaMessageSource {
    /// Create the consumer and subscribe to the configured topics
    pub fn new(config: &KafkaSourceConfig) -> IdempotencyResult<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let consumer: StreamConsumer<RebalanceContext> = config
            .client_config()
            .create_with_context(RebalanceContext { events: tx })?;

        let topics: Vec<&str> = config.topics.iter().map(String::as_str).collect();
        consumer.subscribe(&topics)?;

        info!(
            brokers = %config.brokers,
            group_id = %config.group_id,
            topics = ?config.topics,
            "Kafka message source subscribed"
        );

        Ok(Self {
            consumer,
            rebalances: Mutex::new(rx),
        })
    }

    fn to_message(record: &BorrowedMessage<'_>) -> Message {
        let headers: HashMap<String, String> = record
            .headers()
            .map(|headers| {
                headers
                    .iter()
                    .filter_map(|header| {
                        let value = std::str::from_utf8(header.value?).ok()?;
                        Some((header.key.to_string(), value.to_string()))
                    })
                    .collect()
            })
            .unwrap_or_default();

        let key = extract_key(&headers, record.key());
        let mut message = Message::new(
            key,
            record.topic(),
            record.partition(),
            record.offset(),
            record.payload().unwrap_or_default().to_vec(),
        );
        message.headers = headers;
        message
    }
}

#[async_trait]
impl MessageSource for KafkaMessageSource {
    async fn next_event(&self) -> IdempotencyResult<Option<SourceEvent>> {
        let mut rebalances = self.rebalances.lock().await;

        tokio::select! {
            biased;

            Some(event) = rebalances.recv() => Ok(Some(event)),
            record = self.consumer.recv() => {
                let record = record?;
                Ok(Some(SourceEvent::Message(Self::to_message(&record))))
            }
        }
    }

    async fn acknowledge(&self, position: &ConsumerPosition) -> IdempotencyResult<()> {
        // Kafka commits the next offset to read
        let mut offsets = TopicPartitionList::new();
        offsets.add_partition_offset(
            &position.topic,
            position.partition,
            Offset::Offset(position.offset + 1),
        )?;
        self.consumer.commit(&offsets, CommitMode::Async)?;
        Ok(())
    }

    async fn pause(&self, partition: &TopicPartition) -> IdempotencyResult<()> {
        self.consumer.pause(&partition_list(partition))?;
        debug!(partition = %partition, "Paused fetching");
        Ok(())
    }

    async fn resume(&self, partition: &TopicPartition) -> IdempotencyResult<()> {
        self.consumer.resume(&partition_list(partition))?;
        debug!(partition = %partition, "Resumed fetching");
        Ok(())
    }
}

fn partition_list(partition: &TopicPartition) -> TopicPartitionList {
    let mut list = TopicPartitionList::new();
    list.add_partition(&partition.topic, partition.partition);
    list
}
