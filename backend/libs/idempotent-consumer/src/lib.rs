//! # Idempotent Consumption Engine
//!
//! Turns at-least-once Kafka delivery into exactly-once business effects.
//! Every message carries a business key; a durable dedup store records each
//! key whose processing committed, in the same transaction as the effect.
//!
//! ## Problem
//!
//! Brokers redeliver on crashes, rebalances and producer retries:
//! - **Consumer crash after the effect**: the offset was never committed, so the
//!   message comes back
//! - **Rebalance**: the new owner of a partition replays from the last commit
//! - **Producer retry**: the same logical action arrives twice at different offsets
//!
//! ## Solution
//!
//! ```text
//! Kafka ─► ConsumptionLoop ─► partition worker ─► IdempotencyCoordinator
//!                                  │                   │  begin(key)
//!                                  │                   │  lookup ─► Duplicate
//!                                  │                   │  BusinessProcessor::execute
//!                                  │                   │  insert_if_absent + commit
//!                                  │                   ▼
//!                                  │               PostgreSQL
//!                                  │           (processed_messages)
//!                                  ▼
//!                      acknowledge ─► OutcomeSink / DeadLetterQueue
//! ```
//!
//! - A message is acknowledged only after its dedup record committed or it
//!   was identified as a duplicate
//! - Failures roll back and are retried with exponential backoff; after
//!   `max_retries` the message is quarantined and acknowledged
//! - Storage outages are retried indefinitely and never acknowledged
//! - The unique key in the store decides concurrent races, not in-process locks
//!
//! ## Usage
//!
//! ```ignore
//! use idempotent_consumer::{
//!     ConsumerConfig, ConsumptionLoop, IdempotencyCoordinator, KafkaMessageSource,
//!     KafkaSourceConfig, LoggingDeadLetterQueue, PgDedupStore, TracingOutcomeSink,
//! };
//! use std::sync::Arc;
//!
//! # async fn example(pool: sqlx::PgPool, processor: MyProcessor) -> anyhow::Result<()> {
//! let config = ConsumerConfig::from_env()?;
//! let store = Arc::new(PgDedupStore::new(pool));
//! store.migrate().await?;
//!
//! let coordinator = Arc::new(IdempotencyCoordinator::new(
//!     store,
//!     Arc::new(processor),
//!     config.processing_timeout(),
//! ));
//! let source = Arc::new(KafkaMessageSource::new(&KafkaSourceConfig::new(
//!     "localhost:9092",
//!     "trade-execution",
//!     vec!["trade.orders".to_string()],
//! ))?);
//!
//! let (_shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
//! ConsumptionLoop::new(
//!     coordinator,
//!     source,
//!     Arc::new(TracingOutcomeSink),
//!     Arc::new(LoggingDeadLetterQueue),
//!     config.loop_settings(),
//! )
//! .run(shutdown_rx)
//! .await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Key Strategies
//!
//! The key must identify the logical action, not the delivery:
//! - `idempotency_key` header set by the producer (preferred)
//! - Kafka record key, when it is a business identifier such as an order id
//!
//! Never derive the key from topic/partition/offset: a producer retry lands at
//! a new offset and would be processed twice.
//!
//! ## Retention
//!
//! Dedup records are expired by [`RetentionSweeper`]. The retention window
//! must outlive the broker's redelivery window; [`ConsumerConfig::validate`]
//! enforces this.

pub mod config;
pub mod consumer;
pub mod coordinator;
pub mod dead_letter;
mod error;
pub mod kafka;
pub mod message;
pub mod outcome;
pub mod processor;
pub mod retention;
pub mod retry;
pub mod sink;
pub mod store;

pub use config::ConsumerConfig;
pub use consumer::{ConsumptionLoop, LoopSettings, MessageSource, SourceEvent};
pub use coordinator::{payload_digest, IdempotencyCoordinator};
pub use dead_letter::{DeadLetterQueue, KafkaDeadLetterQueue, LoggingDeadLetterQueue};
pub use error::{IdempotencyError, IdempotencyResult};
pub use kafka::{KafkaMessageSource, KafkaSourceConfig};
pub use message::{ConsumerPosition, Message, TopicPartition, IDEMPOTENCY_KEY_HEADER};
pub use outcome::{OutcomeEvent, ProcessingOutcome};
pub use processor::{BusinessProcessor, ProcessingError};
pub use retention::RetentionSweeper;
pub use retry::RetryPolicy;
pub use sink::{
    ChannelOutcomeSink, FanoutOutcomeSink, OutcomeSink, PrometheusOutcomeSink, TracingOutcomeSink,
};
pub use store::{
    DedupRecord, DedupStore, DedupTransaction, InsertOutcome, MemoryDedupStore, PgDedupStore,
    PgDedupTransaction,
};
