//! Outcome sinks: fire-and-forget reporting of per-message outcomes
//!
//! `emit` is synchronous and cannot fail, so a slow or broken downstream can
//! never hold back an acknowledgment.

use prometheus::{IntCounter, IntCounterVec, Opts};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::outcome::{OutcomeEvent, ProcessingOutcome};

/// Receiver of structured outcomes
pub trait OutcomeSink: Send + Sync {
    fn emit(&self, event: OutcomeEvent);
}

/// Writes each outcome as a structured log line
#[derive(Debug, Default, Clone)]
pub struct TracingOutcomeSink;

impl OutcomeSink for TracingOutcomeSink {
    fn emit(&self, event: OutcomeEvent) {
        match &event.outcome {
            ProcessingOutcome::Processed(_) => info!(
                key = %event.key,
                topic = %event.topic,
                partition = event.partition,
                offset = event.offset,
                attempts = event.attempts,
                outcome = "processed",
                "Message outcome"
            ),
            ProcessingOutcome::Duplicate {
                original_processed_at,
                payload_mismatch,
            } => debug!(
                key = %event.key,
                topic = %event.topic,
                partition = event.partition,
                offset = event.offset,
                original_processed_at = %original_processed_at,
                payload_mismatch = *payload_mismatch,
                outcome = "duplicate",
                "Message outcome"
            ),
            ProcessingOutcome::Failed { error, attempts } => error!(
                key = %event.key,
                topic = %event.topic,
                partition = event.partition,
                offset = event.offset,
                attempts = *attempts,
                error = %error,
                outcome = "quarantined",
                "Message outcome"
            ),
        }
    }
}

/// Forwards outcomes to an async consumer (audit writer, tests)
///
/// Uses `try_send`: when the channel is full or closed the event is dropped
/// with a warning.
#[derive(Debug, Clone)]
pub struct ChannelOutcomeSink {
    tx: mpsc::Sender<OutcomeEvent>,
}

impl ChannelOutcomeSink {
    pub fn new(tx: mpsc::Sender<OutcomeEvent>) -> Self {
        Self { tx }
    }

    /// Create a sink together with its receiving end
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<OutcomeEvent>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }
}

impl OutcomeSink for ChannelOutcomeSink {
    fn emit(&self, event: OutcomeEvent) {
        if let Err(e) = self.tx.try_send(event) {
            let event = match &e {
                mpsc::error::TrySendError::Full(event) | mpsc::error::TrySendError::Closed(event) => {
                    event
                }
            };
            warn!(
                key = %event.key,
                outcome = event.outcome.label(),
                error = %e,
                "Dropping outcome event"
            );
        }
    }
}

/// Prometheus counters per outcome
#[derive(Clone)]
pub struct PrometheusOutcomeSink {
    outcomes: IntCounterVec,
    payload_mismatches: IntCounter,
}

impl PrometheusOutcomeSink {
    /// Create the counters and register them in the default registry
    ///
    /// Build one per consumer label per process: a second registration of the
    /// same label fails with [`prometheus::Error::AlreadyReg`].
    pub fn new(consumer: &str) -> Result<Self, prometheus::Error> {
        let registry = prometheus::default_registry();

        let outcomes = IntCounterVec::new(
            Opts::new(
                "idempotent_consumer_outcomes_total",
                "Messages handled by outcome (processed, duplicate, quarantined)",
            )
            .const_label("consumer", consumer.to_string()),
            &["outcome"],
        )?;

        let payload_mismatches = IntCounter::with_opts(
            Opts::new(
                "idempotent_consumer_payload_mismatch_total",
                "Duplicates whose payload differed from the originally processed one",
            )
            .const_label("consumer", consumer.to_string()),
        )?;

        registry.register(Box::new(outcomes.clone()))?;
        if let Err(e) = registry.register(Box::new(payload_mismatches.clone())) {
            let _ = registry.unregister(Box::new(outcomes.clone()));
            return Err(e);
        }

        Ok(Self {
            outcomes,
            payload_mismatches,
        })
    }

    pub fn count(&self, outcome: &str) -> u64 {
        self.outcomes.with_label_values(&[outcome]).get()
    }
}

impl OutcomeSink for PrometheusOutcomeSink {
    fn emit(&self, event: OutcomeEvent) {
        self.outcomes
            .with_label_values(&[event.outcome.label()])
            .inc();

        if let ProcessingOutcome::Duplicate {
            payload_mismatch: true,
            ..
        } = event.outcome
        {
            self.payload_mismatches.inc();
        }
    }
}

/// Sends every outcome to each inner sink
#[derive(Clone, Default)]
pub struct FanoutOutcomeSink {
    sinks: Vec<Arc<dyn OutcomeSink>>,
}

impl FanoutOutcomeSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: Arc<dyn OutcomeSink>) -> Self {
        self.sinks.push(sink);
        self
    }
}

impl OutcomeSink for FanoutOutcomeSink {
    fn emit(&self, event: OutcomeEvent) {
        if let Some((last, rest)) = self.sinks.split_last() {
            for sink in rest {
                sink.emit(event.clone());
            }
            last.emit(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Message;

    fn processed(key: &str) -> OutcomeEvent {
        OutcomeEvent::new(
            &Message::new(key, "trade.orders", 0, 0, Vec::new()),
            1,
            ProcessingOutcome::Processed(serde_json::Value::Null),
        )
    }

    #[tokio::test]
    async fn test_channel_sink_never_blocks_when_full() {
        let (sink, mut rx) = ChannelOutcomeSink::channel(1);

        sink.emit(processed("ORD-1"));
        sink.emit(processed("ORD-2")); // dropped

        assert_eq!(rx.recv().await.unwrap().key, "ORD-1");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_channel_sink_tolerates_closed_receiver() {
        let (sink, rx) = ChannelOutcomeSink::channel(4);
        drop(rx);
        sink.emit(processed("ORD-3"));
    }

    #[tokio::test]
    async fn test_fanout_reaches_every_sink() {
        let (first, mut first_rx) = ChannelOutcomeSink::channel(4);
        let (second, mut second_rx) = ChannelOutcomeSink::channel(4);
        let fanout = FanoutOutcomeSink::new()
            .with(Arc::new(first))
            .with(Arc::new(TracingOutcomeSink))
            .with(Arc::new(second));

        fanout.emit(processed("ORD-4"));

        assert_eq!(first_rx.recv().await.unwrap().key, "ORD-4");
        assert_eq!(second_rx.recv().await.unwrap().key, "ORD-4");
    }

    #[test]
    fn test_prometheus_sink_counts_by_label() {
        let sink = PrometheusOutcomeSink::new("sink-unit-test").unwrap();
        sink.emit(processed("ORD-5"));
        sink.emit(OutcomeEvent::new(
            &Message::new("ORD-5", "trade.orders", 0, 1, Vec::new()),
            1,
            ProcessingOutcome::Duplicate {
                original_processed_at: chrono::Utc::now(),
                payload_mismatch: true,
            },
        ));

        assert_eq!(sink.count("processed"), 1);
        assert_eq!(sink.count("duplicate"), 1);
        assert_eq!(sink.payload_mismatches.get(), 1);
    }

    #[test]
    fn test_prometheus_sink_rejects_duplicate_registration() {
        let first = PrometheusOutcomeSink::new("sink-duplicate-test").unwrap();

        let err = PrometheusOutcomeSink::new("sink-duplicate-test").err().unwrap();
        assert!(matches!(err, prometheus::Error::AlreadyReg));

        // The first sink still owns the registered counters
        first.emit(processed("ORD-6"));
        assert_eq!(first.count("processed"), 1);
    }
}
