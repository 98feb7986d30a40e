//! Processing outcomes

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::message::Message;

/// Result of handling one message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", content = "detail", rename_all = "snake_case")]
pub enum ProcessingOutcome<T> {
    /// First successful processing; carries the effect result
    Processed(T),

    /// Key was already committed before
    Duplicate {
        original_processed_at: DateTime<Utc>,
        /// Stored payload hash differs from this delivery's payload (key reuse)
        payload_mismatch: bool,
    },

    /// Quarantined after the retry budget ran out
    Failed { error: String, attempts: u32 },
}

impl<T> ProcessingOutcome<T> {
    /// Terminal verdicts that allow the consumer position to advance normally
    pub fn is_ok(&self) -> bool {
        matches!(
            self,
            ProcessingOutcome::Processed(_) | ProcessingOutcome::Duplicate { .. }
        )
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, ProcessingOutcome::Failed { .. })
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self, ProcessingOutcome::Duplicate { .. })
    }

    /// Short label used in logs and metrics
    pub fn label(&self) -> &'static str {
        match self {
            ProcessingOutcome::Processed(_) => "processed",
            ProcessingOutcome::Duplicate { .. } => "duplicate",
            ProcessingOutcome::Failed { .. } => "quarantined",
        }
    }

    pub fn map<U, F: FnOnce(T) -> U>(self, f: F) -> ProcessingOutcome<U> {
        match self {
            ProcessingOutcome::Processed(value) => ProcessingOutcome::Processed(f(value)),
            ProcessingOutcome::Duplicate {
                original_processed_at,
                payload_mismatch,
            } => ProcessingOutcome::Duplicate {
                original_processed_at,
                payload_mismatch,
            },
            ProcessingOutcome::Failed { error, attempts } => {
                ProcessingOutcome::Failed { error, attempts }
            }
        }
    }
}

/// Structured outcome emitted once per handled message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutcomeEvent {
    pub key: String,
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    /// Attempts made for this delivery, including the final one
    pub attempts: u32,
    pub outcome: ProcessingOutcome<serde_json::Value>,
    pub emitted_at: DateTime<Utc>,
}

impl OutcomeEvent {
    pub fn new(
        message: &Message,
        attempts: u32,
        outcome: ProcessingOutcome<serde_json::Value>,
    ) -> Self {
        Self {
            key: message.key.clone(),
            topic: message.topic.clone(),
            partition: message.partition,
            offset: message.offset,
            attempts,
            outcome,
            emitted_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_processing_outcome_helpers() {
        let processed: ProcessingOutcome<u32> = ProcessingOutcome::Processed(1);
        let duplicate: ProcessingOutcome<u32> = ProcessingOutcome::Duplicate {
            original_processed_at: Utc::now(),
            payload_mismatch: false,
        };
        let failed: ProcessingOutcome<u32> = ProcessingOutcome::Failed {
            error: "bad payload".to_string(),
            attempts: 4,
        };

        assert!(processed.is_ok());
        assert!(duplicate.is_ok());
        assert!(!failed.is_ok());

        assert!(!processed.is_failed());
        assert!(failed.is_failed());
        assert!(duplicate.is_duplicate());

        assert_eq!(processed.label(), "processed");
        assert_eq!(duplicate.label(), "duplicate");
        assert_eq!(failed.label(), "quarantined");
    }

    #[test]
    fn test_outcome_event_serializes_status_tag() {
        let message = Message::new("ORD-42", "trade.orders", 0, 7, b"{}".to_vec());
        let event = OutcomeEvent::new(
            &message,
            1,
            ProcessingOutcome::Processed(serde_json::json!({"execution_id": "abc"})),
        );

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["key"], "ORD-42");
        assert_eq!(json["outcome"]["status"], "processed");
    }
}
