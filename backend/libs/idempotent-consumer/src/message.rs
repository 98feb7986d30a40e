//! Broker-facing message model

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

use crate::error::{IdempotencyError, IdempotencyResult};

/// Header carrying the producer-assigned dedup key
pub const IDEMPOTENCY_KEY_HEADER: &str = "idempotency_key";

/// Maximum dedup key length (matches `processed_messages.message_key`)
pub const MAX_KEY_LEN: usize = 255;

/// An ordered, independently assigned subset of a topic
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TopicPartition {
    pub topic: String,
    pub partition: i32,
}

impl TopicPartition {
    pub fn new(topic: impl Into<String>, partition: i32) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }
}

impl fmt::Display for TopicPartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.topic, self.partition)
    }
}

/// Position of a handled message within its partition
///
/// Acknowledging a position means every message up to and including `offset`
/// reached a terminal verdict. Broker adapters translate this into their own
/// "next offset to read" convention.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumerPosition {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
}

/// Immutable unit of work delivered by the broker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Business/idempotency key, unique per logical action
    pub key: String,
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    /// Opaque business data
    pub payload: Vec<u8>,
    pub headers: HashMap<String, String>,
    pub received_at: DateTime<Utc>,
}

impl Message {
    pub fn new(
        key: impl Into<String>,
        topic: impl Into<String>,
        partition: i32,
        offset: i64,
        payload: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            key: key.into(),
            topic: topic.into(),
            partition,
            offset,
            payload: payload.into(),
            headers: HashMap::new(),
            received_at: Utc::now(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn topic_partition(&self) -> TopicPartition {
        TopicPartition::new(self.topic.clone(), self.partition)
    }

    pub fn position(&self) -> ConsumerPosition {
        ConsumerPosition {
            topic: self.topic.clone(),
            partition: self.partition,
            offset: self.offset,
        }
    }

    /// Deserialize the payload as JSON
    pub fn json<T: serde::de::DeserializeOwned>(&self) -> IdempotencyResult<T> {
        Ok(serde_json::from_slice(&self.payload)?)
    }
}

/// Pick the dedup key for a record: explicit header first, then the record key
pub fn extract_key(headers: &HashMap<String, String>, record_key: Option<&[u8]>) -> String {
    if let Some(key) = headers.get(IDEMPOTENCY_KEY_HEADER) {
        if !key.is_empty() {
            return key.clone();
        }
    }

    record_key
        .and_then(|k| std::str::from_utf8(k).ok())
        .map(str::to_string)
        .unwrap_or_default()
}

/// Validate dedup key format
pub fn validate_key(key: &str) -> IdempotencyResult<()> {
    if key.is_empty() {
        return Err(IdempotencyError::InvalidKey(
            "Dedup key cannot be empty".to_string(),
        ));
    }

    if key.len() > MAX_KEY_LEN {
        return Err(IdempotencyError::InvalidKey(format!(
            "Dedup key too long: {} characters (max {})",
            key.len(),
            MAX_KEY_LEN
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_key() {
        assert!(validate_key("ORD-42").is_ok());
        assert!(validate_key(&"x".repeat(255)).is_ok());

        let err = validate_key("").unwrap_err();
        assert!(matches!(err, IdempotencyError::InvalidKey(_)));

        let err = validate_key(&"x".repeat(256)).unwrap_err();
        assert!(matches!(err, IdempotencyError::InvalidKey(_)));
    }

    #[test]
    fn test_extract_key_prefers_header() {
        let mut headers = HashMap::new();
        headers.insert(IDEMPOTENCY_KEY_HEADER.to_string(), "ORD-42".to_string());

        assert_eq!(extract_key(&headers, Some(b"account-7")), "ORD-42");
    }

    #[test]
    fn test_extract_key_falls_back_to_record_key() {
        let headers = HashMap::new();
        assert_eq!(extract_key(&headers, Some(b"ORD-43")), "ORD-43");
        assert_eq!(extract_key(&headers, None), "");
        // Non UTF-8 record keys cannot serve as dedup keys
        assert_eq!(extract_key(&headers, Some(&[0xff, 0xfe])), "");
    }

    #[test]
    fn test_position_matches_message() {
        let message = Message::new("ORD-42", "trade.orders", 3, 17, b"{}".to_vec());
        let position = message.position();

        assert_eq!(position.topic, "trade.orders");
        assert_eq!(position.partition, 3);
        assert_eq!(position.offset, 17);
        assert_eq!(message.topic_partition().to_string(), "trade.orders/3");
    }
}
