//! Error types for idempotent consumer library

use std::time::Duration;
use thiserror::Error;

use crate::processor::ProcessingError;

/// Result type for idempotency operations
pub type IdempotencyResult<T> = Result<T, IdempotencyError>;

/// Errors that can occur while handling a message
#[derive(Error, Debug)]
pub enum IdempotencyError {
    /// Database operation failed (connection, query execution, commit, etc.)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Dedup store could not be reached or refused the operation
    #[error("Dedup store unavailable: {0}")]
    StorageUnavailable(String),

    /// Commit rejected because another writer recorded the same key first
    #[error("Dedup key already recorded by a concurrent writer: {0}")]
    UniqueViolation(String),

    /// Business processor returned an error
    #[error("Processing failed: {0}")]
    Processing(#[from] ProcessingError),

    /// Processing attempt exceeded the configured timeout
    #[error("Processing timed out after {0:?}")]
    Timeout(Duration),

    /// Dedup key validation failed (empty, too long)
    #[error("Invalid dedup key: {0}")]
    InvalidKey(String),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Broker client error
    #[error("Kafka error: {0}")]
    Kafka(#[from] rdkafka::error::KafkaError),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Generic error with context
    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl IdempotencyError {
    /// Check if error is a duplicate key violation (another writer won the race)
    ///
    /// This is NOT an error condition for the caller - the coordinator resolves it
    /// to a duplicate outcome.
    pub fn is_duplicate_key(&self) -> bool {
        match self {
            IdempotencyError::UniqueViolation(_) => true,
            IdempotencyError::Database(sqlx_err) => {
                // PostgreSQL unique violation error code: 23505
                if let Some(db_err) = sqlx_err.as_database_error() {
                    db_err.code().as_deref() == Some("23505")
                } else {
                    false
                }
            }
            _ => false,
        }
    }

    /// Check if error comes from the dedup store rather than from the message
    ///
    /// Storage errors are retried without consuming the message's retry budget,
    /// since they say nothing about whether the message itself can be processed.
    pub fn is_storage(&self) -> bool {
        match self {
            IdempotencyError::StorageUnavailable(_) => true,
            IdempotencyError::Database(_) => !self.is_duplicate_key(),
            _ => false,
        }
    }

    /// Check if error can never succeed on retry
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            IdempotencyError::Processing(ProcessingError::Permanent(_))
                | IdempotencyError::InvalidKey(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let storage = IdempotencyError::StorageUnavailable("connection refused".into());
        assert!(storage.is_storage());
        assert!(!storage.is_permanent());
        assert!(!storage.is_duplicate_key());

        let pool = IdempotencyError::Database(sqlx::Error::PoolTimedOut);
        assert!(pool.is_storage());

        let race = IdempotencyError::UniqueViolation("ORD-42".into());
        assert!(race.is_duplicate_key());
        assert!(!race.is_storage());

        let permanent = IdempotencyError::Processing(ProcessingError::Permanent("bad".into()));
        assert!(permanent.is_permanent());
        assert!(!permanent.is_storage());

        let transient = IdempotencyError::Processing(ProcessingError::Transient("503".into()));
        assert!(!transient.is_permanent());
        assert!(!transient.is_storage());

        let timeout = IdempotencyError::Timeout(Duration::from_secs(1));
        assert!(!timeout.is_storage());
        assert!(!timeout.is_permanent());
    }
}
