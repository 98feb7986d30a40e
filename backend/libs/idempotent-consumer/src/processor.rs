//! Business processor seam

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

use crate::message::Message;

/// Failure reported by a business processor
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProcessingError {
    /// Effect temporarily failed (downstream unavailable, lock timeout, ...)
    #[error("transient processing error: {0}")]
    Transient(String),

    /// Payload invalid or business rule irrecoverably violated
    #[error("permanent processing error: {0}")]
    Permanent(String),
}

impl ProcessingError {
    pub fn transient(err: impl std::fmt::Display) -> Self {
        ProcessingError::Transient(err.to_string())
    }

    pub fn permanent(err: impl std::fmt::Display) -> Self {
        ProcessingError::Permanent(err.to_string())
    }
}

impl From<anyhow::Error> for ProcessingError {
    fn from(err: anyhow::Error) -> Self {
        ProcessingError::Transient(format!("{err:#}"))
    }
}

/// Executes the domain action for a message
///
/// The coordinator invokes `execute` at most once per committed key, so
/// implementations do not need to be idempotent themselves. `tx` is the open
/// dedup-store transaction: processors whose effects live in the same
/// database should write through it so the effect and the dedup marker
/// commit together. Processors with external effects ignore it and implement
/// the trait for any `Tx`.
#[async_trait]
pub trait BusinessProcessor<Tx: Send>: Send + Sync {
    /// Effect result, reported through the outcome sink
    type Output: Serialize + Send + Sync;

    async fn execute(
        &self,
        message: &Message,
        tx: &mut Tx,
    ) -> Result<Self::Output, ProcessingError>;
}
