//! Idempotency coordinator: check, act and record as one transaction

use chrono::Utc;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::{IdempotencyError, IdempotencyResult};
use crate::message::{validate_key, Message};
use crate::outcome::ProcessingOutcome;
use crate::processor::BusinessProcessor;
use crate::store::{DedupRecord, DedupStore, DedupTransaction, InsertOutcome};

/// Hex SHA-256 of a payload, stored with the dedup record
pub fn payload_digest(payload: &[u8]) -> String {
    hex::encode(Sha256::digest(payload))
}

/// Orchestrates the check-then-act-then-record protocol for each message
///
/// Per message:
/// 1. Begin a store transaction scoped to the key
/// 2. Look up the key; if present return `Duplicate` (nothing is written)
/// 3. Otherwise run the business processor; on error roll back and propagate
/// 4. Insert the dedup record in the same transaction and commit
/// 5. Return `Processed` only once the commit succeeded
///
/// If the insert or commit loses a uniqueness race the record is re-read and
/// the call resolves to `Duplicate`. Every other failure is propagated so the
/// caller does not acknowledge the message.
///
/// Thread-safe and can be shared across partition workers using `Arc`.
pub struct IdempotencyCoordinator<S, P>
where
    S: DedupStore,
    P: BusinessProcessor<S::Transaction>,
{
    store: Arc<S>,
    processor: Arc<P>,
    processing_timeout: Duration,
}

impl<S, P> IdempotencyCoordinator<S, P>
where
    S: DedupStore,
    P: BusinessProcessor<S::Transaction>,
{
    /// Create a new coordinator
    ///
    /// # Arguments
    ///
    /// * `store` - Dedup store shared by every consumer instance
    /// * `processor` - Business effect executor
    /// * `processing_timeout` - Upper bound for one whole attempt (lookup, effect, commit)
    pub fn new(store: Arc<S>, processor: Arc<P>, processing_timeout: Duration) -> Self {
        Self {
            store,
            processor,
            processing_timeout,
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Handle one delivery of `message`
    ///
    /// Never returns `ProcessingOutcome::Failed`; failures come back as `Err`.
    /// On timeout the in-flight transaction is dropped, which rolls it back and
    /// leaves the key eligible for retry.
    pub async fn handle(&self, message: &Message) -> IdempotencyResult<ProcessingOutcome<P::Output>> {
        validate_key(&message.key)?;

        match tokio::time::timeout(self.processing_timeout, self.handle_in_transaction(message))
            .await
        {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    key = %message.key,
                    topic = %message.topic,
                    partition = message.partition,
                    offset = message.offset,
                    timeout_ms = self.processing_timeout.as_millis() as u64,
                    "Processing attempt timed out, transaction rolled back"
                );
                Err(IdempotencyError::Timeout(self.processing_timeout))
            }
        }
    }

    async fn handle_in_transaction(
        &self,
        message: &Message,
    ) -> IdempotencyResult<ProcessingOutcome<P::Output>> {
        let digest = payload_digest(&message.payload);
        let mut tx = self.store.begin(&message.key).await?;

        if let Some(existing) = tx.lookup(&message.key).await? {
            if let Err(e) = tx.rollback().await {
                debug!(key = %message.key, error = %e, "Rollback of read-only transaction failed");
            }
            return Ok(self.duplicate(message, &existing, &digest));
        }

        let effect = match self.processor.execute(message, &mut tx).await {
            Ok(effect) => effect,
            Err(err) => {
                warn!(
                    key = %message.key,
                    topic = %message.topic,
                    partition = message.partition,
                    offset = message.offset,
                    error = %err,
                    "Business processor failed, no dedup record written"
                );
                if let Err(e) = tx.rollback().await {
                    debug!(key = %message.key, error = %e, "Rollback after processor failure failed");
                }
                return Err(err.into());
            }
        };

        let record = DedupRecord {
            key: message.key.clone(),
            processed_at: Utc::now(),
            source_topic: message.topic.clone(),
            outcome_hash: Some(digest.clone()),
        };

        match tx.insert_if_absent(&record).await {
            Ok(InsertOutcome::Inserted) => {}
            Ok(InsertOutcome::AlreadyExists) => {
                if let Err(e) = tx.rollback().await {
                    debug!(key = %message.key, error = %e, "Rollback after lost insert race failed");
                }
                return self.resolve_race(message, &digest).await;
            }
            Err(err) if err.is_duplicate_key() => {
                return self.resolve_race(message, &digest).await;
            }
            Err(err) => return Err(err),
        }

        match tx.commit().await {
            Ok(()) => {
                info!(
                    key = %message.key,
                    topic = %message.topic,
                    partition = message.partition,
                    offset = message.offset,
                    "Message processed and dedup record committed"
                );
                Ok(ProcessingOutcome::Processed(effect))
            }
            Err(err) if err.is_duplicate_key() => self.resolve_race(message, &digest).await,
            Err(err) => Err(err),
        }
    }

    /// A concurrent writer committed the key first: its record decides the outcome
    async fn resolve_race(
        &self,
        message: &Message,
        digest: &str,
    ) -> IdempotencyResult<ProcessingOutcome<P::Output>> {
        match self.store.lookup(&message.key).await? {
            Some(existing) => {
                info!(
                    key = %message.key,
                    "Lost dedup insert race to a concurrent consumer, treating as duplicate"
                );
                Ok(self.duplicate(message, &existing, digest))
            }
            None => Err(IdempotencyError::StorageUnavailable(format!(
                "uniqueness conflict for key {} but no dedup record found",
                message.key
            ))),
        }
    }

    fn duplicate(
        &self,
        message: &Message,
        existing: &DedupRecord,
        digest: &str,
    ) -> ProcessingOutcome<P::Output> {
        let payload_mismatch = existing
            .outcome_hash
            .as_deref()
            .is_some_and(|stored| stored != digest);

        if payload_mismatch {
            warn!(
                key = %message.key,
                topic = %message.topic,
                offset = message.offset,
                original_topic = %existing.source_topic,
                "Dedup key reused with a different payload; skipping as duplicate"
            );
        } else {
            debug!(
                key = %message.key,
                topic = %message.topic,
                offset = message.offset,
                original_processed_at = %existing.processed_at,
                "Message already processed, skipping"
            );
        }

        ProcessingOutcome::Duplicate {
            original_processed_at: existing.processed_at,
            payload_mismatch,
        }
    }
}
