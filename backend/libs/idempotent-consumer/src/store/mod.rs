//! Dedup store: durable ledger of committed message keys
//!
//! The store is the only source of truth for "already processed". Its
//! uniqueness constraint on the key decides who wins when several consumer
//! instances race on the same key; no in-process lock is relied upon.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::IdempotencyResult;

mod memory;
mod postgres;

pub use memory::{MemoryDedupStore, MemoryTransaction};
pub use postgres::{PgDedupStore, PgDedupTransaction};

/// Durable marker for a key whose processing committed
///
/// At most one record exists per key. Records are never updated; the
/// retention sweep may delete them once they fall out of the retention window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DedupRecord {
    pub key: String,
    pub processed_at: DateTime<Utc>,
    pub source_topic: String,
    /// Hex SHA-256 of the payload that produced the effect
    pub outcome_hash: Option<String>,
}

/// Result of `insert_if_absent`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    AlreadyExists,
}

/// Transaction scoped to one dedup key
///
/// Dropping a transaction without calling `commit` must roll it back.
#[async_trait]
pub trait DedupTransaction: Send {
    async fn lookup(&mut self, key: &str) -> IdempotencyResult<Option<DedupRecord>>;

    /// Insert the record unless one already exists for its key
    async fn insert_if_absent(&mut self, record: &DedupRecord) -> IdempotencyResult<InsertOutcome>;

    async fn commit(self) -> IdempotencyResult<()>;

    async fn rollback(self) -> IdempotencyResult<()>;
}

/// Transactional dedup ledger
#[async_trait]
pub trait DedupStore: Send + Sync + 'static {
    type Transaction: DedupTransaction + 'static;

    /// Begin a transaction scoped to `key`
    async fn begin(&self, key: &str) -> IdempotencyResult<Self::Transaction>;

    /// Read a record outside any transaction (used to resolve commit races)
    async fn lookup(&self, key: &str) -> IdempotencyResult<Option<DedupRecord>>;

    /// Delete records processed more than `retention` ago, returning how many
    async fn expire_older_than(&self, retention: Duration) -> IdempotencyResult<u64>;
}

pub(crate) fn retention_cutoff(retention: Duration) -> IdempotencyResult<DateTime<Utc>> {
    let retention = chrono::Duration::from_std(retention).map_err(|e| {
        crate::error::IdempotencyError::Config(format!("Invalid retention duration: {e}"))
    })?;
    Ok(Utc::now() - retention)
}
