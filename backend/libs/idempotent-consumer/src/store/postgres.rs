//! PostgreSQL dedup store
//!
//! Records live in `processed_messages` (see `migrations/`). Each transaction
//! takes a transaction-scoped advisory lock on the key, so two instances
//! handling the same key run one after the other: the second one sees the
//! first one's committed record and never invokes the processor. The primary
//! key on `message_key` remains the arbiter if the lock is ever bypassed.

use anyhow::Context;
use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgRow};
use sqlx::{PgConnection, Postgres, Row, Transaction};
use std::time::Duration;
use tracing::{debug, info};

use super::{retention_cutoff, DedupRecord, DedupStore, DedupTransaction, InsertOutcome};
use crate::error::IdempotencyResult;

/// Dedup store backed by a PostgreSQL pool
#[derive(Clone)]
pub struct PgDedupStore {
    pool: PgPool,
}

impl PgDedupStore {
    /// Create a new store
    ///
    /// # Arguments
    ///
    /// * `pool` - PostgreSQL connection pool
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Apply the bundled migrations (`processed_messages` table and indexes)
    ///
    /// Services sharing the database keep their own migration sets, so
    /// versions applied by them are ignored here.
    pub async fn migrate(&self) -> IdempotencyResult<()> {
        let mut migrator = sqlx::migrate!("./migrations");
        migrator.set_ignore_missing(true);
        migrator
            .run(&self.pool)
            .await
            .context("Failed to run dedup store migrations")?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

/// Open transaction holding the advisory lock for one key
pub struct PgDedupTransaction {
    tx: Transaction<'static, Postgres>,
}

impl PgDedupTransaction {
    /// Connection of the open transaction
    ///
    /// Business writes issued through it commit or roll back together with
    /// the dedup record.
    pub fn connection(&mut self) -> &mut PgConnection {
        &mut self.tx
    }
}

fn record_from_row(row: &PgRow) -> Result<DedupRecord, sqlx::Error> {
    Ok(DedupRecord {
        key: row.try_get("message_key")?,
        processed_at: row.try_get("processed_at")?,
        source_topic: row.try_get("source_topic")?,
        outcome_hash: row.try_get("outcome_hash")?,
    })
}

const SELECT_RECORD: &str = r#"
    SELECT message_key, processed_at, source_topic, outcome_hash
    FROM processed_messages
    WHERE message_key = $1
"#;

#[async_trait]
impl DedupTransaction for PgDedupTransaction {
    async fn lookup(&mut self, key: &str) -> IdempotencyResult<Option<DedupRecord>> {
        let row = sqlx::query(SELECT_RECORD)
            .bind(key)
            .fetch_optional(&mut *self.tx)
            .await?;

        Ok(row.as_ref().map(record_from_row).transpose()?)
    }

    async fn insert_if_absent(&mut self, record: &DedupRecord) -> IdempotencyResult<InsertOutcome> {
        // ON CONFLICT DO NOTHING: a concurrent winner shows up as 0 rows affected
        let result = sqlx::query(
            r#"
            INSERT INTO processed_messages (message_key, processed_at, source_topic, outcome_hash)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (message_key) DO NOTHING
            "#,
        )
        .bind(&record.key)
        .bind(record.processed_at)
        .bind(&record.source_topic)
        .bind(&record.outcome_hash)
        .execute(&mut *self.tx)
        .await?;

        if result.rows_affected() > 0 {
            Ok(InsertOutcome::Inserted)
        } else {
            debug!(key = %record.key, "Dedup record already present at insert");
            Ok(InsertOutcome::AlreadyExists)
        }
    }

    async fn commit(self) -> IdempotencyResult<()> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self) -> IdempotencyResult<()> {
        self.tx.rollback().await?;
        Ok(())
    }
}

#[async_trait]
impl DedupStore for PgDedupStore {
    type Transaction = PgDedupTransaction;

    async fn begin(&self, key: &str) -> IdempotencyResult<PgDedupTransaction> {
        let mut tx = self.pool.begin().await?;

        // Released automatically at commit/rollback
        sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1, 0))")
            .bind(key)
            .execute(&mut *tx)
            .await?;

        Ok(PgDedupTransaction { tx })
    }

    async fn lookup(&self, key: &str) -> IdempotencyResult<Option<DedupRecord>> {
        let row = sqlx::query(SELECT_RECORD)
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.as_ref().map(record_from_row).transpose()?)
    }

    async fn expire_older_than(&self, retention: Duration) -> IdempotencyResult<u64> {
        let cutoff_time = retention_cutoff(retention)?;

        let result = sqlx::query(
            r#"
            DELETE FROM processed_messages
            WHERE processed_at < $1
            "#,
        )
        .bind(cutoff_time)
        .execute(&self.pool)
        .await?;

        let deleted_count = result.rows_affected();
        if deleted_count > 0 {
            info!(
                deleted_count = deleted_count,
                cutoff_time = %cutoff_time,
                "Expired dedup records past retention"
            );
        }

        Ok(deleted_count)
    }
}
