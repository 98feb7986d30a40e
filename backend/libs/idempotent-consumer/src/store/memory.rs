//! In-memory dedup store
//!
//! Not durable: records vanish with the process. Meant for tests and local
//! runs. It mirrors the PostgreSQL store's contract (per-key serialization,
//! uniqueness checked at commit) and can inject storage faults.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OwnedMutexGuard;

use super::{retention_cutoff, DedupRecord, DedupStore, DedupTransaction, InsertOutcome};
use crate::error::{IdempotencyError, IdempotencyResult};

#[derive(Default)]
struct Inner {
    records: Mutex<HashMap<String, DedupRecord>>,
    key_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    disable_key_locks: AtomicBool,
    unavailable: AtomicBool,
    failing_commits: AtomicU32,
    lost_commit_acks: AtomicU32,
    insert_count: AtomicU32,
}

impl Inner {
    fn check_available(&self) -> IdempotencyResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(IdempotencyError::StorageUnavailable(
                "memory store marked unavailable".to_string(),
            ));
        }
        Ok(())
    }

    fn take_one(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

/// Dedup store kept in process memory
#[derive(Clone, Default)]
pub struct MemoryDedupStore {
    inner: Arc<Inner>,
}

impl MemoryDedupStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Skip per-key serialization so concurrent handlers reach the commit-time
    /// uniqueness check
    pub fn without_key_locks(self) -> Self {
        self.inner.disable_key_locks.store(true, Ordering::SeqCst);
        self
    }

    /// Make every operation fail as if the store were unreachable
    pub fn set_unavailable(&self, unavailable: bool) {
        self.inner.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Reject the next `n` commits without writing anything
    pub fn fail_next_commits(&self, n: u32) {
        self.inner.failing_commits.store(n, Ordering::SeqCst);
    }

    /// Apply the next `n` commits but report them as failed (acknowledgment lost)
    pub fn lose_next_commit_acks(&self, n: u32) {
        self.inner.lost_commit_acks.store(n, Ordering::SeqCst);
    }

    /// Insert a record directly, bypassing transactions
    pub fn seed(&self, record: DedupRecord) {
        self.inner.records.lock().insert(record.key.clone(), record);
    }

    pub fn get(&self, key: &str) -> Option<DedupRecord> {
        self.inner.records.lock().get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of records ever committed
    pub fn committed_inserts(&self) -> u32 {
        self.inner.insert_count.load(Ordering::SeqCst)
    }
}

/// Transaction against [`MemoryDedupStore`]
pub struct MemoryTransaction {
    inner: Arc<Inner>,
    key: String,
    staged: Option<DedupRecord>,
    key_guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for MemoryTransaction {
    fn drop(&mut self) {
        let Some(guard) = self.key_guard.take() else {
            return;
        };
        drop(guard);

        // Forget the key's lock once no other transaction holds or awaits it
        let mut locks = self.inner.key_locks.lock();
        if locks
            .get(&self.key)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(&self.key);
        }
    }
}

#[async_trait]
impl DedupTransaction for MemoryTransaction {
    async fn lookup(&mut self, key: &str) -> IdempotencyResult<Option<DedupRecord>> {
        self.inner.check_available()?;
        Ok(self.inner.records.lock().get(key).cloned())
    }

    async fn insert_if_absent(&mut self, record: &DedupRecord) -> IdempotencyResult<InsertOutcome> {
        self.inner.check_available()?;
        if self.inner.records.lock().contains_key(&record.key) {
            return Ok(InsertOutcome::AlreadyExists);
        }
        self.staged = Some(record.clone());
        Ok(InsertOutcome::Inserted)
    }

    async fn commit(mut self) -> IdempotencyResult<()> {
        self.inner.check_available()?;
        if Inner::take_one(&self.inner.failing_commits) {
            return Err(IdempotencyError::StorageUnavailable(
                "commit rejected".to_string(),
            ));
        }

        if let Some(record) = self.staged.take() {
            let mut records = self.inner.records.lock();
            if records.contains_key(&record.key) {
                return Err(IdempotencyError::UniqueViolation(record.key));
            }
            records.insert(record.key.clone(), record);
            self.inner.insert_count.fetch_add(1, Ordering::SeqCst);
        }

        if Inner::take_one(&self.inner.lost_commit_acks) {
            return Err(IdempotencyError::StorageUnavailable(
                "connection lost after commit".to_string(),
            ));
        }
        Ok(())
    }

    async fn rollback(self) -> IdempotencyResult<()> {
        Ok(())
    }
}

#[async_trait]
impl DedupStore for MemoryDedupStore {
    type Transaction = MemoryTransaction;

    async fn begin(&self, key: &str) -> IdempotencyResult<MemoryTransaction> {
        self.inner.check_available()?;

        let key_guard = if self.inner.disable_key_locks.load(Ordering::SeqCst) {
            None
        } else {
            let lock = self
                .inner
                .key_locks
                .lock()
                .entry(key.to_string())
                .or_default()
                .clone();
            Some(lock.lock_owned().await)
        };

        Ok(MemoryTransaction {
            inner: self.inner.clone(),
            key: key.to_string(),
            staged: None,
            key_guard,
        })
    }

    async fn lookup(&self, key: &str) -> IdempotencyResult<Option<DedupRecord>> {
        self.inner.check_available()?;
        Ok(self.inner.records.lock().get(key).cloned())
    }

    async fn expire_older_than(&self, retention: Duration) -> IdempotencyResult<u64> {
        self.inner.check_available()?;
        let cutoff = retention_cutoff(retention)?;

        let mut records = self.inner.records.lock();
        let before = records.len();
        records.retain(|_, record| record.processed_at >= cutoff);
        Ok((before - records.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn record(key: &str, age: chrono::Duration) -> DedupRecord {
        DedupRecord {
            key: key.to_string(),
            processed_at: Utc::now() - age,
            source_topic: "trade.orders".to_string(),
            outcome_hash: None,
        }
    }

    #[tokio::test]
    async fn test_commit_writes_staged_record() {
        let store = MemoryDedupStore::new();
        let mut tx = store.begin("ORD-1").await.unwrap();

        assert_eq!(tx.lookup("ORD-1").await.unwrap(), None);
        let outcome = tx
            .insert_if_absent(&record("ORD-1", chrono::Duration::zero()))
            .await
            .unwrap();
        assert_eq!(outcome, InsertOutcome::Inserted);
        assert!(store.is_empty(), "staged record must not be visible before commit");

        tx.commit().await.unwrap();
        assert_eq!(store.len(), 1);
        assert!(store.get("ORD-1").is_some());
    }

    #[tokio::test]
    async fn test_dropped_transaction_discards_record() {
        let store = MemoryDedupStore::new();
        {
            let mut tx = store.begin("ORD-2").await.unwrap();
            tx.insert_if_absent(&record("ORD-2", chrono::Duration::zero()))
                .await
                .unwrap();
        }
        assert!(store.is_empty());

        // Key lock released on drop
        let tx = store.begin("ORD-2").await.unwrap();
        tx.rollback().await.unwrap();
    }

    #[tokio::test]
    async fn test_key_locks_released_after_transactions_end() {
        let store = MemoryDedupStore::new();

        let mut tx = store.begin("ORD-5").await.unwrap();
        tx.insert_if_absent(&record("ORD-5", chrono::Duration::zero()))
            .await
            .unwrap();
        tx.commit().await.unwrap();

        let tx = store.begin("ORD-6").await.unwrap();
        tx.rollback().await.unwrap();

        assert!(store.inner.key_locks.lock().is_empty());
    }

    #[tokio::test]
    async fn test_key_lock_kept_while_waiter_queued() {
        let store = MemoryDedupStore::new();
        let first = store.begin("ORD-7").await.unwrap();

        let waiter = {
            let store = store.clone();
            tokio::spawn(async move { store.begin("ORD-7").await.map(|_| ()) })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        drop(first);
        assert_eq!(
            store.inner.key_locks.lock().len(),
            1,
            "lock stays while a waiter holds it"
        );

        waiter.await.unwrap().unwrap();
        assert!(store.inner.key_locks.lock().is_empty());
    }

    #[tokio::test]
    async fn test_commit_detects_concurrent_winner() {
        let store = MemoryDedupStore::new().without_key_locks();
        let mut first = store.begin("ORD-3").await.unwrap();
        let mut second = store.begin("ORD-3").await.unwrap();

        first
            .insert_if_absent(&record("ORD-3", chrono::Duration::zero()))
            .await
            .unwrap();
        second
            .insert_if_absent(&record("ORD-3", chrono::Duration::zero()))
            .await
            .unwrap();

        first.commit().await.unwrap();
        let err = second.commit().await.unwrap_err();
        assert!(err.is_duplicate_key());
        assert_eq!(store.committed_inserts(), 1);
    }

    #[tokio::test]
    async fn test_expire_older_than() {
        let store = MemoryDedupStore::new();
        store.seed(record("old", chrono::Duration::days(40)));
        store.seed(record("fresh", chrono::Duration::hours(1)));

        let deleted = store
            .expire_older_than(Duration::from_secs(30 * 86400))
            .await
            .unwrap();

        assert_eq!(deleted, 1);
        assert!(store.get("old").is_none());
        assert!(store.get("fresh").is_some());
    }

    #[tokio::test]
    async fn test_unavailable_store_fails_operations() {
        let store = MemoryDedupStore::new();
        store.set_unavailable(true);

        let err = store.begin("ORD-4").await.err().unwrap();
        assert!(err.is_storage());
    }
}
