//! Periodic expiry of old dedup records

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{error, info};

use crate::error::IdempotencyResult;
use crate::store::DedupStore;

/// Deletes dedup records older than the retention window on a fixed interval
///
/// The window must exceed the longest time a message can be redelivered,
/// otherwise a late redelivery would be processed a second time.
pub struct RetentionSweeper<S: DedupStore> {
    store: Arc<S>,
    retention: Duration,
    interval: Duration,
}

impl<S: DedupStore> RetentionSweeper<S> {
    pub fn new(store: Arc<S>, retention: Duration, interval: Duration) -> Self {
        Self {
            store,
            retention,
            interval,
        }
    }

    /// Run one sweep
    pub async fn sweep(&self) -> IdempotencyResult<u64> {
        let deleted = self.store.expire_older_than(self.retention).await?;
        if deleted > 0 {
            info!(
                deleted = deleted,
                retention_secs = self.retention.as_secs(),
                "Expired dedup records"
            );
        }
        Ok(deleted)
    }

    /// Sweep every `interval` until `shutdown` flips to `true`
    ///
    /// Sweep failures are logged and retried on the next tick.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            retention_secs = self.retention.as_secs(),
            interval_secs = self.interval.as_secs(),
            "Dedup retention sweeper started"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.sweep().await {
                        error!(error = %e, "Dedup retention sweep failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Dedup retention sweeper stopping");
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{DedupRecord, MemoryDedupStore};
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
    async fn test_sweep_deletes_only_expired_records() {
        let store = MemoryDedupStore::new();
        store.seed(record("ORD-old", chrono::Duration::days(31)));
        store.seed(record("ORD-new", chrono::Duration::days(1)));

        let sweeper = RetentionSweeper::new(
            Arc::new(store.clone()),
            Duration::from_secs(30 * 86_400),
            Duration::from_secs(3600),
        );

        assert_eq!(sweeper.sweep().await.unwrap(), 1);
        assert!(store.get("ORD-old").is_none());
        assert!(store.get("ORD-new").is_some());
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let store = MemoryDedupStore::new();
        store.seed(record("ORD-old", chrono::Duration::days(31)));
        let sweeper = RetentionSweeper::new(
            Arc::new(store.clone()),
            Duration::from_secs(30 * 86_400),
            Duration::from_millis(10),
        );

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(sweeper.run(shutdown_rx));

        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("sweeper stops")
            .unwrap();

        assert!(store.is_empty());
    }
}
