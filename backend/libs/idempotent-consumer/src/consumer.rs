//! Consumption loop: ordered, per-partition delivery into the coordinator
//!
//! ```text
//! MessageSource ──► dispatcher ──► partition worker (one per partition)
//!                                     │ handle() via coordinator
//!                                     │ retry / quarantine
//!                                     ▼
//!                           acknowledge ──► OutcomeSink
//! ```
//!
//! Each partition has one worker that handles messages strictly in delivery
//! order, so a failing message holds back the rest of its partition until it
//! succeeds or is quarantined. Different partitions progress independently:
//! the dispatcher never waits on a worker. When a partition's buffer is full
//! its further messages are parked in a backlog and the partition is paused
//! at the source until the worker catches up.
//! The loop keeps no state that matters across rebalances: a newly assigned
//! partition resumes from the position the broker has recorded, and the dedup
//! store filters anything already processed.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::coordinator::IdempotencyCoordinator;
use crate::dead_letter::DeadLetterQueue;
use crate::error::IdempotencyResult;
use crate::message::{ConsumerPosition, Message, TopicPartition};
use crate::outcome::{OutcomeEvent, ProcessingOutcome};
use crate::processor::BusinessProcessor;
use crate::retry::{AttemptState, RetryDecision, RetryPolicy};
use crate::sink::OutcomeSink;
use crate::store::DedupStore;

/// Event surfaced by the broker
#[derive(Debug, Clone, PartialEq)]
pub enum SourceEvent {
    Message(Message),
    /// Partitions now owned by this instance
    Assigned(Vec<TopicPartition>),
    /// Partitions taken away from this instance
    Revoked(Vec<TopicPartition>),
}

/// Broker boundary: delivery plus manual acknowledgment
#[async_trait]
pub trait MessageSource: Send + Sync + 'static {
    /// Next event; `None` once the source is closed
    async fn next_event(&self) -> IdempotencyResult<Option<SourceEvent>>;

    /// Record that the message at `position` reached a terminal verdict
    async fn acknowledge(&self, position: &ConsumerPosition) -> IdempotencyResult<()>;

    /// Stop fetching `partition` until [`MessageSource::resume`]
    async fn pause(&self, _partition: &TopicPartition) -> IdempotencyResult<()> {
        Ok(())
    }

    async fn resume(&self, _partition: &TopicPartition) -> IdempotencyResult<()> {
        Ok(())
    }
}

/// Tunables of the consumption loop
#[derive(Debug, Clone)]
pub struct LoopSettings {
    pub retry: RetryPolicy,
    /// Messages buffered per partition while its worker is busy
    pub partition_buffer: usize,
    /// Pause after a source error before polling again
    pub source_error_backoff: Duration,
}

impl Default for LoopSettings {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            partition_buffer: 256,
            source_error_backoff: Duration::from_secs(1),
        }
    }
}

struct WorkerHandle {
    tx: mpsc::Sender<Message>,
    stop_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// Pulls messages from a source and drives them through the coordinator
pub struct ConsumptionLoop<S, P, Src>
where
    S: DedupStore,
    P: BusinessProcessor<S::Transaction> + 'static,
    Src: MessageSource,
{
    coordinator: Arc<IdempotencyCoordinator<S, P>>,
    source: Arc<Src>,
    sink: Arc<dyn OutcomeSink>,
    dead_letter: Arc<dyn DeadLetterQueue>,
    settings: LoopSettings,
    /// Signalled by workers whenever they take a message off their channel
    capacity: Arc<Notify>,
}

/// Messages waiting for room in a paused partition's channel
type Backlogs = HashMap<TopicPartition, VecDeque<Message>>;

impl<S, P, Src> ConsumptionLoop<S, P, Src>
where
    S: DedupStore,
    P: BusinessProcessor<S::Transaction> + 'static,
    Src: MessageSource,
{
    pub fn new(
        coordinator: Arc<IdempotencyCoordinator<S, P>>,
        source: Arc<Src>,
        sink: Arc<dyn OutcomeSink>,
        dead_letter: Arc<dyn DeadLetterQueue>,
        settings: LoopSettings,
    ) -> Self {
        Self {
            coordinator,
            source,
            sink,
            dead_letter,
            settings,
            capacity: Arc::new(Notify::new()),
        }
    }

    /// Run until the source closes or `shutdown` flips to `true`
    ///
    /// On exit every worker is stopped and awaited; a worker in the middle of
    /// a retry gives up without acknowledging, so the message is redelivered
    /// to whoever owns the partition next.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> IdempotencyResult<()> {
        info!(
            max_retries = self.settings.retry.max_retries,
            partition_buffer = self.settings.partition_buffer,
            "Consumption loop starting"
        );

        let mut workers: HashMap<TopicPartition, WorkerHandle> = HashMap::new();
        let mut backlogs: Backlogs = HashMap::new();

        loop {
            let event = tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Shutdown signal received, stopping consumption loop");
                        break;
                    }
                    continue;
                }
                _ = self.capacity.notified(), if !backlogs.is_empty() => {
                    self.flush_backlogs(&mut workers, &mut backlogs).await;
                    continue;
                }
                event = self.source.next_event() => event,
            };

            match event {
                Ok(Some(SourceEvent::Message(message))) => {
                    self.dispatch(&mut workers, &mut backlogs, message).await;
                }
                Ok(Some(SourceEvent::Assigned(partitions))) => {
                    info!(
                        partitions = ?partitions,
                        "Partitions assigned, resuming from last acknowledged positions"
                    );
                }
                Ok(Some(SourceEvent::Revoked(partitions))) => {
                    for partition in partitions {
                        if let Some(backlog) = backlogs.remove(&partition) {
                            debug!(
                                partition = %partition,
                                discarded = backlog.len(),
                                "Discarding backlog of revoked partition"
                            );
                        }
                        if let Some(worker) = workers.remove(&partition) {
                            info!(partition = %partition, "Partition revoked, stopping worker");
                            Self::stop_worker(worker).await;
                        }
                    }
                }
                Ok(None) => {
                    info!("Message source closed");
                    break;
                }
                Err(e) => {
                    error!(error = %e, "Message source error");
                    tokio::time::sleep(self.settings.source_error_backoff).await;
                }
            }
        }

        for (partition, worker) in workers.drain() {
            debug!(partition = %partition, "Stopping partition worker");
            Self::stop_worker(worker).await;
        }

        info!("Consumption loop stopped");
        Ok(())
    }

    /// Hand `message` to its partition's worker without waiting
    async fn dispatch(
        &self,
        workers: &mut HashMap<TopicPartition, WorkerHandle>,
        backlogs: &mut Backlogs,
        message: Message,
    ) {
        let partition = message.topic_partition();

        // Keep delivery order behind anything already parked
        if let Some(backlog) = backlogs.get_mut(&partition) {
            backlog.push_back(message);
            return;
        }

        let worker = self.worker_for(workers, &partition).await;
        match worker.tx.try_send(message) {
            Ok(()) => {}
            Err(TrySendError::Full(message)) => {
                backlogs
                    .entry(partition.clone())
                    .or_default()
                    .push_back(message);
                debug!(partition = %partition, "Partition buffer full, pausing partition");
                if let Err(e) = self.source.pause(&partition).await {
                    warn!(partition = %partition, error = %e, "Failed to pause partition");
                }
            }
            Err(TrySendError::Closed(message)) => {
                warn!(
                    partition = %partition,
                    offset = message.offset,
                    "Partition worker gone, message left for redelivery"
                );
            }
        }
    }

    /// Move parked messages into worker channels; resume drained partitions
    async fn flush_backlogs(
        &self,
        workers: &mut HashMap<TopicPartition, WorkerHandle>,
        backlogs: &mut Backlogs,
    ) {
        let partitions: Vec<TopicPartition> = backlogs.keys().cloned().collect();

        for partition in partitions {
            let Some(mut backlog) = backlogs.remove(&partition) else {
                continue;
            };
            let worker = self.worker_for(workers, &partition).await;

            while let Some(message) = backlog.pop_front() {
                match worker.tx.try_send(message) {
                    Ok(()) => {}
                    Err(TrySendError::Full(message)) => {
                        backlog.push_front(message);
                        break;
                    }
                    Err(TrySendError::Closed(message)) => {
                        warn!(
                            partition = %partition,
                            offset = message.offset,
                            dropped = backlog.len() + 1,
                            "Partition worker gone, backlog left for redelivery"
                        );
                        backlog.clear();
                        break;
                    }
                }
            }

            if backlog.is_empty() {
                debug!(partition = %partition, "Partition backlog drained, resuming partition");
                if let Err(e) = self.source.resume(&partition).await {
                    warn!(partition = %partition, error = %e, "Failed to resume partition");
                }
            } else {
                backlogs.insert(partition, backlog);
            }
        }
    }

    /// Live worker for `partition`, replacing one that exited
    async fn worker_for<'a>(
        &self,
        workers: &'a mut HashMap<TopicPartition, WorkerHandle>,
        partition: &TopicPartition,
    ) -> &'a WorkerHandle {
        let finished = workers
            .get(partition)
            .map(|worker| worker.task.is_finished())
            .unwrap_or(true);
        if finished {
            if let Some(stale) = workers.remove(partition) {
                Self::stop_worker(stale).await;
            }
            workers.insert(partition.clone(), self.spawn_worker(partition.clone()));
        }
        &workers[partition]
    }

    fn spawn_worker(&self, partition: TopicPartition) -> WorkerHandle {
        let (tx, rx) = mpsc::channel(self.settings.partition_buffer.max(1));
        let (stop_tx, stop_rx) = watch::channel(false);

        let worker = PartitionWorker {
            partition: partition.clone(),
            rx,
            stop_rx,
            coordinator: self.coordinator.clone(),
            source: self.source.clone(),
            sink: self.sink.clone(),
            dead_letter: self.dead_letter.clone(),
            retry: self.settings.retry.clone(),
            capacity: self.capacity.clone(),
            last_acknowledged: None,
        };

        debug!(partition = %partition, "Spawning partition worker");
        WorkerHandle {
            tx,
            stop_tx,
            task: tokio::spawn(worker.run()),
        }
    }

    async fn stop_worker(worker: WorkerHandle) {
        let _ = worker.stop_tx.send(true);
        drop(worker.tx);
        if let Err(e) = worker.task.await {
            error!(error = %e, "Partition worker panicked");
        }
    }
}

/// Sequential processor for one partition
struct PartitionWorker<S, P, Src>
where
    S: DedupStore,
    P: BusinessProcessor<S::Transaction>,
    Src: MessageSource,
{
    partition: TopicPartition,
    rx: mpsc::Receiver<Message>,
    stop_rx: watch::Receiver<bool>,
    coordinator: Arc<IdempotencyCoordinator<S, P>>,
    source: Arc<Src>,
    sink: Arc<dyn OutcomeSink>,
    dead_letter: Arc<dyn DeadLetterQueue>,
    retry: RetryPolicy,
    capacity: Arc<Notify>,
    last_acknowledged: Option<i64>,
}

impl<S, P, Src> PartitionWorker<S, P, Src>
where
    S: DedupStore,
    P: BusinessProcessor<S::Transaction>,
    Src: MessageSource,
{
    async fn run(mut self) {
        while let Some(message) = self.rx.recv().await {
            self.capacity.notify_one();
            if self.stopped() {
                break;
            }
            if !self.process(message).await {
                break;
            }
        }
        debug!(partition = %self.partition, "Partition worker exited");
    }

    fn stopped(&self) -> bool {
        *self.stop_rx.borrow()
    }

    /// Drive one message to a terminal verdict; `false` if stopped first
    async fn process(&mut self, message: Message) -> bool {
        let mut state = AttemptState::new();

        loop {
            state.begin_attempt();

            let delay = match self.coordinator.handle(&message).await {
                Ok(outcome) => {
                    self.acknowledge(&message).await;
                    let outcome = outcome.map(|effect| {
                        serde_json::to_value(effect).unwrap_or_else(|e| {
                            warn!(
                                key = %message.key,
                                error = %e,
                                "Failed to serialize effect output, reporting null"
                            );
                            serde_json::Value::Null
                        })
                    });
                    self.sink
                        .emit(OutcomeEvent::new(&message, state.attempts(), outcome));
                    return true;
                }
                Err(err) if err.is_storage() => {
                    let delay = state.record_storage_failure(&self.retry);
                    warn!(
                        key = %message.key,
                        partition = %self.partition,
                        offset = message.offset,
                        storage_failures = state.storage_failures(),
                        backoff_ms = delay.as_millis() as u64,
                        error = %err,
                        "Dedup store unavailable, retrying without acknowledging"
                    );
                    delay
                }
                Err(err) => match state.record_processing_failure(&self.retry) {
                    RetryDecision::Retry(delay) => {
                        warn!(
                            key = %message.key,
                            partition = %self.partition,
                            offset = message.offset,
                            attempt = state.attempts(),
                            max_retries = self.retry.max_retries,
                            permanent = err.is_permanent(),
                            backoff_ms = delay.as_millis() as u64,
                            error = %err,
                            "Processing failed, retrying"
                        );
                        delay
                    }
                    RetryDecision::Quarantine => {
                        self.quarantine(&message, &err.to_string(), state.attempts())
                            .await;
                        return true;
                    }
                },
            };

            if !self.backoff(delay).await {
                info!(
                    key = %message.key,
                    partition = %self.partition,
                    offset = message.offset,
                    "Worker stopped during retry, message left unacknowledged"
                );
                return false;
            }
        }
    }

    /// Sleep for `delay`; `false` if the worker was stopped meanwhile
    async fn backoff(&mut self, delay: Duration) -> bool {
        if self.stopped() {
            return false;
        }
        tokio::select! {
            _ = tokio::time::sleep(delay) => !self.stopped(),
            _ = self.stop_rx.changed() => false,
        }
    }

    async fn quarantine(&mut self, message: &Message, error: &str, attempts: u32) {
        error!(
            key = %message.key,
            partition = %self.partition,
            offset = message.offset,
            attempts = attempts,
            error = %error,
            "Retry budget exhausted, quarantining message"
        );

        if let Err(e) = self.dead_letter.quarantine(message, error, attempts).await {
            error!(
                key = %message.key,
                partition = %self.partition,
                offset = message.offset,
                error = %e,
                "Failed to dead-letter quarantined message"
            );
        }

        self.acknowledge(message).await;
        self.sink.emit(OutcomeEvent::new(
            message,
            attempts,
            ProcessingOutcome::Failed {
                error: error.to_string(),
                attempts,
            },
        ));
    }

    async fn acknowledge(&mut self, message: &Message) {
        if let Some(last) = self.last_acknowledged {
            if message.offset <= last {
                debug!(
                    partition = %self.partition,
                    offset = message.offset,
                    last_acknowledged = last,
                    "Offset already acknowledged, keeping position"
                );
                return;
            }
        }

        match self.source.acknowledge(&message.position()).await {
            Ok(()) => {
                self.last_acknowledged = Some(message.offset);
            }
            Err(e) => {
                // Redelivery of this message resolves to a duplicate
                warn!(
                    partition = %self.partition,
                    offset = message.offset,
                    error = %e,
                    "Failed to acknowledge message"
                );
            }
        }
    }
}
