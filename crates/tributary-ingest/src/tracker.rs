//! Acknowledgement-gated checkpoint tracking.
//!
//! The [`AckTracker`] owns a FIFO checkpoint queue per tracked shard. A
//! consumer registers one [`CheckpointStatus`] per flush; the downstream
//! pipeline resolves each status asynchronously. A dedicated monitor loop
//! drains every queue from the head while the head is positively
//! acknowledged and commits the last drained cursor — so committed
//! progress is always the longest contiguous acknowledged prefix of what
//! was read, never more.
//!
//! A pending head blocks all commits for its shard. A negative or
//! timed-out head is fatal for the shard: the last safe cursor is
//! persisted, the consumer is told to stop through the shard's state
//! channel, and the lease is surrendered so another worker retries from
//! the committed cursor.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use tributary_coordination::{CoordinationResult, ShardPartition, SourceCoordinator};

use crate::acks::{AckOutcomeCallback, AckSet, AckSetFactory};
use crate::checkpoint::{AckOutcome, CheckpointStatus};
use crate::config::IngestConfig;
use crate::error::IngestError;
use crate::metrics::IngestMetrics;

/// What the tracker last decided about a shard, observed by its consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShardTrackingState {
    /// Checkpoints are flowing; keep reading.
    Active,
    /// The final checkpoint was positively acknowledged and the shard was
    /// marked completed at the coordinator.
    Completed,
    /// The shard was surrendered; the consumer must stop reading.
    Surrendered,
}

struct ShardEntry {
    partition: ShardPartition,
    /// FIFO of in-flight checkpoints, drained from the head only. The
    /// outcome callback holds its own `Arc` to the status it resolves, so
    /// enqueueing is the single atomic registration step.
    queue: Mutex<VecDeque<Arc<CheckpointStatus>>>,
    state_tx: watch::Sender<ShardTrackingState>,
    last_refresh: Mutex<Instant>,
}

impl ShardEntry {
    fn stop(&self, state: ShardTrackingState) {
        self.state_tx.send_replace(state);
    }
}

struct TrackerShared {
    coordinator: Arc<dyn SourceCoordinator>,
    acks: Arc<dyn AckSetFactory>,
    config: IngestConfig,
    metrics: Arc<IngestMetrics>,
    shards: Mutex<HashMap<String, Arc<ShardEntry>>>,
    /// Entries to detach at the start of the next tick, so the tracked
    /// set is never mutated while being iterated. Matched by entry
    /// identity: a shard re-tracked after a surrender must not be removed
    /// by its predecessor's deferred removal.
    pending_removal: Mutex<Vec<(String, Arc<ShardEntry>)>>,
    /// Shards whose lease to give back at the start of the next tick.
    pending_surrender: Mutex<Vec<ShardPartition>>,
    shutdown: CancellationToken,
}

/// Tracks outstanding acknowledgements per shard and converts them into
/// checkpoint commits or shard surrender.
pub struct AckTracker {
    shared: Arc<TrackerShared>,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

impl AckTracker {
    /// Creates a tracker. Call [`start`](Self::start) to spawn the monitor
    /// loop.
    #[must_use]
    pub fn new(
        coordinator: Arc<dyn SourceCoordinator>,
        acks: Arc<dyn AckSetFactory>,
        config: IngestConfig,
        metrics: Arc<IngestMetrics>,
    ) -> Self {
        Self {
            shared: Arc::new(TrackerShared {
                coordinator,
                acks,
                config,
                metrics,
                shards: Mutex::new(HashMap::new()),
                pending_removal: Mutex::new(Vec::new()),
                pending_surrender: Mutex::new(Vec::new()),
                shutdown: CancellationToken::new(),
            }),
            monitor: Mutex::new(None),
        }
    }

    /// Spawns the monitor loop on the current runtime.
    pub fn start(&self) {
        let shared = Arc::clone(&self.shared);
        let handle = tokio::spawn(async move {
            loop {
                if shared.tick().await {
                    break;
                }
                tokio::select! {
                    () = shared.shutdown.cancelled() => {}
                    () = tokio::time::sleep(shared.config.tracker_tick_interval) => {}
                }
            }
            info!("acknowledgement monitor exiting");
        });
        *self.monitor.lock() = Some(handle);
    }

    /// Begins tracking a shard and returns the state channel its consumer
    /// watches. Tracking an already-tracked shard returns the existing
    /// channel.
    pub fn track_shard(&self, partition: &ShardPartition) -> watch::Receiver<ShardTrackingState> {
        let mut shards = self.shared.shards.lock();
        let entry = shards
            .entry(partition.partition_key())
            .or_insert_with(|| {
                let (state_tx, _) = watch::channel(ShardTrackingState::Active);
                Arc::new(ShardEntry {
                    partition: partition.clone(),
                    queue: Mutex::new(VecDeque::new()),
                    state_tx,
                    last_refresh: Mutex::new(Instant::now()),
                })
            });
        entry.state_tx.subscribe()
    }

    /// Whether the shard is currently tracked.
    #[must_use]
    pub fn is_tracking(&self, partition: &ShardPartition) -> bool {
        self.shared
            .shards
            .lock()
            .contains_key(&partition.partition_key())
    }

    /// Registers a pending checkpoint for a flush and returns the
    /// acknowledgement set the flushed records belong to.
    ///
    /// # Errors
    ///
    /// [`IngestError::NotTracked`] when the tracker has stopped tracking
    /// the shard (it hit an error and another worker will pick the shard
    /// up); the consumer must stop reading.
    pub fn register_checkpoint(
        &self,
        partition: &ShardPartition,
        sequence_number: Option<String>,
        is_final: bool,
    ) -> Result<Arc<dyn AckSet>, IngestError> {
        let key = partition.partition_key();
        let entry = self
            .shared
            .shards
            .lock()
            .get(&key)
            .cloned()
            .ok_or_else(|| IngestError::NotTracked(key.clone()))?;

        let status = CheckpointStatus::new(sequence_number, is_final);
        entry.queue.lock().push_back(Arc::clone(&status));

        let metrics = Arc::clone(&self.shared.metrics);
        let on_outcome: AckOutcomeCallback = Box::new(move |accepted| {
            if !status.resolve(accepted) {
                return;
            }
            if accepted {
                debug!(
                    partition = %key,
                    sequence = status.sequence_number().unwrap_or("none"),
                    "checkpoint acknowledged"
                );
            } else {
                warn!(
                    partition = %key,
                    sequence = status.sequence_number().unwrap_or("none"),
                    "checkpoint negatively acknowledged"
                );
                metrics.record_negative_ack();
            }
        });
        Ok(self.shared.acks.create(on_outcome, self.shared.config.ack_timeout))
    }

    /// Asks the tracker to stop tracking a shard and give its lease back.
    /// Used by the scheduler when a consumer task fails.
    pub fn give_up_shard(&self, partition: &ShardPartition) {
        let key = partition.partition_key();
        let entry = self.shared.shards.lock().get(&key).cloned();
        if let Some(entry) = entry {
            entry.stop(ShardTrackingState::Surrendered);
            self.shared.mark_for_surrender(&entry);
        }
    }

    /// Signals shutdown, then waits up to the configured bound for the
    /// monitor loop to exit before force-cancelling it.
    pub async fn shutdown(&self) {
        self.shared.shutdown.cancel();
        let handle = self.monitor.lock().take();
        if let Some(handle) = handle {
            let bound = self.shared.config.tracker_shutdown_timeout;
            let abort = handle.abort_handle();
            if tokio::time::timeout(bound, handle).await.is_err() {
                warn!("acknowledgement monitor did not stop within {bound:?}; aborting");
                abort.abort();
            }
        }
    }

    #[cfg(test)]
    async fn tick_once(&self) -> bool {
        self.shared.tick().await
    }
}

impl TrackerShared {
    /// Runs one monitor tick. Returns `true` when the loop should exit.
    async fn tick(&self) -> bool {
        self.apply_deferred().await;

        if self.shutdown.is_cancelled() {
            // Surrender everything still tracked so the shards become
            // available for other workers, then exit with nothing tracked.
            let drained: Vec<Arc<ShardEntry>> = self.shards.lock().drain().map(|(_, e)| e).collect();
            if !drained.is_empty() {
                info!(shards = drained.len(), "shutdown requested; surrendering tracked shards");
            }
            for entry in drained {
                entry.stop(ShardTrackingState::Surrendered);
                if let Err(e) = self.coordinator.give_up_partition(&entry.partition).await {
                    warn!(partition = %entry.partition, error = %e, "failed to surrender partition at shutdown");
                }
            }
            return true;
        }

        let entries: Vec<Arc<ShardEntry>> = self.shards.lock().values().cloned().collect();
        for entry in entries {
            if let Err(e) = self.process_shard(&entry).await {
                // One malfunctioning shard must not halt monitoring of the
                // others.
                error!(
                    partition = %entry.partition,
                    error = %e,
                    "error while monitoring acknowledgements; stopping shard"
                );
                entry.stop(ShardTrackingState::Surrendered);
                self.mark_for_surrender(&entry);
            }
        }
        false
    }

    /// Drains the positively-acknowledged prefix of one shard's queue and
    /// acts on what stopped the drain.
    async fn process_shard(&self, entry: &Arc<ShardEntry>) -> CoordinationResult<()> {
        enum Halt {
            Negative(Arc<CheckpointStatus>),
            TimedOut(Arc<CheckpointStatus>),
        }

        let mut latest: Option<Arc<CheckpointStatus>> = None;
        let mut halt: Option<Halt> = None;
        let queue_rest = {
            let mut queue = entry.queue.lock();
            while let Some(head) = queue.front() {
                match head.outcome() {
                    AckOutcome::Positive => {
                        latest = queue.pop_front();
                        // Nothing meaningful can follow the shard's final
                        // checkpoint; stop so the completion is not lost.
                        if latest.as_ref().is_some_and(|s| s.is_final()) {
                            break;
                        }
                    }
                    AckOutcome::Negative => {
                        halt = Some(Halt::Negative(Arc::clone(head)));
                        break;
                    }
                    AckOutcome::Pending => {
                        if head.is_expired(self.config.ack_timeout) {
                            halt = Some(Halt::TimedOut(Arc::clone(head)));
                        }
                        break;
                    }
                }
            }
            queue.len()
        };

        if let Some(halt) = halt {
            match halt {
                Halt::Negative(status) => warn!(
                    partition = %entry.partition,
                    sequence = status.sequence_number().unwrap_or("none"),
                    "negative acknowledgement; surrendering shard"
                ),
                Halt::TimedOut(status) => {
                    warn!(
                        partition = %entry.partition,
                        sequence = status.sequence_number().unwrap_or("none"),
                        "acknowledgement timed out; surrendering shard"
                    );
                    self.metrics.record_ack_timeout();
                }
            }
            // Commit whatever was safely acknowledged before the failure,
            // then stop the consumer and give the lease back.
            if let Some(latest) = latest {
                entry
                    .partition
                    .set_sequence_number(latest.sequence_number().map(String::from));
                if let Err(e) = self
                    .coordinator
                    .save_progress_state(&entry.partition, Some(self.config.ack_timeout))
                    .await
                {
                    warn!(partition = %entry.partition, error = %e, "failed to persist last safe cursor");
                }
            }
            entry.stop(ShardTrackingState::Surrendered);
            self.mark_for_surrender(entry);
            self.metrics.record_shard_surrendered();
            return Ok(());
        }

        if let Some(latest) = latest {
            if latest.is_final() {
                self.coordinator.complete_partition(&entry.partition).await?;
                info!(
                    partition = %entry.partition,
                    "all acknowledgements received; shard completed"
                );
                entry.stop(ShardTrackingState::Completed);
                self.mark_for_removal(entry);
                self.metrics.record_shard_completed();
            } else {
                entry
                    .partition
                    .set_sequence_number(latest.sequence_number().map(String::from));
                self.coordinator
                    .save_progress_state(&entry.partition, Some(self.config.ack_timeout))
                    .await?;
                *entry.last_refresh.lock() = Instant::now();
                self.metrics.record_checkpoint();
                debug!(
                    partition = %entry.partition,
                    sequence = latest.sequence_number().unwrap_or("none"),
                    "committed acknowledged checkpoint"
                );
            }
        } else if queue_rest > 0
            && entry.last_refresh.lock().elapsed() >= self.config.keep_alive_interval
        {
            // Blocked on a pending acknowledgement: heartbeat the lease so
            // the shard is not reclaimed as stale while we wait.
            self.coordinator
                .save_progress_state(&entry.partition, Some(self.config.ack_timeout))
                .await?;
            *entry.last_refresh.lock() = Instant::now();
            self.metrics.record_keepalive();
        }
        Ok(())
    }

    async fn apply_deferred(&self) {
        let removals = std::mem::take(&mut *self.pending_removal.lock());
        let surrenders: Vec<ShardPartition> = std::mem::take(&mut *self.pending_surrender.lock());

        if !removals.is_empty() {
            let mut shards = self.shards.lock();
            for (key, entry) in &removals {
                if shards.get(key).is_some_and(|current| Arc::ptr_eq(current, entry)) {
                    shards.remove(key);
                }
            }
        }
        for partition in surrenders {
            if let Err(e) = self.coordinator.give_up_partition(&partition).await {
                warn!(partition = %partition, error = %e, "failed to surrender partition");
            }
        }
    }

    fn mark_for_removal(&self, entry: &Arc<ShardEntry>) {
        let key = entry.partition.partition_key();
        let mut removal = self.pending_removal.lock();
        if !removal.iter().any(|(_, queued)| Arc::ptr_eq(queued, entry)) {
            removal.push((key, Arc::clone(entry)));
        }
    }

    fn mark_for_surrender(&self, entry: &Arc<ShardEntry>) {
        self.mark_for_removal(entry);
        let mut surrender = self.pending_surrender.lock();
        if !surrender.iter().any(|p| p == &entry.partition) {
            surrender.push(entry.partition.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acks::ManualAckFactory;
    use std::time::Duration;
    use tributary_coordination::{InMemoryCoordinator, PartitionStatus, ProgressState};

    struct Fixture {
        coordinator: Arc<InMemoryCoordinator>,
        acks: Arc<ManualAckFactory>,
        tracker: AckTracker,
        partition: ShardPartition,
    }

    async fn fixture(config: IngestConfig) -> Fixture {
        let coordinator = Arc::new(InMemoryCoordinator::default());
        let acks = Arc::new(ManualAckFactory::new());
        let partition = ShardPartition::new("orders", "shard-0001", ProgressState::default());
        coordinator.create_partition(&partition).await;
        let partition = coordinator.acquire_available_partition().await.unwrap();
        let tracker = AckTracker::new(
            coordinator.clone(),
            acks.clone(),
            config,
            Arc::new(IngestMetrics::new()),
        );
        Fixture {
            coordinator,
            acks,
            tracker,
            partition,
        }
    }

    fn config() -> IngestConfig {
        IngestConfig {
            ack_timeout: Duration::from_secs(3600),
            keep_alive_interval: Duration::from_secs(3600),
            ..IngestConfig::default()
        }
    }

    // Registers a checkpoint without sealing its set: an empty set would
    // acknowledge itself positively on `complete()`, and these tests drive
    // every outcome by hand through the factory.
    fn register(f: &Fixture, seq: &str, is_final: bool) {
        let _set = f
            .tracker
            .register_checkpoint(&f.partition, Some(seq.to_string()), is_final)
            .unwrap();
    }

    fn committed_sequence(f: &Fixture) -> Option<String> {
        f.partition.progress().sequence_number
    }

    #[tokio::test]
    async fn test_pending_head_blocks_all_commits() {
        let f = fixture(config()).await;
        let _rx = f.tracker.track_shard(&f.partition);
        register(&f, "c1", false);
        register(&f, "c2", false);
        register(&f, "c3", false);

        // c2 and c3 acknowledged, head still pending.
        let sets = f.acks.sets();
        sets[1].resolve(true);
        sets[2].resolve(true);

        assert!(!f.tracker.tick_once().await);
        assert_eq!(committed_sequence(&f), None, "pending head blocks the queue");
        assert!(f.tracker.is_tracking(&f.partition));
    }

    #[tokio::test]
    async fn test_drain_stops_at_first_pending() {
        let f = fixture(config()).await;
        let _rx = f.tracker.track_shard(&f.partition);
        register(&f, "c1", false);
        register(&f, "c2", false);
        register(&f, "c3", false);

        let sets = f.acks.sets();
        sets[0].resolve(true);
        sets[1].resolve(true);

        assert!(!f.tracker.tick_once().await);
        assert_eq!(committed_sequence(&f).as_deref(), Some("c2"));
        assert!(f.tracker.is_tracking(&f.partition), "c3 is still queued");
    }

    #[tokio::test]
    async fn test_negative_head_commits_prefix_then_surrenders() {
        let f = fixture(config()).await;
        let mut rx = f.tracker.track_shard(&f.partition);
        register(&f, "c1", false);
        register(&f, "c2", false);

        let sets = f.acks.sets();
        sets[0].resolve(true);
        sets[1].resolve(false);

        assert!(!f.tracker.tick_once().await);
        assert_eq!(committed_sequence(&f).as_deref(), Some("c1"));
        assert_eq!(*rx.borrow_and_update(), ShardTrackingState::Surrendered);

        // The surrender is applied on the next tick.
        assert!(!f.tracker.tick_once().await);
        assert!(!f.tracker.is_tracking(&f.partition));
        assert_eq!(
            f.coordinator.partition_status("orders|shard-0001"),
            Some(PartitionStatus::Pending)
        );
    }

    #[tokio::test]
    async fn test_timed_out_head_surrenders() {
        let f = fixture(IngestConfig {
            ack_timeout: Duration::ZERO,
            ..config()
        })
        .await;
        let mut rx = f.tracker.track_shard(&f.partition);
        register(&f, "c1", false);

        assert!(!f.tracker.tick_once().await);
        assert_eq!(*rx.borrow_and_update(), ShardTrackingState::Surrendered);
        assert_eq!(committed_sequence(&f), None, "nothing was safely acknowledged");

        assert!(!f.tracker.tick_once().await);
        assert_eq!(
            f.coordinator.partition_status("orders|shard-0001"),
            Some(PartitionStatus::Pending)
        );
    }

    #[tokio::test]
    async fn test_no_commits_after_surrender() {
        let f = fixture(config()).await;
        let _rx = f.tracker.track_shard(&f.partition);
        register(&f, "c1", false);
        register(&f, "c2", false);

        let sets = f.acks.sets();
        sets[0].resolve(false);
        assert!(!f.tracker.tick_once().await);
        assert!(!f.tracker.tick_once().await);

        // A late positive acknowledgement changes nothing: the shard is
        // gone from tracking and registration now fails.
        sets[1].resolve(true);
        assert!(!f.tracker.tick_once().await);
        assert_eq!(committed_sequence(&f), None);
        let err = f
            .tracker
            .register_checkpoint(&f.partition, Some("c3".to_string()), false)
            .unwrap_err();
        assert!(matches!(err, IngestError::NotTracked(_)));
    }

    #[tokio::test]
    async fn test_final_checkpoint_completes_shard() {
        let f = fixture(config()).await;
        let mut rx = f.tracker.track_shard(&f.partition);
        register(&f, "c1", false);
        register(&f, "c2", true);

        for set in f.acks.sets() {
            set.resolve(true);
        }
        assert!(!f.tracker.tick_once().await);

        assert_eq!(*rx.borrow_and_update(), ShardTrackingState::Completed);
        assert_eq!(
            f.coordinator.partition_status("orders|shard-0001"),
            Some(PartitionStatus::Completed)
        );
        assert!(!f.tracker.tick_once().await);
        assert!(!f.tracker.is_tracking(&f.partition));
    }

    #[tokio::test]
    async fn test_keep_alive_refreshes_blocked_shard() {
        let f = fixture(IngestConfig {
            keep_alive_interval: Duration::ZERO,
            ..config()
        })
        .await;
        let _rx = f.tracker.track_shard(&f.partition);
        register(&f, "c1", false);

        // Nothing acknowledged, but the lease gets a heartbeat.
        let tracker_metrics = f.tracker.shared.metrics.snapshot();
        assert_eq!(tracker_metrics.lease_keepalives, 0);
        assert!(!f.tracker.tick_once().await);
        assert_eq!(f.tracker.shared.metrics.snapshot().lease_keepalives, 1);
    }

    #[tokio::test]
    async fn test_faulty_shard_does_not_halt_others() {
        let f = fixture(config()).await;
        let _rx_bad = f.tracker.track_shard(&f.partition);

        let healthy = ShardPartition::new("orders", "shard-0002", ProgressState::default());
        f.coordinator.create_partition(&healthy).await;
        let healthy = f.coordinator.acquire_available_partition().await.unwrap();
        let _rx_ok = f.tracker.track_shard(&healthy);

        register(&f, "c1", false);
        f.tracker
            .register_checkpoint(&healthy, Some("h1".to_string()), false)
            .unwrap()
            .complete();
        for set in f.acks.sets() {
            set.resolve(true);
        }

        // Steal the first shard's lease out from under the tracker: its
        // progress save fails, the shard is dropped, the healthy shard
        // still commits.
        f.coordinator.give_up_partition(&f.partition).await.unwrap();

        assert!(!f.tracker.tick_once().await);
        assert_eq!(healthy.progress().sequence_number.as_deref(), Some("h1"));

        assert!(!f.tracker.tick_once().await);
        assert!(!f.tracker.is_tracking(&f.partition));
        assert!(f.tracker.is_tracking(&healthy));
    }

    #[tokio::test]
    async fn test_shutdown_surrenders_tracked_shards_and_exits() {
        let f = fixture(config()).await;
        let mut rx = f.tracker.track_shard(&f.partition);
        register(&f, "c1", false);

        f.tracker.shared.shutdown.cancel();
        assert!(f.tracker.tick_once().await, "shutdown tick exits the loop");
        assert_eq!(*rx.borrow_and_update(), ShardTrackingState::Surrendered);
        assert_eq!(
            f.coordinator.partition_status("orders|shard-0001"),
            Some(PartitionStatus::Pending)
        );
    }

    #[tokio::test]
    async fn test_monitor_loop_runs_and_shuts_down() {
        let f = fixture(IngestConfig {
            tracker_tick_interval: Duration::from_millis(5),
            tracker_shutdown_timeout: Duration::from_secs(5),
            ..config()
        })
        .await;
        let _rx = f.tracker.track_shard(&f.partition);
        register(&f, "c1", true);
        f.acks.sets()[0].resolve(true);

        f.tracker.start();
        let deadline = Instant::now() + Duration::from_secs(5);
        while f.coordinator.partition_status("orders|shard-0001") != Some(PartitionStatus::Completed)
        {
            assert!(Instant::now() < deadline, "monitor never completed the shard");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        f.tracker.shutdown().await;
    }

    #[tokio::test]
    async fn test_give_up_shard_stops_consumer() {
        let f = fixture(config()).await;
        let mut rx = f.tracker.track_shard(&f.partition);

        f.tracker.give_up_shard(&f.partition);
        assert_eq!(*rx.borrow_and_update(), ShardTrackingState::Surrendered);

        assert!(!f.tracker.tick_once().await);
        assert!(!f.tracker.is_tracking(&f.partition));
    }
}
