//! The per-shard polling consumer.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use tributary_coordination::{ProgressState, ShardPartition, SourceCoordinator};

use crate::buffer::SinkBuffer;
use crate::checkpoint::ShardCheckpointer;
use crate::config::IngestConfig;
use crate::error::IngestError;
use crate::metrics::IngestMetrics;
use crate::record::ChangeRecord;
use crate::source::{ChangeLogSource, CursorPosition, ShardCursor};
use crate::tracker::{AckTracker, ShardTrackingState};

/// Acknowledgement wiring for a consumer running in acknowledgement mode.
pub(crate) struct AckContext {
    pub(crate) tracker: Arc<AckTracker>,
    pub(crate) state_rx: watch::Receiver<ShardTrackingState>,
}

/// Reads one leased shard until it ends, forwarding records downstream
/// and checkpointing progress.
///
/// Built by [`ShardConsumerFactory`](crate::ShardConsumerFactory) for a
/// freshly leased partition. The loop ends when the source signals end of
/// shard, when the shared stop signal fires, or on an unrecoverable read
/// error; anything but a clean end is reported as an error so the
/// scheduler surrenders the lease instead of completing the shard.
pub struct ShardConsumer {
    pub(crate) partition: ShardPartition,
    pub(crate) source: Arc<dyn ChangeLogSource>,
    pub(crate) coordinator: Arc<dyn SourceCoordinator>,
    pub(crate) buffer: Arc<dyn SinkBuffer>,
    pub(crate) checkpointer: ShardCheckpointer,
    pub(crate) config: IngestConfig,
    pub(crate) cancel: CancellationToken,
    pub(crate) metrics: Arc<IngestMetrics>,
    /// Starting cursor, resolved by the factory from committed progress.
    pub(crate) cursor: ShardCursor,
    /// `Some` in acknowledgement mode.
    pub(crate) ack: Option<AckContext>,
}

impl ShardConsumer {
    /// Consumes the shard to its end.
    ///
    /// # Errors
    ///
    /// Any error means the shard must be surrendered, not completed:
    /// read/buffer failures, surrender by the acknowledgement tracker, or
    /// interruption by shutdown (after a last best-effort checkpoint).
    pub async fn run(mut self) -> Result<(), IngestError> {
        let progress = self.partition.progress();
        info!(partition = %self.partition, "starting shard consumer");

        if self.should_skip(&progress).await? {
            info!(
                partition = %self.partition,
                "shard closed before the configured start time; skipping read"
            );
            self.metrics.record_shard_skipped();
            return self
                .finish(progress.ending_sequence_number.clone(), false)
                .await;
        }

        if progress.wait_for_backfill {
            self.wait_for_backfill().await?;
        }

        self.consume().await
    }

    async fn consume(&mut self) -> Result<(), IngestError> {
        let mut cursor = self.cursor.clone();
        let mut last_sequence: Option<String> = None;
        let mut last_event_time_ms: Option<i64> = None;
        let mut last_checkpoint = Instant::now();
        let mut final_registered = false;

        loop {
            if self.cancel.is_cancelled() {
                return self.interrupt(last_sequence).await;
            }
            if let Some(ack) = &self.ack {
                if *ack.state_rx.borrow() == ShardTrackingState::Surrendered {
                    return Err(IngestError::Surrendered(self.partition.partition_key()));
                }
            }

            let poll = match self
                .source
                .read_records(&cursor, self.config.max_poll_records)
                .await
            {
                Ok(poll) => poll,
                Err(e) => {
                    self.metrics.record_read_error();
                    return Err(e.into());
                }
            };
            let end_of_shard = poll.next_cursor.is_none();

            if !poll.records.is_empty() {
                self.metrics.record_read(poll.records.len() as u64);
                let last = poll.records.last().expect("records are non-empty");
                last_sequence = Some(last.sequence_number.clone());
                last_event_time_ms = Some(last.event_time_ms);
                self.forward(poll.records, end_of_shard).await?;
                final_registered = end_of_shard && self.ack.is_some();
            }

            if !end_of_shard && last_checkpoint.elapsed() >= self.config.checkpoint_interval {
                self.cadence_checkpoint(last_sequence.clone()).await?;
                last_checkpoint = Instant::now();
            }

            match poll.next_cursor {
                None => break,
                Some(next) => cursor = next,
            }

            let delay = poll_delay(&self.config, last_event_time_ms, Utc::now().timestamp_millis());
            tokio::select! {
                () = self.cancel.cancelled() => {}
                () = tokio::time::sleep(delay) => {}
            }
        }

        debug!(partition = %self.partition, "reached end of shard");
        self.finish(last_sequence, final_registered).await
    }

    /// Forwards one batch downstream. In acknowledgement mode the batch's
    /// checkpoint is registered with the tracker before the write so the
    /// records can be added to its acknowledgement set; otherwise the
    /// cursor is checkpointed synchronously after the write.
    async fn forward(
        &self,
        records: Vec<ChangeRecord>,
        is_final: bool,
    ) -> Result<(), IngestError> {
        let count = records.len();
        let last_sequence = records.last().map(|r| r.sequence_number.clone());

        let ack_set = match &self.ack {
            Some(ack) => Some(ack.tracker.register_checkpoint(
                &self.partition,
                last_sequence.clone(),
                is_final,
            )?),
            None => None,
        };
        if let Some(set) = &ack_set {
            for record in &records {
                set.add(record);
            }
        }

        self.buffer
            .write(records, self.config.buffer_timeout)
            .await?;
        self.metrics.record_forwarded(count as u64);

        match ack_set {
            Some(set) => set.complete(),
            None => {
                self.checkpointer.checkpoint(last_sequence).await?;
                self.metrics.record_checkpoint();
            }
        }
        Ok(())
    }

    /// The wall-clock checkpoint, taken even when idle so the lease stays
    /// alive. In acknowledgement mode this is an empty set routed through
    /// the tracker — commits stay acknowledgement-gated.
    async fn cadence_checkpoint(&self, last_sequence: Option<String>) -> Result<(), IngestError> {
        match &self.ack {
            Some(ack) => {
                ack.tracker
                    .register_checkpoint(&self.partition, last_sequence, false)?
                    .complete();
            }
            None => {
                self.checkpointer.checkpoint(last_sequence).await?;
                self.metrics.record_checkpoint();
            }
        }
        Ok(())
    }

    /// One last best-effort checkpoint of the highest cursor read, then
    /// failure — the shard must be surrendered, never completed, on
    /// shutdown.
    async fn interrupt(&self, last_sequence: Option<String>) -> Result<(), IngestError> {
        info!(partition = %self.partition, "stop signal observed; taking final checkpoint");
        let result = match &self.ack {
            Some(ack) => ack
                .tracker
                .register_checkpoint(&self.partition, last_sequence, false)
                .map(|set| set.complete()),
            None => self
                .checkpointer
                .checkpoint(last_sequence)
                .await
                .map_err(IngestError::from),
        };
        if let Err(e) = result {
            warn!(partition = %self.partition, error = %e, "final checkpoint failed during shutdown");
        }
        Err(IngestError::Interrupted)
    }

    /// Runs the completion signalling path.
    ///
    /// Without acknowledgements the shard's last cursor is committed with
    /// an enlarged lease extension and the consumer returns success — the
    /// scheduler takes it from there. With acknowledgements, completion
    /// is signalled only once the tracker observes the final checkpoint
    /// positively acknowledged.
    async fn finish(
        &mut self,
        last_sequence: Option<String>,
        final_registered: bool,
    ) -> Result<(), IngestError> {
        match &self.ack {
            Some(ack) => {
                if !final_registered {
                    ack.tracker
                        .register_checkpoint(&self.partition, last_sequence, true)?
                        .complete();
                }
                self.await_final_ack().await
            }
            None => {
                self.checkpointer
                    .checkpoint_end_of_shard(last_sequence)
                    .await?;
                self.metrics.record_checkpoint();
                Ok(())
            }
        }
    }

    async fn await_final_ack(&mut self) -> Result<(), IngestError> {
        let cancel = self.cancel.clone();
        let ack = self.ack.as_mut().expect("acknowledgement mode");
        loop {
            match *ack.state_rx.borrow_and_update() {
                ShardTrackingState::Completed => return Ok(()),
                ShardTrackingState::Surrendered => {
                    return Err(IngestError::Surrendered(self.partition.partition_key()));
                }
                ShardTrackingState::Active => {}
            }
            tokio::select! {
                () = cancel.cancelled() => return Err(IngestError::Interrupted),
                changed = ack.state_rx.changed() => {
                    if changed.is_err() {
                        return Err(IngestError::NotTracked(self.partition.partition_key()));
                    }
                }
            }
        }
    }

    /// Whether the whole shard predates the configured start time.
    ///
    /// Only possible for shards carrying a final-cursor hint: the record
    /// at that cursor is the last the shard will ever hold, so if it is
    /// older than the start time the shard contributes nothing.
    async fn should_skip(&self, progress: &ProgressState) -> Result<bool, IngestError> {
        let Some(ending) = &progress.ending_sequence_number else {
            return Ok(false);
        };
        let cursor = self
            .source
            .shard_cursor(
                self.partition.stream_id(),
                self.partition.shard_id(),
                CursorPosition::AtSequence(ending.clone()),
            )
            .await?;
        let Some(cursor) = cursor else {
            // The closing record fell out of retention; nothing retrievable.
            return Ok(true);
        };
        let poll = self.source.read_records(&cursor, 1).await?;
        Ok(poll
            .records
            .first()
            .is_some_and(|r| r.event_time_ms < progress.start_time_ms))
    }

    /// Blocks until the companion bulk backfill reports done, touching the
    /// lease at every poll so a long wait is not reclaimed as stale.
    async fn wait_for_backfill(&self) -> Result<(), IngestError> {
        info!(partition = %self.partition, "waiting for backfill before reading live changes");
        // Commit the current position up front so it survives the wait.
        self.checkpointer.checkpoint(None).await?;
        loop {
            if self.cancel.is_cancelled() {
                return Err(IngestError::Interrupted);
            }
            if self
                .coordinator
                .is_backfill_done(self.partition.stream_id())
                .await
            {
                break;
            }
            self.checkpointer.extend_lease().await?;
            tokio::select! {
                () = self.cancel.cancelled() => {}
                () = tokio::time::sleep(self.config.backfill_poll_interval) => {}
            }
        }
        info!(partition = %self.partition, "backfill finished; resuming live reads");
        // Clear the flag so a re-leased partition does not wait again.
        self.partition.update_progress(|p| p.wait_for_backfill = false);
        self.checkpointer.extend_lease().await?;
        Ok(())
    }
}

/// Delay before the next poll: near-immediate while the consumer is
/// behind, the steady interval once caught up.
fn poll_delay(config: &IngestConfig, last_event_time_ms: Option<i64>, now_ms: i64) -> Duration {
    let Some(event_time_ms) = last_event_time_ms else {
        return config.poll_interval;
    };
    let lag_ms = now_ms.saturating_sub(event_time_ms);
    let threshold_ms = i64::try_from(config.lag_threshold.as_millis()).unwrap_or(i64::MAX);
    if lag_ms > threshold_ms {
        config.catch_up_poll_interval
    } else {
        config.poll_interval
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acks::ManualAckFactory;
    use crate::buffer::InMemoryBuffer;
    use crate::memory::InMemoryChangeLog;
    use bytes::Bytes;
    use tributary_coordination::{InMemoryCoordinator, PartitionStatus};

    const START_TIME_MS: i64 = 1_700_000_000_000;

    fn record(seq: u64, event_time_ms: i64) -> ChangeRecord {
        ChangeRecord::new(seq.to_string(), event_time_ms, Bytes::from_static(b"{}"))
    }

    fn test_config() -> IngestConfig {
        IngestConfig {
            poll_interval: Duration::from_millis(5),
            catch_up_poll_interval: Duration::from_millis(1),
            buffer_timeout: Duration::from_millis(100),
            backfill_poll_interval: Duration::from_millis(10),
            ..IngestConfig::default()
        }
    }

    struct Fixture {
        log: Arc<InMemoryChangeLog>,
        coordinator: Arc<InMemoryCoordinator>,
        buffer: Arc<InMemoryBuffer>,
        metrics: Arc<IngestMetrics>,
        partition: ShardPartition,
        config: IngestConfig,
    }

    impl Fixture {
        async fn new(config: IngestConfig, progress: ProgressState) -> Self {
            let log = Arc::new(InMemoryChangeLog::new());
            log.add_shard("orders", "shard-0001", None);
            let coordinator = Arc::new(InMemoryCoordinator::default());
            let partition = ShardPartition::new("orders", "shard-0001", progress);
            coordinator.create_partition(&partition).await;
            let partition = coordinator.acquire_available_partition().await.unwrap();
            Self {
                log,
                coordinator,
                buffer: Arc::new(InMemoryBuffer::new()),
                metrics: Arc::new(IngestMetrics::new()),
                partition,
                config,
            }
        }

        async fn consumer(&self, cancel: CancellationToken, ack: Option<AckContext>) -> ShardConsumer {
            let cursor = self
                .log
                .shard_cursor("orders", "shard-0001", CursorPosition::FromBeginning)
                .await
                .unwrap()
                .unwrap();
            ShardConsumer {
                partition: self.partition.clone(),
                source: self.log.clone(),
                coordinator: self.coordinator.clone(),
                buffer: self.buffer.clone(),
                checkpointer: ShardCheckpointer::new(
                    self.coordinator.clone(),
                    self.partition.clone(),
                    self.config.ack_timeout,
                    self.config.end_of_shard_lease_extension,
                ),
                config: self.config.clone(),
                cancel,
                metrics: self.metrics.clone(),
                cursor,
                ack,
            }
        }
    }

    #[tokio::test]
    async fn test_consumes_closed_shard_to_the_end() {
        let f = Fixture::new(test_config(), ProgressState::default()).await;
        f.log.push_records(
            "orders",
            "shard-0001",
            vec![
                record(100, START_TIME_MS),
                record(101, START_TIME_MS + 1),
                record(102, START_TIME_MS + 2),
            ],
        );
        f.log.close_shard("orders", "shard-0001");

        let consumer = f.consumer(CancellationToken::new(), None).await;
        consumer.run().await.unwrap();

        assert_eq!(f.buffer.len(), 3);
        assert_eq!(
            f.partition.progress().sequence_number.as_deref(),
            Some("102")
        );
        // Completion is the scheduler's call, not the consumer's.
        assert_eq!(
            f.coordinator.partition_status("orders|shard-0001"),
            Some(PartitionStatus::Leased)
        );
        let snapshot = f.metrics.snapshot();
        assert_eq!(snapshot.records_read, 3);
        assert_eq!(snapshot.records_forwarded, 3);
    }

    #[tokio::test]
    async fn test_interrupt_signals_failure_after_final_checkpoint() {
        let f = Fixture::new(test_config(), ProgressState::default()).await;
        f.log.push_records("orders", "shard-0001", vec![record(100, START_TIME_MS)]);

        let cancel = CancellationToken::new();
        cancel.cancel();
        let consumer = f.consumer(cancel, None).await;
        let err = consumer.run().await.unwrap_err();
        assert!(matches!(err, IngestError::Interrupted));
        assert!(f.buffer.is_empty(), "cancelled before the first poll");
    }

    #[tokio::test]
    async fn test_read_error_propagates() {
        let f = Fixture::new(test_config(), ProgressState::default()).await;
        f.log.push_records("orders", "shard-0001", vec![record(100, START_TIME_MS)]);

        let consumer = f.consumer(CancellationToken::new(), None).await;
        // Trim after the cursor was taken: the next read fails.
        f.log.trim_shard("orders", "shard-0001");

        let err = consumer.run().await.unwrap_err();
        assert!(matches!(err, IngestError::Read(_)));
        assert_eq!(f.metrics.snapshot().read_errors, 1);
    }

    #[tokio::test]
    async fn test_skips_shard_closed_before_start_time() {
        let progress = ProgressState {
            start_time_ms: START_TIME_MS,
            ending_sequence_number: Some("101".to_string()),
            ..ProgressState::default()
        };
        let f = Fixture::new(test_config(), progress).await;
        f.log.push_records(
            "orders",
            "shard-0001",
            vec![record(100, START_TIME_MS - 100), record(101, START_TIME_MS - 50)],
        );
        f.log.close_shard("orders", "shard-0001");

        let consumer = f.consumer(CancellationToken::new(), None).await;
        consumer.run().await.unwrap();

        assert!(f.buffer.is_empty(), "nothing forwarded for a skipped shard");
        assert_eq!(f.metrics.snapshot().shards_skipped, 1);
        // The completion path still ran: the final cursor was committed.
        assert_eq!(
            f.partition.progress().sequence_number.as_deref(),
            Some("101")
        );
    }

    #[tokio::test]
    async fn test_reads_shard_with_events_after_start_time() {
        let progress = ProgressState {
            start_time_ms: START_TIME_MS,
            ending_sequence_number: Some("101".to_string()),
            ..ProgressState::default()
        };
        let f = Fixture::new(test_config(), progress).await;
        f.log.push_records(
            "orders",
            "shard-0001",
            vec![record(100, START_TIME_MS - 100), record(101, START_TIME_MS + 50)],
        );
        f.log.close_shard("orders", "shard-0001");

        let consumer = f.consumer(CancellationToken::new(), None).await;
        consumer.run().await.unwrap();
        assert_eq!(f.buffer.len(), 2);
        assert_eq!(f.metrics.snapshot().shards_skipped, 0);
    }

    #[tokio::test]
    async fn test_waits_for_backfill_before_reading() {
        let progress = ProgressState {
            wait_for_backfill: true,
            ..ProgressState::default()
        };
        let f = Fixture::new(test_config(), progress).await;
        f.log.push_records("orders", "shard-0001", vec![record(100, START_TIME_MS)]);
        f.log.close_shard("orders", "shard-0001");

        let marker = {
            let coordinator = f.coordinator.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(30)).await;
                coordinator.create_backfill_done_marker("orders").await
            })
        };

        let consumer = f.consumer(CancellationToken::new(), None).await;
        consumer.run().await.unwrap();
        assert!(marker.await.unwrap());

        assert_eq!(f.buffer.len(), 1);
        assert!(
            !f.partition.progress().wait_for_backfill,
            "flag cleared so a re-lease does not wait again"
        );
    }

    #[tokio::test]
    async fn test_buffer_timeout_fails_the_shard() {
        let f = Fixture::new(test_config(), ProgressState::default()).await;
        f.log.push_records("orders", "shard-0001", vec![record(100, START_TIME_MS)]);
        f.log.close_shard("orders", "shard-0001");
        f.buffer.set_capacity(0);

        let consumer = f.consumer(CancellationToken::new(), None).await;
        let err = consumer.run().await.unwrap_err();
        assert!(matches!(
            err,
            IngestError::Buffer(crate::buffer::BufferError::Timeout { .. })
        ));
    }

    #[tokio::test]
    async fn test_ack_mode_completes_after_final_positive_ack() {
        let mut config = test_config();
        config.acknowledgments_enabled = true;
        config.tracker_tick_interval = Duration::from_millis(5);
        let f = Fixture::new(config.clone(), ProgressState::default()).await;
        f.log.push_records(
            "orders",
            "shard-0001",
            vec![record(100, START_TIME_MS), record(101, START_TIME_MS + 1)],
        );
        f.log.close_shard("orders", "shard-0001");

        let acks = Arc::new(ManualAckFactory::new());
        let tracker = Arc::new(AckTracker::new(
            f.coordinator.clone(),
            acks.clone(),
            config,
            f.metrics.clone(),
        ));
        tracker.start();
        let state_rx = tracker.track_shard(&f.partition);

        let consumer = f
            .consumer(
                CancellationToken::new(),
                Some(AckContext {
                    tracker: tracker.clone(),
                    state_rx,
                }),
            )
            .await;
        let run = tokio::spawn(consumer.run());

        // One flush covering both records, marked final.
        let deadline = Instant::now() + Duration::from_secs(5);
        while acks.is_empty() {
            assert!(Instant::now() < deadline, "consumer never registered a checkpoint");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        for set in acks.sets() {
            set.resolve(true);
        }

        run.await.unwrap().unwrap();
        assert_eq!(
            f.coordinator.partition_status("orders|shard-0001"),
            Some(PartitionStatus::Completed)
        );
        tracker.shutdown().await;
    }

    #[tokio::test]
    async fn test_ack_mode_surrender_fails_the_consumer() {
        let mut config = test_config();
        config.acknowledgments_enabled = true;
        config.tracker_tick_interval = Duration::from_millis(5);
        let f = Fixture::new(config.clone(), ProgressState::default()).await;
        f.log.push_records("orders", "shard-0001", vec![record(100, START_TIME_MS)]);
        f.log.close_shard("orders", "shard-0001");

        let acks = Arc::new(ManualAckFactory::new());
        let tracker = Arc::new(AckTracker::new(
            f.coordinator.clone(),
            acks.clone(),
            config,
            f.metrics.clone(),
        ));
        tracker.start();
        let state_rx = tracker.track_shard(&f.partition);

        let consumer = f
            .consumer(
                CancellationToken::new(),
                Some(AckContext {
                    tracker: tracker.clone(),
                    state_rx,
                }),
            )
            .await;
        let run = tokio::spawn(consumer.run());

        let deadline = Instant::now() + Duration::from_secs(5);
        while acks.is_empty() {
            assert!(Instant::now() < deadline, "consumer never registered a checkpoint");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        acks.sets()[0].resolve(false);

        let err = run.await.unwrap().unwrap_err();
        assert!(matches!(err, IngestError::Surrendered(_)));
        tracker.shutdown().await;
    }

    #[test]
    fn test_poll_delay_adapts_to_lag() {
        let config = IngestConfig::default();
        let now_ms = START_TIME_MS;

        // No events yet: steady interval.
        assert_eq!(poll_delay(&config, None, now_ms), config.poll_interval);

        // Fresh events: steady interval.
        assert_eq!(
            poll_delay(&config, Some(now_ms - 1_000), now_ms),
            config.poll_interval
        );

        // Lagging past the threshold: catch-up.
        assert_eq!(
            poll_delay(&config, Some(now_ms - 60_000), now_ms),
            config.catch_up_poll_interval
        );
    }
}
