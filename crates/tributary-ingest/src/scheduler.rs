//! The orchestrating scheduler.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use tributary_coordination::{ProgressState, ShardPartition, SourceCoordinator};

use crate::acks::AckSetFactory;
use crate::buffer::SinkBuffer;
use crate::config::IngestConfig;
use crate::discovery::ShardDiscovery;
use crate::error::IngestError;
use crate::factory::ShardConsumerFactory;
use crate::metrics::IngestMetrics;
use crate::source::ChangeLogSource;
use crate::tracker::AckTracker;

/// Everything a finished consumer task needs to settle its shard.
struct WorkerContext {
    coordinator: Arc<dyn SourceCoordinator>,
    discovery: Arc<ShardDiscovery>,
    tracker: Option<Arc<AckTracker>>,
    metrics: Arc<IngestMetrics>,
    live_workers: Arc<AtomicUsize>,
}

impl WorkerContext {
    /// Settles a finished consumer task.
    ///
    /// Success expands the shard's lineage — children are registered with
    /// the coordinator *before* the parent is marked completed, so losing
    /// the process between the two steps cannot lose lineage. Failure
    /// surrenders the lease so any worker retries the shard from its last
    /// committed cursor.
    async fn finish_shard(&self, partition: ShardPartition, result: Result<(), IngestError>) {
        match result {
            Ok(()) => {
                if let Err(e) = self.expand_lineage(&partition).await {
                    error!(
                        partition = %partition,
                        error = %e,
                        "lineage expansion failed; surrendering shard for retry"
                    );
                    self.surrender(&partition).await;
                }
            }
            Err(e) => {
                warn!(
                    partition = %partition,
                    error = %e,
                    "shard consumer failed; surrendering lease"
                );
                self.metrics.record_shard_surrendered();
                self.surrender(&partition).await;
            }
        }
        self.live_workers.fetch_sub(1, Ordering::AcqRel);
    }

    async fn expand_lineage(&self, partition: &ShardPartition) -> Result<(), IngestError> {
        let stream_id = partition.stream_id();
        self.discovery.refresh(stream_id).await?;
        let children = self.discovery.child_shards(stream_id, partition.shard_id());
        let parent = partition.progress();

        for child in &children {
            let state = ProgressState {
                sequence_number: None,
                wait_for_backfill: parent.wait_for_backfill,
                start_time_ms: parent.start_time_ms,
                ending_sequence_number: child.ending_sequence_number.clone(),
            };
            let child_partition = ShardPartition::new(stream_id, &child.shard_id, state);
            if self.coordinator.create_partition(&child_partition).await {
                debug!(
                    parent = %partition,
                    child = %child.shard_id,
                    "registered child shard partition"
                );
            }
        }

        // Only after every child is registered may the parent complete.
        self.coordinator.complete_partition(partition).await?;
        if self.tracker.is_none() {
            // In acknowledgement mode the tracker already counted the
            // completion when the final acknowledgement landed.
            self.metrics.record_shard_completed();
        }
        info!(
            partition = %partition,
            children = children.len(),
            "shard completed"
        );
        Ok(())
    }

    async fn surrender(&self, partition: &ShardPartition) {
        if let Some(tracker) = &self.tracker {
            tracker.give_up_shard(partition);
        }
        if let Err(e) = self.coordinator.give_up_partition(partition).await {
            warn!(partition = %partition, error = %e, "failed to surrender partition");
        }
    }
}

/// Leases shards, runs one [`ShardConsumer`](crate::ShardConsumer) per
/// lease on a bounded worker set, and expands shard lineage when a
/// consumer finishes.
pub struct StreamScheduler {
    coordinator: Arc<dyn SourceCoordinator>,
    discovery: Arc<ShardDiscovery>,
    factory: ShardConsumerFactory,
    tracker: Option<Arc<AckTracker>>,
    config: IngestConfig,
    cancel: CancellationToken,
    metrics: Arc<IngestMetrics>,
    live_workers: Arc<AtomicUsize>,
}

impl StreamScheduler {
    /// Wires up a scheduler over the given boundaries.
    ///
    /// When `config.acknowledgments_enabled` is set, `acks` must supply
    /// the downstream acknowledgement mechanism and an [`AckTracker`] is
    /// created; otherwise flushes are checkpointed synchronously.
    #[must_use]
    pub fn new(
        source: Arc<dyn ChangeLogSource>,
        coordinator: Arc<dyn SourceCoordinator>,
        buffer: Arc<dyn SinkBuffer>,
        acks: Option<Arc<dyn AckSetFactory>>,
        config: IngestConfig,
        metrics: Arc<IngestMetrics>,
    ) -> Self {
        let discovery = Arc::new(ShardDiscovery::new(Arc::clone(&source)));
        let cancel = CancellationToken::new();
        let tracker = if config.acknowledgments_enabled {
            let acks = acks.expect("acknowledgement mode requires an acknowledgement factory");
            Some(Arc::new(AckTracker::new(
                Arc::clone(&coordinator),
                acks,
                config.clone(),
                Arc::clone(&metrics),
            )))
        } else {
            None
        };
        let factory = ShardConsumerFactory::new(
            source,
            Arc::clone(&coordinator),
            Arc::clone(&discovery),
            buffer,
            tracker.clone(),
            config.clone(),
            cancel.clone(),
            Arc::clone(&metrics),
        );
        Self {
            coordinator,
            discovery,
            factory,
            tracker,
            config,
            cancel,
            metrics,
            live_workers: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// The shared stop signal. Cancelling it (or calling
    /// [`shutdown`](Self::shutdown)) makes every active consumer take a
    /// final checkpoint and exit, after which [`run`](Self::run) returns.
    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Signals cooperative shutdown.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Discovers `stream_id` and registers a `Pending` partition for every
    /// root shard, seeding the lease store at stream start. Returns how
    /// many partitions were newly registered.
    ///
    /// # Errors
    ///
    /// Propagates discovery failures.
    pub async fn bootstrap(
        &self,
        stream_id: &str,
        start_time_ms: i64,
        wait_for_backfill: bool,
    ) -> Result<usize, IngestError> {
        self.discovery.refresh(stream_id).await?;
        let roots = self.discovery.root_shards(stream_id);
        let mut created = 0;
        for root in &roots {
            let state = ProgressState {
                sequence_number: None,
                wait_for_backfill,
                start_time_ms,
                ending_sequence_number: root.ending_sequence_number.clone(),
            };
            let partition = ShardPartition::new(stream_id, &root.shard_id, state);
            if self.coordinator.create_partition(&partition).await {
                created += 1;
            }
        }
        info!(
            stream = stream_id,
            roots = roots.len(),
            created,
            "registered root shard partitions"
        );
        Ok(created)
    }

    /// Runs the scheduling loop until shutdown.
    ///
    /// Each iteration leases at most one available shard (while the live
    /// worker count is below the bound) and then sleeps the acquisition
    /// interval. On shutdown the worker set is drained without forced
    /// cancellation — in-flight final checkpoints complete — and the
    /// acknowledgement tracker (if any) is shut down last.
    pub async fn run(&self) {
        if let Some(tracker) = &self.tracker {
            tracker.start();
        }
        info!(max_workers = self.config.max_workers, "stream scheduler started");

        let mut workers: JoinSet<()> = JoinSet::new();
        loop {
            // Reap finished tasks so the set does not grow unbounded.
            while workers.try_join_next().is_some() {}

            if self.cancel.is_cancelled() {
                break;
            }
            if self.live_workers.load(Ordering::Acquire) < self.config.max_workers {
                if let Some(partition) = self.coordinator.acquire_available_partition().await {
                    self.launch(&mut workers, partition).await;
                }
            }
            tokio::select! {
                () = self.cancel.cancelled() => break,
                () = tokio::time::sleep(self.config.acquire_interval) => {}
            }
        }

        info!("scheduler stopping; draining in-flight shard consumers");
        while workers.join_next().await.is_some() {}
        if let Some(tracker) = &self.tracker {
            tracker.shutdown().await;
        }
        info!("stream scheduler stopped");
    }

    async fn launch(&self, workers: &mut JoinSet<()>, partition: ShardPartition) {
        match self.factory.create_consumer(partition.clone()).await {
            Ok(Some(consumer)) => {
                self.live_workers.fetch_add(1, Ordering::AcqRel);
                let context = WorkerContext {
                    coordinator: Arc::clone(&self.coordinator),
                    discovery: Arc::clone(&self.discovery),
                    tracker: self.tracker.clone(),
                    metrics: Arc::clone(&self.metrics),
                    live_workers: Arc::clone(&self.live_workers),
                };
                workers.spawn(async move {
                    let result = consumer.run().await;
                    context.finish_shard(partition, result).await;
                });
            }
            Ok(None) => {
                // Expired shard: nothing retrievable, so there is nothing
                // a consumer could deliver. Complete it outright.
                match self.coordinator.complete_partition(&partition).await {
                    Ok(()) => self.metrics.record_shard_completed(),
                    Err(e) => {
                        warn!(partition = %partition, error = %e, "failed to complete expired shard");
                    }
                }
            }
            Err(e) => {
                warn!(
                    partition = %partition,
                    error = %e,
                    "failed to build shard consumer; surrendering lease"
                );
                if let Err(e) = self.coordinator.give_up_partition(&partition).await {
                    warn!(partition = %partition, error = %e, "failed to surrender partition");
                }
            }
        }
    }
}
