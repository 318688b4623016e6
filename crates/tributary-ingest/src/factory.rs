//! Builds consumers for freshly leased shards.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::info;

use tributary_coordination::{ShardPartition, SourceCoordinator};

use crate::buffer::SinkBuffer;
use crate::checkpoint::ShardCheckpointer;
use crate::config::IngestConfig;
use crate::consumer::{AckContext, ShardConsumer};
use crate::discovery::ShardDiscovery;
use crate::error::IngestError;
use crate::metrics::IngestMetrics;
use crate::source::ChangeLogSource;
use crate::tracker::AckTracker;

/// Builds a [`ShardConsumer`] for a leased partition.
///
/// The starting cursor comes from the partition's committed progress:
/// strictly after the last committed sequence number when one exists,
/// otherwise from the beginning of the shard.
pub struct ShardConsumerFactory {
    source: Arc<dyn ChangeLogSource>,
    coordinator: Arc<dyn SourceCoordinator>,
    discovery: Arc<ShardDiscovery>,
    buffer: Arc<dyn SinkBuffer>,
    tracker: Option<Arc<AckTracker>>,
    config: IngestConfig,
    cancel: CancellationToken,
    metrics: Arc<IngestMetrics>,
}

impl ShardConsumerFactory {
    /// Creates a factory. `tracker` is `Some` exactly when acknowledgement
    /// mode is on; `cancel` is the shared stop signal propagated into
    /// every consumer.
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        source: Arc<dyn ChangeLogSource>,
        coordinator: Arc<dyn SourceCoordinator>,
        discovery: Arc<ShardDiscovery>,
        buffer: Arc<dyn SinkBuffer>,
        tracker: Option<Arc<AckTracker>>,
        config: IngestConfig,
        cancel: CancellationToken,
        metrics: Arc<IngestMetrics>,
    ) -> Self {
        Self {
            source,
            coordinator,
            discovery,
            buffer,
            tracker,
            config,
            cancel,
            metrics,
        }
    }

    /// Builds a consumer for `partition`.
    ///
    /// Returns `Ok(None)` when the shard has expired out of the source's
    /// retention window: there is nothing retrievable, and the caller
    /// should complete the partition without running a consumer.
    ///
    /// # Errors
    ///
    /// Propagates source failures while resolving the starting cursor.
    pub async fn create_consumer(
        &self,
        partition: ShardPartition,
    ) -> Result<Option<ShardConsumer>, IngestError> {
        let progress = partition.progress();
        let cursor = self
            .discovery
            .cursor_for(
                partition.stream_id(),
                partition.shard_id(),
                progress.sequence_number.as_deref(),
            )
            .await?;
        let Some(cursor) = cursor else {
            info!(partition = %partition, "shard expired out of retention; nothing to consume");
            return Ok(None);
        };

        let ack = self.tracker.as_ref().map(|tracker| AckContext {
            state_rx: tracker.track_shard(&partition),
            tracker: Arc::clone(tracker),
        });

        let checkpointer = ShardCheckpointer::new(
            Arc::clone(&self.coordinator),
            partition.clone(),
            self.config.ack_timeout,
            self.config.end_of_shard_lease_extension,
        );

        Ok(Some(ShardConsumer {
            partition,
            source: Arc::clone(&self.source),
            coordinator: Arc::clone(&self.coordinator),
            buffer: Arc::clone(&self.buffer),
            checkpointer,
            config: self.config.clone(),
            cancel: self.cancel.clone(),
            metrics: Arc::clone(&self.metrics),
            cursor,
            ack,
        }))
    }
}
