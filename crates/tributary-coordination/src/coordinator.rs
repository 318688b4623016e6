//! The [`SourceCoordinator`] boundary.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::CoordinationResult;
use crate::partition::ShardPartition;

/// Key of the marker recording that the bulk backfill for a stream has
/// finished. Deliberately namespaced apart from shard partition keys
/// (`"<stream>|<shard>"`) so the signal can never collide with a shard
/// entry when the coordination store is shared.
#[must_use]
pub fn backfill_done_key(stream_id: &str) -> String {
    format!("backfill-done|{stream_id}")
}

/// Lease-based coordination over shard partitions.
///
/// Implementations guarantee single-writer semantics: a partition is held
/// by at most one worker at a time, and progress updates from a worker
/// whose lease has lapsed fail with
/// [`CoordinationError::NotOwned`](crate::CoordinationError::NotOwned)
/// instead of clobbering the new owner's state.
#[async_trait]
pub trait SourceCoordinator: Send + Sync {
    /// Leases one available partition, if any.
    ///
    /// A partition is available when it is `Pending`, or `Leased` with an
    /// expired lease (its previous owner went away without surrendering).
    async fn acquire_available_partition(&self) -> Option<ShardPartition>;

    /// Registers a new `Pending` partition.
    ///
    /// Returns `false` (not an error) when a partition with the same key
    /// already exists; lineage expansion may legitimately race with itself
    /// across workers.
    async fn create_partition(&self, partition: &ShardPartition) -> bool;

    /// Marks a partition `Completed`. Terminal.
    ///
    /// Idempotent: completing an already-completed partition succeeds, so
    /// the two paths that may both complete a shard (the scheduler's
    /// lineage expansion and the tracker's final-acknowledgement handling)
    /// can overlap harmlessly.
    async fn complete_partition(&self, partition: &ShardPartition) -> CoordinationResult<()>;

    /// Surrenders the lease, returning the partition to `Pending` so any
    /// worker can retry it from its last committed cursor.
    ///
    /// Tolerant of the partition being unleased already: overlapping
    /// failure paths may both surrender.
    async fn give_up_partition(&self, partition: &ShardPartition) -> CoordinationResult<()>;

    /// Persists the partition's progress state.
    ///
    /// Extends the lease as a side effect; `lease_extension` overrides the
    /// store's default lease duration when supplied. Fails with `NotOwned`
    /// when the caller no longer holds the lease.
    async fn save_progress_state(
        &self,
        partition: &ShardPartition,
        lease_extension: Option<Duration>,
    ) -> CoordinationResult<()>;

    /// Point lookup by partition key.
    async fn get_partition(&self, partition_key: &str) -> Option<ShardPartition>;

    /// Records that the bulk backfill for `stream_id` has finished.
    ///
    /// Returns `false` if the marker already existed.
    async fn create_backfill_done_marker(&self, stream_id: &str) -> bool;

    /// Whether the bulk backfill for `stream_id` has finished.
    async fn is_backfill_done(&self, stream_id: &str) -> bool;
}
