//! In-memory lease coordination.
//!
//! [`InMemoryCoordinator`] implements the full [`SourceCoordinator`]
//! contract — lease acquisition, expiry and reclamation, progress
//! persistence, status transitions — over process-local maps. It backs
//! embedded deployments and the test suite; multi-node deployments swap in
//! a coordinator over a shared store.

use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use tracing::debug;

use crate::coordinator::{backfill_done_key, SourceCoordinator};
use crate::error::{CoordinationError, CoordinationResult};
use crate::partition::{PartitionStatus, ShardPartition};

/// Default lease duration granted on acquisition.
const DEFAULT_LEASE_DURATION: Duration = Duration::from_secs(600);

struct PartitionEntry {
    partition: ShardPartition,
    status: PartitionStatus,
    lease_deadline_ms: i64,
}

impl PartitionEntry {
    fn lease_expired(&self, now_ms: i64) -> bool {
        self.status == PartitionStatus::Leased && self.lease_deadline_ms <= now_ms
    }
}

/// Process-local [`SourceCoordinator`] with real lease semantics.
pub struct InMemoryCoordinator {
    /// Keyed by partition key; a `BTreeMap` keeps acquisition order
    /// deterministic.
    entries: RwLock<BTreeMap<String, PartitionEntry>>,
    markers: RwLock<HashSet<String>>,
    lease_duration: Duration,
}

impl Default for InMemoryCoordinator {
    fn default() -> Self {
        Self::new(DEFAULT_LEASE_DURATION)
    }
}

impl InMemoryCoordinator {
    /// Creates a coordinator granting leases of `lease_duration` on
    /// acquisition (later extendable via progress saves).
    #[must_use]
    pub fn new(lease_duration: Duration) -> Self {
        Self {
            entries: RwLock::new(BTreeMap::new()),
            markers: RwLock::new(HashSet::new()),
            lease_duration,
        }
    }

    /// Current status of a partition, if it exists.
    #[must_use]
    pub fn partition_status(&self, partition_key: &str) -> Option<PartitionStatus> {
        self.entries.read().get(partition_key).map(|e| e.status)
    }

    /// Number of partitions with the given status.
    #[must_use]
    pub fn count_with_status(&self, status: PartitionStatus) -> usize {
        self.entries
            .read()
            .values()
            .filter(|e| e.status == status)
            .count()
    }

    #[allow(clippy::cast_possible_truncation)] // lease durations are far below i64::MAX millis
    fn deadline_from_now(&self, extension: Option<Duration>) -> i64 {
        let lease = extension.unwrap_or(self.lease_duration);
        Utc::now().timestamp_millis() + lease.as_millis() as i64
    }
}

#[async_trait]
impl SourceCoordinator for InMemoryCoordinator {
    async fn acquire_available_partition(&self) -> Option<ShardPartition> {
        let now_ms = Utc::now().timestamp_millis();
        let mut entries = self.entries.write();
        let entry = entries
            .values_mut()
            .find(|e| e.status == PartitionStatus::Pending || e.lease_expired(now_ms))?;

        entry.status = PartitionStatus::Leased;
        entry.lease_deadline_ms = self.deadline_from_now(None);
        debug!(partition = %entry.partition, "partition leased");
        Some(entry.partition.clone())
    }

    async fn create_partition(&self, partition: &ShardPartition) -> bool {
        let mut entries = self.entries.write();
        let key = partition.partition_key();
        if entries.contains_key(&key) {
            return false;
        }
        entries.insert(
            key,
            PartitionEntry {
                partition: partition.clone(),
                status: PartitionStatus::Pending,
                lease_deadline_ms: 0,
            },
        );
        true
    }

    async fn complete_partition(&self, partition: &ShardPartition) -> CoordinationResult<()> {
        let mut entries = self.entries.write();
        let key = partition.partition_key();
        let entry = entries
            .get_mut(&key)
            .ok_or_else(|| CoordinationError::NotFound(key.clone()))?;
        match entry.status {
            // Both the scheduler and the tracker may complete; second wins
            // nothing but must not fail.
            PartitionStatus::Completed => Ok(()),
            PartitionStatus::Leased => {
                entry.status = PartitionStatus::Completed;
                Ok(())
            }
            PartitionStatus::Pending => Err(CoordinationError::NotOwned(key)),
        }
    }

    async fn give_up_partition(&self, partition: &ShardPartition) -> CoordinationResult<()> {
        let mut entries = self.entries.write();
        let key = partition.partition_key();
        let entry = entries
            .get_mut(&key)
            .ok_or_else(|| CoordinationError::NotFound(key.clone()))?;
        if entry.status == PartitionStatus::Leased {
            entry.status = PartitionStatus::Pending;
            entry.lease_deadline_ms = 0;
            debug!(partition = %entry.partition, "partition surrendered");
        }
        Ok(())
    }

    async fn save_progress_state(
        &self,
        partition: &ShardPartition,
        lease_extension: Option<Duration>,
    ) -> CoordinationResult<()> {
        let now_ms = Utc::now().timestamp_millis();
        let mut entries = self.entries.write();
        let key = partition.partition_key();
        let entry = entries
            .get_mut(&key)
            .ok_or_else(|| CoordinationError::NotFound(key.clone()))?;
        if entry.status != PartitionStatus::Leased || entry.lease_expired(now_ms) {
            return Err(CoordinationError::NotOwned(key));
        }
        // The handle given out at acquisition shares progress state with the
        // stored entry, so persisting is extending the lease.
        entry.lease_deadline_ms = self.deadline_from_now(lease_extension);
        Ok(())
    }

    async fn get_partition(&self, partition_key: &str) -> Option<ShardPartition> {
        self.entries
            .read()
            .get(partition_key)
            .map(|e| e.partition.clone())
    }

    async fn create_backfill_done_marker(&self, stream_id: &str) -> bool {
        self.markers.write().insert(backfill_done_key(stream_id))
    }

    async fn is_backfill_done(&self, stream_id: &str) -> bool {
        self.markers.read().contains(&backfill_done_key(stream_id))
    }
}
