//! Shard partition identity and progress state.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// Separator between the stream and shard components of a partition key.
const KEY_SEPARATOR: char = '|';

/// Durable progress for one shard partition.
///
/// Persisted to the coordination store on every checkpoint. The committed
/// `sequence_number` only ever advances: the acknowledgement tracker commits
/// through the longest contiguous positively-acknowledged prefix of a
/// shard's checkpoint queue and never skips or reorders entries.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressState {
    /// Last committed cursor for the shard, or `None` if nothing has been
    /// committed yet. Opaque to the coordinator.
    pub sequence_number: Option<String>,

    /// Whether the consumer must wait for a companion bulk backfill to
    /// finish before reading live changes. Cleared once the wait completes
    /// so a re-leased partition does not wait again.
    pub wait_for_backfill: bool,

    /// Start of interest, epoch milliseconds. Change events older than this
    /// are covered by the backfill and contribute nothing.
    pub start_time_ms: i64,

    /// Final-cursor hint for a shard that was already closed when the
    /// partition was registered. Lets the consumer skip shards whose entire
    /// contents predate `start_time_ms`.
    pub ending_sequence_number: Option<String>,
}

/// Lifecycle status of a partition in the coordination store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionStatus {
    /// Lineage is known and the partition is waiting for a worker.
    Pending,
    /// A worker holds the lease and is consuming the shard.
    Leased,
    /// Terminal: all data delivered and acknowledged.
    Completed,
}

impl fmt::Display for PartitionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Leased => write!(f, "leased"),
            Self::Completed => write!(f, "completed"),
        }
    }
}

/// A leasable unit of work covering one shard of one stream.
///
/// Cloning yields another handle to the *same* partition: the progress
/// state is shared, so the consumer that reads the shard and the tracker
/// that commits its checkpoints observe a single state. Equality and
/// hashing use the partition key only.
#[derive(Debug, Clone)]
pub struct ShardPartition {
    stream_id: Arc<str>,
    shard_id: Arc<str>,
    progress: Arc<RwLock<ProgressState>>,
}

impl ShardPartition {
    /// Creates a partition handle for `(stream_id, shard_id)` with the
    /// given initial progress.
    #[must_use]
    pub fn new(stream_id: &str, shard_id: &str, progress: ProgressState) -> Self {
        Self {
            stream_id: Arc::from(stream_id),
            shard_id: Arc::from(shard_id),
            progress: Arc::new(RwLock::new(progress)),
        }
    }

    /// The stream this partition belongs to.
    #[must_use]
    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    /// The shard this partition covers.
    #[must_use]
    pub fn shard_id(&self) -> &str {
        &self.shard_id
    }

    /// The coordination-store key, `"<stream_id>|<shard_id>"`.
    #[must_use]
    pub fn partition_key(&self) -> String {
        format!("{}{KEY_SEPARATOR}{}", self.stream_id, self.shard_id)
    }

    /// Snapshot of the current progress state.
    #[must_use]
    pub fn progress(&self) -> ProgressState {
        self.progress.read().clone()
    }

    /// Applies a mutation to the shared progress state.
    pub fn update_progress(&self, f: impl FnOnce(&mut ProgressState)) {
        f(&mut self.progress.write());
    }

    /// Sets the committed cursor. A `None` argument leaves the existing
    /// cursor untouched so an idle checkpoint can never move progress
    /// backwards.
    pub fn set_sequence_number(&self, sequence_number: Option<String>) {
        if let Some(sequence_number) = sequence_number {
            self.progress.write().sequence_number = Some(sequence_number);
        }
    }
}

impl PartialEq for ShardPartition {
    fn eq(&self, other: &Self) -> bool {
        self.stream_id == other.stream_id && self.shard_id == other.shard_id
    }
}

impl Eq for ShardPartition {}

impl Hash for ShardPartition {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.stream_id.hash(state);
        self.shard_id.hash(state);
    }
}

impl fmt::Display for ShardPartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{KEY_SEPARATOR}{}", self.stream_id, self.shard_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_partition_key_format() {
        let p = ShardPartition::new("orders", "shard-0001", ProgressState::default());
        assert_eq!(p.partition_key(), "orders|shard-0001");
        assert_eq!(p.to_string(), "orders|shard-0001");
    }

    #[test]
    fn test_clone_shares_progress() {
        let p = ShardPartition::new("orders", "shard-0001", ProgressState::default());
        let other = p.clone();
        other.set_sequence_number(Some("42".to_string()));
        assert_eq!(p.progress().sequence_number.as_deref(), Some("42"));
    }

    #[test]
    fn test_set_sequence_number_none_is_noop() {
        let p = ShardPartition::new("orders", "shard-0001", ProgressState::default());
        p.set_sequence_number(Some("10".to_string()));
        p.set_sequence_number(None);
        assert_eq!(p.progress().sequence_number.as_deref(), Some("10"));
    }

    #[test]
    fn test_equality_ignores_progress() {
        let a = ShardPartition::new(
            "orders",
            "shard-0001",
            ProgressState {
                sequence_number: Some("5".to_string()),
                ..ProgressState::default()
            },
        );
        let b = ShardPartition::new("orders", "shard-0001", ProgressState::default());
        assert_eq!(a, b);

        let mut set = HashSet::new();
        set.insert(a);
        assert!(set.contains(&b));
    }

    #[test]
    fn test_progress_state_serde_roundtrip() {
        let state = ProgressState {
            sequence_number: Some("1000000042".to_string()),
            wait_for_backfill: true,
            start_time_ms: 1_700_000_000_000,
            ending_sequence_number: None,
        };
        let json = serde_json::to_string(&state).unwrap();
        let restored: ProgressState = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, state);
    }

    #[test]
    fn test_status_display() {
        assert_eq!(PartitionStatus::Pending.to_string(), "pending");
        assert_eq!(PartitionStatus::Leased.to_string(), "leased");
        assert_eq!(PartitionStatus::Completed.to_string(), "completed");
    }
}
