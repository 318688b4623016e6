//! Checkpoint state and persistence glue.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::debug;

use tributary_coordination::{CoordinationResult, ShardPartition, SourceCoordinator};

/// Acknowledgement outcome of one checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    /// No outcome reported yet.
    Pending,
    /// The batch was durably accepted downstream.
    Positive,
    /// The batch was rejected downstream.
    Negative,
}

const OUTCOME_PENDING: u8 = 0;
const OUTCOME_POSITIVE: u8 = 1;
const OUTCOME_NEGATIVE: u8 = 2;

/// One entry of a shard's checkpoint queue.
///
/// Created when a flush is handed to the acknowledgement subsystem,
/// mutated exactly once by the downstream outcome callback, and consumed
/// by the tracker's drain loop.
#[derive(Debug)]
pub struct CheckpointStatus {
    sequence_number: Option<String>,
    is_final: bool,
    created_at: Instant,
    outcome: AtomicU8,
    acknowledged_at: Mutex<Option<Instant>>,
}

impl CheckpointStatus {
    /// Creates a pending checkpoint for `sequence_number`, flagged final
    /// when it covers the last data the shard will ever produce.
    #[must_use]
    pub fn new(sequence_number: Option<String>, is_final: bool) -> Arc<Self> {
        Arc::new(Self {
            sequence_number,
            is_final,
            created_at: Instant::now(),
            outcome: AtomicU8::new(OUTCOME_PENDING),
            acknowledged_at: Mutex::new(None),
        })
    }

    /// The cursor this checkpoint would commit, if any.
    #[must_use]
    pub fn sequence_number(&self) -> Option<&str> {
        self.sequence_number.as_deref()
    }

    /// Whether this is the shard's final checkpoint.
    #[must_use]
    pub fn is_final(&self) -> bool {
        self.is_final
    }

    /// Current outcome.
    #[must_use]
    pub fn outcome(&self) -> AckOutcome {
        match self.outcome.load(Ordering::Acquire) {
            OUTCOME_POSITIVE => AckOutcome::Positive,
            OUTCOME_NEGATIVE => AckOutcome::Negative,
            _ => AckOutcome::Pending,
        }
    }

    /// Records the downstream outcome and stamps the acknowledgement time.
    ///
    /// Only the first call wins; returns whether this call was it.
    pub fn resolve(&self, accepted: bool) -> bool {
        let next = if accepted {
            OUTCOME_POSITIVE
        } else {
            OUTCOME_NEGATIVE
        };
        let first = self
            .outcome
            .compare_exchange(OUTCOME_PENDING, next, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if first {
            *self.acknowledged_at.lock() = Some(Instant::now());
        }
        first
    }

    /// Whether this checkpoint is still pending past its acknowledgement
    /// deadline. There is no separate "expired" signal from downstream;
    /// staleness is computed from the creation time.
    #[must_use]
    pub fn is_expired(&self, timeout: Duration) -> bool {
        self.outcome() == AckOutcome::Pending && self.created_at.elapsed() >= timeout
    }

    /// When the outcome arrived, if it has.
    #[must_use]
    pub fn acknowledged_at(&self) -> Option<Instant> {
        *self.acknowledged_at.lock()
    }
}

/// Persists a shard's progress through the coordinator.
///
/// Thin glue: sets the committed cursor on the shared progress state and
/// saves it, extending the lease as a side effect.
pub struct ShardCheckpointer {
    coordinator: Arc<dyn SourceCoordinator>,
    partition: ShardPartition,
    lease_extension: Duration,
    end_of_shard_extension: Duration,
}

impl ShardCheckpointer {
    /// Creates a checkpointer for one leased partition.
    #[must_use]
    pub fn new(
        coordinator: Arc<dyn SourceCoordinator>,
        partition: ShardPartition,
        lease_extension: Duration,
        end_of_shard_extension: Duration,
    ) -> Self {
        Self {
            coordinator,
            partition,
            lease_extension,
            end_of_shard_extension,
        }
    }

    /// Commits `sequence_number` (when supplied) and extends the lease.
    pub async fn checkpoint(&self, sequence_number: Option<String>) -> CoordinationResult<()> {
        self.partition.set_sequence_number(sequence_number);
        self.coordinator
            .save_progress_state(&self.partition, Some(self.lease_extension))
            .await?;
        debug!(
            partition = %self.partition,
            sequence = self.partition.progress().sequence_number.as_deref().unwrap_or("none"),
            "checkpointed shard"
        );
        Ok(())
    }

    /// Commits the shard's last cursor with a larger lease extension, so
    /// the scheduler has time to register children before the lease could
    /// be reclaimed.
    pub async fn checkpoint_end_of_shard(
        &self,
        sequence_number: Option<String>,
    ) -> CoordinationResult<()> {
        self.partition.set_sequence_number(sequence_number);
        self.coordinator
            .save_progress_state(&self.partition, Some(self.end_of_shard_extension))
            .await
    }

    /// Extends the lease without touching the committed cursor.
    pub async fn extend_lease(&self) -> CoordinationResult<()> {
        self.coordinator
            .save_progress_state(&self.partition, Some(self.lease_extension))
            .await
    }
}
