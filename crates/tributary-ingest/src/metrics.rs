//! Ingestion metrics.

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters shared across the scheduler, consumers, and tracker.
#[derive(Debug, Default)]
pub struct IngestMetrics {
    records_read: AtomicU64,
    records_forwarded: AtomicU64,
    checkpoints_committed: AtomicU64,
    lease_keepalives: AtomicU64,
    shards_completed: AtomicU64,
    shards_surrendered: AtomicU64,
    shards_skipped: AtomicU64,
    read_errors: AtomicU64,
    negative_acks: AtomicU64,
    ack_timeouts: AtomicU64,
}

impl IngestMetrics {
    /// Creates zeroed metrics.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_read(&self, count: u64) {
        self.records_read.fetch_add(count, Ordering::Relaxed);
    }

    pub(crate) fn record_forwarded(&self, count: u64) {
        self.records_forwarded.fetch_add(count, Ordering::Relaxed);
    }

    pub(crate) fn record_checkpoint(&self) {
        self.checkpoints_committed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_keepalive(&self) {
        self.lease_keepalives.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_shard_completed(&self) {
        self.shards_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_shard_surrendered(&self) {
        self.shards_surrendered.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_shard_skipped(&self) {
        self.shards_skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_read_error(&self) {
        self.read_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_negative_ack(&self) {
        self.negative_acks.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_ack_timeout(&self) {
        self.ack_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    /// Point-in-time snapshot of all counters.
    #[must_use]
    pub fn snapshot(&self) -> IngestMetricsSnapshot {
        IngestMetricsSnapshot {
            records_read: self.records_read.load(Ordering::Relaxed),
            records_forwarded: self.records_forwarded.load(Ordering::Relaxed),
            checkpoints_committed: self.checkpoints_committed.load(Ordering::Relaxed),
            lease_keepalives: self.lease_keepalives.load(Ordering::Relaxed),
            shards_completed: self.shards_completed.load(Ordering::Relaxed),
            shards_surrendered: self.shards_surrendered.load(Ordering::Relaxed),
            shards_skipped: self.shards_skipped.load(Ordering::Relaxed),
            read_errors: self.read_errors.load(Ordering::Relaxed),
            negative_acks: self.negative_acks.load(Ordering::Relaxed),
            ack_timeouts: self.ack_timeouts.load(Ordering::Relaxed),
        }
    }
}

/// Immutable view of [`IngestMetrics`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IngestMetricsSnapshot {
    /// Records read from the change log.
    pub records_read: u64,
    /// Records written to the downstream buffer.
    pub records_forwarded: u64,
    /// Checkpoints committed to the coordinator.
    pub checkpoints_committed: u64,
    /// Lease refreshes issued without progress.
    pub lease_keepalives: u64,
    /// Shards fully delivered and completed.
    pub shards_completed: u64,
    /// Shards surrendered for retry.
    pub shards_surrendered: u64,
    /// Shards skipped because their contents predate the start time.
    pub shards_skipped: u64,
    /// Change-log read failures.
    pub read_errors: u64,
    /// Negative acknowledgements observed.
    pub negative_acks: u64,
    /// Acknowledgements that timed out.
    pub ack_timeouts: u64,
}
