//! Ingestion configuration.

use std::time::Duration;

/// Tuning knobs for the scheduler, consumers, and acknowledgement tracker.
///
/// The defaults suit a change-log source with second-scale propagation
/// delay and a downstream pipeline that acknowledges within minutes.
#[derive(Debug, Clone)]
pub struct IngestConfig {
    /// Maximum number of shard consumers running concurrently.
    pub max_workers: usize,

    /// How long the scheduler sleeps between lease-acquisition attempts.
    pub acquire_interval: Duration,

    /// Steady-state delay between polls when the consumer is caught up.
    pub poll_interval: Duration,

    /// Near-immediate delay used while the consumer is behind (last event
    /// older than [`lag_threshold`](Self::lag_threshold)).
    pub catch_up_poll_interval: Duration,

    /// Event-time lag beyond which the consumer switches to catch-up
    /// polling.
    pub lag_threshold: Duration,

    /// Maximum records fetched per poll.
    pub max_poll_records: usize,

    /// Bound on a single downstream buffer write. Exceeding it is a
    /// distinct timeout error, not a generic write failure.
    pub buffer_timeout: Duration,

    /// Wall-clock cadence for checkpointing even when idle, so the lease
    /// stays alive on a quiet shard.
    pub checkpoint_interval: Duration,

    /// Whether flushes must be acknowledged downstream before their
    /// cursors are committed. Off, flushes checkpoint synchronously.
    pub acknowledgments_enabled: bool,

    /// How long a checkpoint may stay unacknowledged before it is treated
    /// as negatively acknowledged.
    pub ack_timeout: Duration,

    /// Minimum gap between lease-refresh heartbeats for a shard whose
    /// checkpoint queue is blocked on a pending acknowledgement.
    pub keep_alive_interval: Duration,

    /// Delay between acknowledgement-monitor ticks.
    pub tracker_tick_interval: Duration,

    /// Bounded wait for the monitor loop to exit on shutdown before it is
    /// force-cancelled.
    pub tracker_shutdown_timeout: Duration,

    /// Lease extension granted by the end-of-shard checkpoint, sized so
    /// the scheduler has time to register children before the lease could
    /// lapse.
    pub end_of_shard_lease_extension: Duration,

    /// Delay between polls of the backfill-done signal while a consumer
    /// waits for the companion bulk backfill.
    pub backfill_poll_interval: Duration,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            max_workers: 16,
            acquire_interval: Duration::from_secs(1),
            poll_interval: Duration::from_millis(300),
            catch_up_poll_interval: Duration::from_millis(10),
            lag_threshold: Duration::from_secs(15),
            max_poll_records: 1000,
            buffer_timeout: Duration::from_secs(60),
            checkpoint_interval: Duration::from_secs(120),
            acknowledgments_enabled: false,
            ack_timeout: Duration::from_secs(600),
            keep_alive_interval: Duration::from_secs(180),
            tracker_tick_interval: Duration::from_secs(2),
            tracker_shutdown_timeout: Duration::from_secs(600),
            end_of_shard_lease_extension: Duration::from_secs(300),
            backfill_poll_interval: Duration::from_secs(60),
        }
    }
}
