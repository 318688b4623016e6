//! Ingestion error types.

use thiserror::Error;

use tributary_coordination::CoordinationError;

use crate::buffer::BufferError;
use crate::source::SourceError;

/// Errors surfaced by shard consumers and the surrounding machinery.
///
/// Every variant returned from a consumer task ends the same way at the
/// scheduler: the shard's lease is surrendered so another worker retries
/// it from the last committed cursor. The variants exist so logs and
/// metrics can tell the failure classes apart.
#[derive(Debug, Error)]
pub enum IngestError {
    /// Reading the change log failed. Transient by assumption; the shard
    /// is retried after surrender.
    #[error(transparent)]
    Read(#[from] SourceError),

    /// Writing to the downstream buffer failed or timed out.
    #[error(transparent)]
    Buffer(#[from] BufferError),

    /// The acknowledgement tracker stopped tracking this shard, so the
    /// consumer must stop reading; another worker will pick the shard up.
    #[error("shard {0} is no longer tracked for acknowledgements")]
    NotTracked(String),

    /// The shard was surrendered after a negative or expired
    /// acknowledgement.
    #[error("shard {0} was surrendered after a failed acknowledgement")]
    Surrendered(String),

    /// The process-wide stop signal was observed; the consumer performed
    /// its final checkpoint and is exiting without completing the shard.
    #[error("interrupted by shutdown")]
    Interrupted,

    /// A coordination-store operation failed.
    #[error(transparent)]
    Coordination(#[from] CoordinationError),
}
