//! The change-log source boundary.

use async_trait::async_trait;
use thiserror::Error;

use crate::record::ChangeRecord;

/// Errors raised by a change-log source.
#[derive(Debug, Error)]
pub enum SourceError {
    /// The stream does not exist at the source.
    #[error("stream {0} not found")]
    StreamNotFound(String),

    /// Reading a shard failed.
    #[error("shard read failed: {0}")]
    Read(String),

    /// The source is temporarily unreachable.
    #[error("source unavailable: {0}")]
    Unavailable(String),
}

/// Where in a shard to start reading.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CursorPosition {
    /// The oldest retained record of the shard.
    FromBeginning,
    /// Strictly after the given sequence number; used when resuming from
    /// committed progress.
    AfterSequence(String),
    /// At the given sequence number itself; used to inspect the record at
    /// a known position (e.g. the final-cursor skip check).
    AtSequence(String),
}

/// An opaque read position handed back by the source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardCursor {
    /// Stream the cursor reads from.
    pub stream_id: String,
    /// Shard the cursor reads from.
    pub shard_id: String,
    /// Source-defined position token.
    pub token: String,
}

/// Result of one shard poll.
#[derive(Debug, Clone)]
pub struct ShardPoll {
    /// Records read, in shard order. May be empty on an open shard with
    /// nothing new.
    pub records: Vec<ChangeRecord>,
    /// Cursor for the next poll; `None` means the shard is closed and
    /// fully read (end of shard).
    pub next_cursor: Option<ShardCursor>,
}

/// Shard metadata as reported by the source's topology listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardInfo {
    /// Source-assigned shard id.
    pub shard_id: String,
    /// Parent shard this one split from, if the source still reports it.
    pub parent_shard_id: Option<String>,
    /// First sequence number of the shard, if known.
    pub starting_sequence_number: Option<String>,
    /// Last sequence number of the shard; `None` while the shard is still
    /// open for writes.
    pub ending_sequence_number: Option<String>,
}

impl ShardInfo {
    /// Whether the shard is still open for writes.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.ending_sequence_number.is_none()
    }
}

/// Read access to a sharded, ordered change log.
#[async_trait]
pub trait ChangeLogSource: Send + Sync {
    /// Lists the current shard topology of a stream.
    async fn list_shards(&self, stream_id: &str) -> Result<Vec<ShardInfo>, SourceError>;

    /// Obtains a cursor for reading a shard from `position`.
    ///
    /// Returns `Ok(None)` — not an error — when the shard has expired out
    /// of the source's retention window: there is nothing retrievable, and
    /// callers treat the shard as contributing no data.
    async fn shard_cursor(
        &self,
        stream_id: &str,
        shard_id: &str,
        position: CursorPosition,
    ) -> Result<Option<ShardCursor>, SourceError>;

    /// Reads up to `limit` records at `cursor`.
    async fn read_records(
        &self,
        cursor: &ShardCursor,
        limit: usize,
    ) -> Result<ShardPoll, SourceError>;
}
