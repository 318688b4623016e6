//! Change records.

use bytes::Bytes;

/// One entry of a shard's ordered change log.
///
/// The payload is opaque here: decoding the wire format into events is the
/// concern of whatever sits behind the downstream buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeRecord {
    /// Position of this record within its shard. Opaque, but ordered by
    /// the source: records arrive in non-decreasing sequence order.
    pub sequence_number: String,

    /// Approximate creation time of the change, epoch milliseconds. Drives
    /// the consumer's catch-up heuristic and the skip check.
    pub event_time_ms: i64,

    /// Raw record payload.
    pub payload: Bytes,
}

impl ChangeRecord {
    /// Creates a record.
    #[must_use]
    pub fn new(sequence_number: impl Into<String>, event_time_ms: i64, payload: Bytes) -> Self {
        Self {
            sequence_number: sequence_number.into(),
            event_time_ms,
            payload,
        }
    }
}
