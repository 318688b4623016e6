//! In-memory change log.
//!
//! [`InMemoryChangeLog`] implements [`ChangeLogSource`] over process-local
//! state with controllable topology: shards can be appended to, closed
//! with an ending sequence number, split into children, and trimmed out of
//! retention. It drives the test suite and local development.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::record::ChangeRecord;
use crate::source::{
    ChangeLogSource, CursorPosition, ShardCursor, ShardInfo, ShardPoll, SourceError,
};

struct ShardData {
    info: ShardInfo,
    records: Vec<ChangeRecord>,
    closed: bool,
    trimmed: bool,
}

/// A controllable, process-local [`ChangeLogSource`].
#[derive(Default)]
pub struct InMemoryChangeLog {
    /// Stream id → shard id → shard. `BTreeMap` keeps listing order stable.
    streams: RwLock<HashMap<String, BTreeMap<String, ShardData>>>,
}

impl InMemoryChangeLog {
    /// Creates an empty change log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an open shard to a stream, creating the stream if needed.
    pub fn add_shard(&self, stream_id: &str, shard_id: &str, parent_shard_id: Option<&str>) {
        let mut streams = self.streams.write();
        let shards = streams.entry(stream_id.to_string()).or_default();
        shards.insert(
            shard_id.to_string(),
            ShardData {
                info: ShardInfo {
                    shard_id: shard_id.to_string(),
                    parent_shard_id: parent_shard_id.map(String::from),
                    starting_sequence_number: None,
                    ending_sequence_number: None,
                },
                records: Vec::new(),
                closed: false,
                trimmed: false,
            },
        );
    }

    /// Appends records to a shard.
    ///
    /// # Panics
    ///
    /// Panics if the stream or shard does not exist, or the shard is
    /// closed; tests should build topology before writing.
    pub fn push_records(&self, stream_id: &str, shard_id: &str, records: Vec<ChangeRecord>) {
        let mut streams = self.streams.write();
        let shard = streams
            .get_mut(stream_id)
            .and_then(|s| s.get_mut(shard_id))
            .expect("shard must exist");
        assert!(!shard.closed, "cannot append to a closed shard");
        if shard.info.starting_sequence_number.is_none() {
            shard.info.starting_sequence_number =
                records.first().map(|r| r.sequence_number.clone());
        }
        shard.records.extend(records);
    }

    /// Closes a shard for writes, stamping its ending sequence number.
    ///
    /// # Panics
    ///
    /// Panics if the stream or shard does not exist.
    pub fn close_shard(&self, stream_id: &str, shard_id: &str) {
        let mut streams = self.streams.write();
        let shard = streams
            .get_mut(stream_id)
            .and_then(|s| s.get_mut(shard_id))
            .expect("shard must exist");
        shard.closed = true;
        shard.info.ending_sequence_number =
            shard.records.last().map(|r| r.sequence_number.clone());
    }

    /// Expires a shard out of the retention window: cursors are no longer
    /// obtainable for it.
    ///
    /// # Panics
    ///
    /// Panics if the stream or shard does not exist.
    pub fn trim_shard(&self, stream_id: &str, shard_id: &str) {
        let mut streams = self.streams.write();
        let shard = streams
            .get_mut(stream_id)
            .and_then(|s| s.get_mut(shard_id))
            .expect("shard must exist");
        shard.trimmed = true;
    }

    fn index_for(shard: &ShardData, position: &CursorPosition) -> Option<usize> {
        match position {
            CursorPosition::FromBeginning => Some(0),
            CursorPosition::AfterSequence(seq) => shard
                .records
                .iter()
                .position(|r| &r.sequence_number == seq)
                .map(|i| i + 1),
            CursorPosition::AtSequence(seq) => {
                shard.records.iter().position(|r| &r.sequence_number == seq)
            }
        }
    }
}

#[async_trait]
impl ChangeLogSource for InMemoryChangeLog {
    async fn list_shards(&self, stream_id: &str) -> Result<Vec<ShardInfo>, SourceError> {
        let streams = self.streams.read();
        let shards = streams
            .get(stream_id)
            .ok_or_else(|| SourceError::StreamNotFound(stream_id.to_string()))?;
        Ok(shards.values().map(|s| s.info.clone()).collect())
    }

    async fn shard_cursor(
        &self,
        stream_id: &str,
        shard_id: &str,
        position: CursorPosition,
    ) -> Result<Option<ShardCursor>, SourceError> {
        let streams = self.streams.read();
        let shard = streams
            .get(stream_id)
            .ok_or_else(|| SourceError::StreamNotFound(stream_id.to_string()))?
            .get(shard_id)
            .ok_or_else(|| SourceError::Read(format!("shard {shard_id} not found")))?;

        if shard.trimmed {
            return Ok(None);
        }
        // A position naming a sequence number that no longer exists is
        // also unretrievable.
        let Some(index) = Self::index_for(shard, &position) else {
            return Ok(None);
        };
        Ok(Some(ShardCursor {
            stream_id: stream_id.to_string(),
            shard_id: shard_id.to_string(),
            token: index.to_string(),
        }))
    }

    async fn read_records(
        &self,
        cursor: &ShardCursor,
        limit: usize,
    ) -> Result<ShardPoll, SourceError> {
        let streams = self.streams.read();
        let shard = streams
            .get(&cursor.stream_id)
            .ok_or_else(|| SourceError::StreamNotFound(cursor.stream_id.clone()))?
            .get(&cursor.shard_id)
            .ok_or_else(|| SourceError::Read(format!("shard {} not found", cursor.shard_id)))?;

        if shard.trimmed {
            return Err(SourceError::Read(format!(
                "cursor for shard {} has expired",
                cursor.shard_id
            )));
        }
        let index: usize = cursor
            .token
            .parse()
            .map_err(|_| SourceError::Read(format!("malformed cursor token {}", cursor.token)))?;

        let end = shard.records.len().min(index.saturating_add(limit));
        let records = shard.records[index.min(shard.records.len())..end].to_vec();

        let next_cursor = if shard.closed && end == shard.records.len() {
            None
        } else {
            Some(ShardCursor {
                stream_id: cursor.stream_id.clone(),
                shard_id: cursor.shard_id.clone(),
                token: end.to_string(),
            })
        };
        Ok(ShardPoll {
            records,
            next_cursor,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn record(seq: u64) -> ChangeRecord {
        ChangeRecord::new(seq.to_string(), 1_700_000_000_000, Bytes::from_static(b"{}"))
    }

    #[tokio::test]
    async fn test_list_shards() {
        let log = InMemoryChangeLog::new();
        log.add_shard("orders", "shard-0001", None);
        log.add_shard("orders", "shard-0002", Some("shard-0001"));

        let shards = log.list_shards("orders").await.unwrap();
        assert_eq!(shards.len(), 2);
        assert_eq!(shards[0].shard_id, "shard-0001");
        assert_eq!(shards[1].parent_shard_id.as_deref(), Some("shard-0001"));

        assert!(matches!(
            log.list_shards("unknown").await.unwrap_err(),
            SourceError::StreamNotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_read_from_beginning_to_end_of_shard() {
        let log = InMemoryChangeLog::new();
        log.add_shard("orders", "shard-0001", None);
        log.push_records("orders", "shard-0001", vec![record(1), record(2), record(3)]);
        log.close_shard("orders", "shard-0001");

        let cursor = log
            .shard_cursor("orders", "shard-0001", CursorPosition::FromBeginning)
            .await
            .unwrap()
            .unwrap();
        let poll = log.read_records(&cursor, 2).await.unwrap();
        assert_eq!(poll.records.len(), 2);
        let next = poll.next_cursor.unwrap();

        let poll = log.read_records(&next, 10).await.unwrap();
        assert_eq!(poll.records.len(), 1);
        assert_eq!(poll.records[0].sequence_number, "3");
        assert!(poll.next_cursor.is_none(), "closed + exhausted = end of shard");
    }

    #[tokio::test]
    async fn test_open_shard_keeps_returning_a_cursor() {
        let log = InMemoryChangeLog::new();
        log.add_shard("orders", "shard-0001", None);
        log.push_records("orders", "shard-0001", vec![record(1)]);

        let cursor = log
            .shard_cursor("orders", "shard-0001", CursorPosition::FromBeginning)
            .await
            .unwrap()
            .unwrap();
        let poll = log.read_records(&cursor, 10).await.unwrap();
        assert_eq!(poll.records.len(), 1);
        let next = poll.next_cursor.expect("open shard never ends");

        // Nothing new yet: empty poll, cursor unchanged.
        let poll = log.read_records(&next, 10).await.unwrap();
        assert!(poll.records.is_empty());
        assert_eq!(poll.next_cursor.unwrap().token, next.token);
    }

    #[tokio::test]
    async fn test_after_sequence_resumes_strictly_after() {
        let log = InMemoryChangeLog::new();
        log.add_shard("orders", "shard-0001", None);
        log.push_records("orders", "shard-0001", vec![record(1), record(2), record(3)]);

        let cursor = log
            .shard_cursor(
                "orders",
                "shard-0001",
                CursorPosition::AfterSequence("2".to_string()),
            )
            .await
            .unwrap()
            .unwrap();
        let poll = log.read_records(&cursor, 10).await.unwrap();
        assert_eq!(poll.records.len(), 1);
        assert_eq!(poll.records[0].sequence_number, "3");
    }

    #[tokio::test]
    async fn test_at_sequence_includes_the_record() {
        let log = InMemoryChangeLog::new();
        log.add_shard("orders", "shard-0001", None);
        log.push_records("orders", "shard-0001", vec![record(1), record(2)]);

        let cursor = log
            .shard_cursor(
                "orders",
                "shard-0001",
                CursorPosition::AtSequence("2".to_string()),
            )
            .await
            .unwrap()
            .unwrap();
        let poll = log.read_records(&cursor, 1).await.unwrap();
        assert_eq!(poll.records[0].sequence_number, "2");
    }

    #[tokio::test]
    async fn test_trimmed_shard_has_no_cursor() {
        let log = InMemoryChangeLog::new();
        log.add_shard("orders", "shard-0001", None);
        log.push_records("orders", "shard-0001", vec![record(1)]);
        log.trim_shard("orders", "shard-0001");

        let cursor = log
            .shard_cursor("orders", "shard-0001", CursorPosition::FromBeginning)
            .await
            .unwrap();
        assert!(cursor.is_none(), "expired shard yields no cursor, not an error");
    }

    #[tokio::test]
    async fn test_unknown_sequence_has_no_cursor() {
        let log = InMemoryChangeLog::new();
        log.add_shard("orders", "shard-0001", None);
        log.push_records("orders", "shard-0001", vec![record(1)]);

        let cursor = log
            .shard_cursor(
                "orders",
                "shard-0001",
                CursorPosition::AfterSequence("99".to_string()),
            )
            .await
            .unwrap();
        assert!(cursor.is_none());
    }

    #[tokio::test]
    async fn test_close_shard_stamps_ending_sequence() {
        let log = InMemoryChangeLog::new();
        log.add_shard("orders", "shard-0001", None);
        log.push_records("orders", "shard-0001", vec![record(1), record(2)]);
        log.close_shard("orders", "shard-0001");

        let shards = log.list_shards("orders").await.unwrap();
        assert_eq!(shards[0].ending_sequence_number.as_deref(), Some("2"));
        assert!(!shards[0].is_open());
    }
}
