//! Shard topology discovery.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use crate::source::{ChangeLogSource, CursorPosition, ShardCursor, ShardInfo, SourceError};

/// Queries and caches the shard topology of change-log streams.
///
/// [`refresh`](Self::refresh) pulls the current listing from the source;
/// the lookup methods answer from the cached snapshot so the scheduler can
/// walk lineage without hammering the source's listing API.
pub struct ShardDiscovery {
    source: Arc<dyn ChangeLogSource>,
    topology: RwLock<HashMap<String, Vec<ShardInfo>>>,
}

impl ShardDiscovery {
    /// Creates a discovery service over `source`.
    #[must_use]
    pub fn new(source: Arc<dyn ChangeLogSource>) -> Self {
        Self {
            source,
            topology: RwLock::new(HashMap::new()),
        }
    }

    /// Refreshes the cached topology for `stream_id` and returns it.
    pub async fn refresh(&self, stream_id: &str) -> Result<Vec<ShardInfo>, SourceError> {
        let shards = self.source.list_shards(stream_id).await?;
        debug!(stream = stream_id, shards = shards.len(), "refreshed shard topology");
        self.topology
            .write()
            .insert(stream_id.to_string(), shards.clone());
        Ok(shards)
    }

    /// All shards of `stream_id` from the cached snapshot.
    #[must_use]
    pub fn shards(&self, stream_id: &str) -> Vec<ShardInfo> {
        self.topology
            .read()
            .get(stream_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Shards whose recorded parent is `parent_shard_id`.
    #[must_use]
    pub fn child_shards(&self, stream_id: &str, parent_shard_id: &str) -> Vec<ShardInfo> {
        self.shards(stream_id)
            .into_iter()
            .filter(|s| s.parent_shard_id.as_deref() == Some(parent_shard_id))
            .collect()
    }

    /// Shards still open for writes (no ending sequence number).
    #[must_use]
    pub fn open_shards(&self, stream_id: &str) -> Vec<ShardInfo> {
        self.shards(stream_id)
            .into_iter()
            .filter(ShardInfo::is_open)
            .collect()
    }

    /// Root shards: parent absent, or pointing at a shard that is no
    /// longer present in the topology (aged out of the listing).
    #[must_use]
    pub fn root_shards(&self, stream_id: &str) -> Vec<ShardInfo> {
        let shards = self.shards(stream_id);
        let known: HashSet<&str> = shards.iter().map(|s| s.shard_id.as_str()).collect();
        shards
            .iter()
            .filter(|s| match s.parent_shard_id.as_deref() {
                None => true,
                Some(parent) => !known.contains(parent),
            })
            .cloned()
            .collect()
    }

    /// Ending-sequence hint for a shard, from the cached snapshot.
    #[must_use]
    pub fn ending_sequence_number(&self, stream_id: &str, shard_id: &str) -> Option<String> {
        self.shards(stream_id)
            .into_iter()
            .find(|s| s.shard_id == shard_id)
            .and_then(|s| s.ending_sequence_number)
    }

    /// Cursor to resume reading a shard: strictly after `last_position`
    /// when one is supplied, else from the beginning.
    ///
    /// `Ok(None)` means the shard has expired out of retention — nothing
    /// retrievable, not a failure.
    pub async fn cursor_for(
        &self,
        stream_id: &str,
        shard_id: &str,
        last_position: Option<&str>,
    ) -> Result<Option<ShardCursor>, SourceError> {
        let position = match last_position {
            Some(sequence) => CursorPosition::AfterSequence(sequence.to_string()),
            None => CursorPosition::FromBeginning,
        };
        self.source.shard_cursor(stream_id, shard_id, position).await
    }
}
