use async_trait::async_trait;
use futures::stream::BoxStream;
use std::time::{Duration, SystemTime};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("backend error: {0}")]
    Backend(#[from] redis::RedisError),

    #[error("connection failed: {0}")]
    Connection(String),

    #[error("invalid partition key '{0}'")]
    InvalidKey(String),

    #[error("invalid key prefix '{0}'")]
    InvalidPrefix(String),

    #[error("payload for partition '{0}' contains a line break")]
    InvalidPayload(String),

    #[error("cursor {0:?} does not belong to this backend")]
    InvalidCursor(SequenceId),

    #[error("task join error: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Position of an entry inside a partition log.
///
/// File logs address entries by the byte offset their line starts at,
/// stream logs by the backend's native entry id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SequenceId {
    Offset(u64),
    Stream(String),
}

/// One raw record stored in a partition log
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub sequence_id: SequenceId,
    pub payload: Vec<u8>,
}

/// Lazy, finite sequence of entries returned by [`LogStore::read_range`]
pub type EntryStream = BoxStream<'static, Result<LogEntry, StoreError>>;

/// Append-only record log, one log per partition key.
#[async_trait]
pub trait LogStore: Send + Sync {
    /// True when the partition has a log, even an empty one.
    async fn exists(&self, key: &str) -> Result<bool, StoreError>;

    async fn append(&self, key: &str, payload: &[u8]) -> Result<(), StoreError> {
        self.append_batch(key, &[payload.to_vec()]).await
    }

    /// Append several records in one backend round trip. Either every payload
    /// is accepted or none is written.
    async fn append_batch(&self, key: &str, payloads: &[Vec<u8>]) -> Result<(), StoreError>;

    /// Record that the partition was drained completely. A partition that
    /// received no entries is left with an empty log so it still exists.
    async fn commit(&self, key: &str) -> Result<(), StoreError>;

    /// Read every entry strictly after `after`, or from the beginning when
    /// `after` is `None`. A missing partition reads as empty.
    async fn read_range(
        &self,
        key: &str,
        after: Option<SequenceId>,
    ) -> Result<EntryStream, StoreError>;

    /// Schedule the partition for deletion once it has aged past the TTL.
    async fn mark_for_removal(&self, key: &str) -> Result<(), StoreError>;

    /// Purge partitions that were marked for removal and have expired.
    /// Returns the number of partitions purged.
    async fn sweep_removals(&self) -> Result<usize, StoreError>;

    /// Delete a partition immediately, along with any removal marker.
    async fn remove(&self, key: &str) -> Result<(), StoreError>;
}

/// Memo of replay results keyed by chunk cache key.
#[async_trait]
pub trait ChunkCache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    async fn put(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), StoreError>;

    /// Remove expired entries, returning how many were removed.
    async fn sweep_expired(&self) -> Result<usize, StoreError>;
}

/// Partition keys end up in file names and stream keys verbatim.
pub(crate) fn validate_key(key: &str) -> Result<(), StoreError> {
    let invalid = key.is_empty()
        || key == "."
        || key == ".."
        || key.chars().any(|c| matches!(c, '/' | '\\' | '\0' | '\n' | '\r'));
    if invalid {
        return Err(StoreError::InvalidKey(key.to_string()));
    }
    Ok(())
}

/// File names are `{prefix}_{key}`, so the prefix must not contain the
/// separator or one store would claim another's files.
pub(crate) fn validate_prefix(prefix: &str) -> Result<(), StoreError> {
    let invalid = prefix.is_empty() || prefix.contains(['_', '/', '\\', '\0']);
    if invalid {
        return Err(StoreError::InvalidPrefix(prefix.to_string()));
    }
    Ok(())
}

pub(crate) fn validate_payloads(key: &str, payloads: &[Vec<u8>]) -> Result<(), StoreError> {
    if payloads.iter().any(|p| p.contains(&b'\n')) {
        return Err(StoreError::InvalidPayload(key.to_string()));
    }
    Ok(())
}

/// An entry expires once its age strictly exceeds the TTL. Timestamps in the
/// future never count as expired.
pub(crate) fn is_expired(now: SystemTime, modified: SystemTime, ttl: Duration) -> bool {
    now.duration_since(modified)
        .map(|age| age > ttl)
        .unwrap_or(false)
}
