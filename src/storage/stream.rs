use super::connection::{LazyConnection, RedisConnector};
use super::traits::{
    validate_key, validate_payloads, ChunkCache, EntryStream, LogEntry, LogStore, SequenceId,
    StoreError,
};
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use redis::aio::ConnectionManager;
use redis::streams::{StreamMaxlen, StreamRangeReply};
use redis::AsyncCommands;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

const PAYLOAD_FIELD: &str = "json";
const MEMO_FIELD: &str = "chunk";

pub type SharedRedis = Arc<LazyConnection<RedisConnector>>;

/// Partition logs kept as Redis streams named `prefix:key`.
///
/// Removal never deletes a stream outright; marking sets a native expiry so
/// other readers can still drain the stream until the TTL fires.
pub struct StreamLogStore {
    connection: SharedRedis,
    prefix: String,
    ttl: Duration,
    page_size: usize,
}

impl StreamLogStore {
    pub fn new(connection: SharedRedis, prefix: &str, ttl: Duration, page_size: usize) -> Self {
        Self {
            connection,
            prefix: prefix.to_string(),
            ttl,
            page_size: page_size.max(1),
        }
    }

    pub fn stream_key(&self, key: &str) -> String {
        format!("{}:{}", self.prefix, key)
    }
}

#[async_trait]
impl LogStore for StreamLogStore {
    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        validate_key(key)?;
        let mut conn = self.connection.get().await?;
        let present: bool = conn.exists(self.stream_key(key)).await?;
        Ok(present)
    }

    async fn append_batch(&self, key: &str, payloads: &[Vec<u8>]) -> Result<(), StoreError> {
        validate_key(key)?;
        validate_payloads(key, payloads)?;
        if payloads.is_empty() {
            return Ok(());
        }

        let stream_key = self.stream_key(key);
        let mut pipe = redis::pipe();
        pipe.atomic();
        for payload in payloads {
            pipe.xadd(&stream_key, "*", &[(PAYLOAD_FIELD, payload.as_slice())])
                .ignore();
        }

        let mut conn = self.connection.get().await?;
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }

    async fn commit(&self, key: &str) -> Result<(), StoreError> {
        validate_key(key)?;
        let stream_key = self.stream_key(key);
        let mut conn = self.connection.get().await?;
        let present: bool = conn.exists(&stream_key).await?;
        if !present {
            // MAXLEN 0 trims the placeholder at once, leaving an empty stream
            let _: Option<String> = conn
                .xadd_maxlen(&stream_key, StreamMaxlen::Equals(0), "*", &[(PAYLOAD_FIELD, "")])
                .await?;
        }
        Ok(())
    }

    async fn read_range(
        &self,
        key: &str,
        after: Option<SequenceId>,
    ) -> Result<EntryStream, StoreError> {
        validate_key(key)?;
        let start = match after {
            None => "-".to_string(),
            Some(SequenceId::Stream(id)) => format!("({}", id),
            Some(other) => return Err(StoreError::InvalidCursor(other)),
        };

        let pager = StreamPager {
            conn: self.connection.get().await?,
            key: self.stream_key(key),
            next_start: Some(start),
            page: VecDeque::new(),
            page_size: self.page_size,
        };
        Ok(stream::try_unfold(pager, StreamPager::next_entry).boxed())
    }

    async fn mark_for_removal(&self, key: &str) -> Result<(), StoreError> {
        validate_key(key)?;
        let mut conn = self.connection.get().await?;
        let _: () = conn
            .expire(self.stream_key(key), self.ttl.as_secs().max(1) as i64)
            .await?;
        tracing::debug!(partition = %key, ttl_secs = self.ttl.as_secs(), "Set stream expiry");
        Ok(())
    }

    async fn sweep_removals(&self) -> Result<usize, StoreError> {
        tracing::debug!("Stream backend expires partitions natively, nothing to sweep");
        Ok(0)
    }

    async fn remove(&self, key: &str) -> Result<(), StoreError> {
        validate_key(key)?;
        let mut conn = self.connection.get().await?;
        let _: () = conn.del(self.stream_key(key)).await?;
        Ok(())
    }
}

struct StreamPager {
    conn: ConnectionManager,
    key: String,
    next_start: Option<String>,
    page: VecDeque<LogEntry>,
    page_size: usize,
}

impl StreamPager {
    async fn next_entry(mut self) -> Result<Option<(LogEntry, Self)>, StoreError> {
        loop {
            if let Some(entry) = self.page.pop_front() {
                return Ok(Some((entry, self)));
            }
            let Some(start) = self.next_start.take() else {
                return Ok(None);
            };

            let reply: StreamRangeReply = self
                .conn
                .xrange_count(&self.key, &start, "+", self.page_size)
                .await?;

            if reply.ids.len() == self.page_size {
                if let Some(last) = reply.ids.last() {
                    self.next_start = Some(format!("({}", last.id));
                }
            }

            for id in reply.ids {
                match id.get::<Vec<u8>>(PAYLOAD_FIELD) {
                    Some(payload) => self.page.push_back(LogEntry {
                        sequence_id: SequenceId::Stream(id.id),
                        payload,
                    }),
                    None => tracing::warn!(stream = %self.key, entry = %id.id, "Stream entry without payload"),
                }
            }
        }
    }
}

/// Replay memo kept as Redis hashes named `prefix_key`, expiring natively
pub struct StreamChunkCache {
    connection: SharedRedis,
    prefix: String,
}

impl StreamChunkCache {
    pub fn new(connection: SharedRedis, prefix: &str) -> Self {
        Self {
            connection,
            prefix: prefix.to_string(),
        }
    }

    fn memo_key(&self, key: &str) -> String {
        format!("{}_{}", self.prefix, key)
    }
}

#[async_trait]
impl ChunkCache for StreamChunkCache {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        validate_key(key)?;
        let mut conn = self.connection.get().await?;
        let value: Option<Vec<u8>> = conn.hget(self.memo_key(key), MEMO_FIELD).await?;
        Ok(value)
    }

    async fn put(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), StoreError> {
        validate_key(key)?;
        let memo_key = self.memo_key(key);
        let mut conn = self.connection.get().await?;
        let _: () = redis::pipe()
            .atomic()
            .hset(&memo_key, MEMO_FIELD, value)
            .ignore()
            .expire(&memo_key, ttl.as_secs().max(1) as i64)
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn sweep_expired(&self) -> Result<usize, StoreError> {
        Ok(0)
    }
}
