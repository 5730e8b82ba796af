use super::merge::MergeReducer;
use crate::config::types::Config;
use crate::hash::{hash_value, HashError};
use crate::query::{ChunkBatch, QueryEngine, TimestampNormalizer};
use crate::storage::{ChunkCache, LogStore, StoreError};
use futures::stream::{FuturesOrdered, StreamExt};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum ReplayError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("hash error: {0}")]
    Hash(#[from] HashError),

    #[error("failed to encode chunk result: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("replay cancelled")]
    Cancelled,
}

/// A chunk that was skipped. Replay carries on without it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReplayWarning {
    #[error("chunk {chunk}: transform returned a non-list result")]
    NonListResult { chunk: usize },

    #[error("chunk {chunk}: transform failed: {error}")]
    TransformFailed { chunk: usize, error: String },

    #[error("chunk {chunk}: transform did not finish within {timeout:?}")]
    TransformTimedOut { chunk: usize, timeout: Duration },
}

/// Chunks flush as soon as either limit is reached
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkLimits {
    pub max_records: usize,
    pub max_bytes: usize,
}

#[derive(Debug, Clone)]
pub struct ReplaySettings {
    pub limits: ChunkLimits,
    pub concurrency: usize,
    pub transform_timeout: Option<Duration>,
    /// Lifetime of memoized chunk results
    pub ttl: Duration,
    pub timestamp: TimestampNormalizer,
}

impl From<&Config> for ReplaySettings {
    fn from(config: &Config) -> Self {
        Self {
            limits: ChunkLimits {
                max_records: config.chunk.max_records.max(1),
                max_bytes: config.chunk.max_bytes.max(1),
            },
            concurrency: config.replay.concurrency.max(1),
            transform_timeout: config.replay.transform_timeout,
            ttl: config.ttl,
            timestamp: TimestampNormalizer::new(&config.timestamp.field, &config.timestamp.format),
        }
    }
}

/// A run of raw payloads ready to be transformed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingChunk {
    /// 1-based position within the replay pass
    pub index: usize,
    pub payloads: Vec<Vec<u8>>,
    pub bytes: usize,
    /// Keys of the partitions contributing to this chunk, in order
    pub partitions: Vec<String>,
}

/// Groups raw payloads into size-bounded chunks. Chunks cross partition
/// boundaries.
#[derive(Debug)]
pub struct ChunkAssembler {
    limits: ChunkLimits,
    next_index: usize,
    current_partition: Option<String>,
    payloads: Vec<Vec<u8>>,
    bytes: usize,
    partitions: Vec<String>,
}

impl ChunkAssembler {
    pub fn new(limits: ChunkLimits) -> Self {
        Self {
            limits,
            next_index: 1,
            current_partition: None,
            payloads: Vec::new(),
            bytes: 0,
            partitions: Vec::new(),
        }
    }

    pub fn begin_partition(&mut self, key: &str) {
        self.current_partition = Some(key.to_string());
    }

    /// Buffer one payload, returning the chunk it completed, if any.
    pub fn push(&mut self, payload: Vec<u8>) -> Option<PendingChunk> {
        if let Some(key) = &self.current_partition {
            if self.partitions.last() != Some(key) {
                self.partitions.push(key.clone());
            }
        }
        self.bytes += payload.len();
        self.payloads.push(payload);

        if self.payloads.len() >= self.limits.max_records || self.bytes >= self.limits.max_bytes {
            return self.flush();
        }
        None
    }

    /// Flush whatever is left as the final, possibly short, chunk.
    pub fn finish(&mut self) -> Option<PendingChunk> {
        self.flush()
    }

    fn flush(&mut self) -> Option<PendingChunk> {
        if self.payloads.is_empty() {
            return None;
        }
        let chunk = PendingChunk {
            index: self.next_index,
            payloads: std::mem::take(&mut self.payloads),
            bytes: std::mem::take(&mut self.bytes),
            partitions: std::mem::take(&mut self.partitions),
        };
        self.next_index += 1;
        Some(chunk)
    }
}

/// Everything that identifies a memoized chunk result
#[derive(Debug, Serialize)]
pub struct ChunkDescriptor<'a> {
    pub batch_index: usize,
    pub record_count: usize,
    pub byte_count: usize,
    pub partitions: &'a [String],
    pub pipeline: &'a Value,
}

impl<'a> ChunkDescriptor<'a> {
    pub fn new(chunk: &'a PendingChunk, pipeline: &'a Value) -> Self {
        Self {
            batch_index: chunk.index,
            record_count: chunk.payloads.len(),
            byte_count: chunk.bytes,
            partitions: &chunk.partitions,
            pipeline,
        }
    }

    pub fn cache_key(&self) -> Result<String, HashError> {
        hash_value(self)
    }
}

#[derive(Debug, Clone)]
pub struct ReplayRequest {
    pub keys: Vec<String>,
    pub pipeline: Value,
    pub merge_fields: Vec<String>,
    pub ignore_fields: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplayStats {
    pub partitions: usize,
    pub entries_read: usize,
    pub chunks: usize,
    pub memo_hits: usize,
    pub transformed: usize,
    pub warnings: Vec<ReplayWarning>,
}

impl ReplayStats {
    pub fn skipped(&self) -> usize {
        self.warnings.len()
    }
}

#[derive(Debug, Clone)]
pub struct ReplayOutput {
    pub records: Vec<Value>,
    pub stats: ReplayStats,
}

enum ChunkOutcome {
    Loaded(Vec<Value>),
    Transformed(Vec<Value>),
    Skipped(ReplayWarning),
}

/// Re-reads partition logs in chunks, transforms each chunk through the
/// chunk cache and folds the results together.
pub struct ReplayEngine {
    log_store: Arc<dyn LogStore>,
    chunk_cache: Arc<dyn ChunkCache>,
    query_engine: Arc<dyn QueryEngine>,
    settings: ReplaySettings,
    cancel: CancellationToken,
}

impl ReplayEngine {
    pub fn new(
        log_store: Arc<dyn LogStore>,
        chunk_cache: Arc<dyn ChunkCache>,
        query_engine: Arc<dyn QueryEngine>,
        settings: ReplaySettings,
    ) -> Self {
        Self {
            log_store,
            chunk_cache,
            query_engine,
            settings,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub async fn replay(&self, request: &ReplayRequest) -> Result<ReplayOutput, ReplayError> {
        match self.chunk_cache.sweep_expired().await {
            Ok(0) => {}
            Ok(removed) => info!(removed, "Expired chunk results cleared"),
            Err(e) => warn!(error = %e, "Failed to sweep expired chunk results"),
        }

        let concurrency = self.settings.concurrency.max(1);
        let mut reducer = MergeReducer::new(&request.merge_fields, &request.ignore_fields);
        let mut stats = ReplayStats::default();
        let mut assembler = ChunkAssembler::new(self.settings.limits);
        let mut in_flight = FuturesOrdered::new();

        for key in &request.keys {
            stats.partitions += 1;
            assembler.begin_partition(key);
            let mut entries = self.log_store.read_range(key, None).await?;
            debug!(partition = %key, "Replaying partition");

            while let Some(entry) = entries.next().await {
                let entry = entry?;
                stats.entries_read += 1;
                if let Some(chunk) = assembler.push(entry.payload) {
                    in_flight.push_back(self.resolve_chunk(chunk, &request.pipeline));
                    if in_flight.len() >= concurrency {
                        if let Some(outcome) = in_flight.next().await {
                            absorb(outcome?, &mut reducer, &mut stats);
                        }
                    }
                }
            }
        }

        if let Some(chunk) = assembler.finish() {
            in_flight.push_back(self.resolve_chunk(chunk, &request.pipeline));
        }
        while let Some(outcome) = in_flight.next().await {
            absorb(outcome?, &mut reducer, &mut stats);
        }

        info!(
            partitions = stats.partitions,
            chunks = stats.chunks,
            memo_hits = stats.memo_hits,
            skipped = stats.skipped(),
            "Replay finished"
        );

        Ok(ReplayOutput {
            records: reducer.finish(),
            stats,
        })
    }

    async fn resolve_chunk(
        &self,
        chunk: PendingChunk,
        pipeline: &Value,
    ) -> Result<ChunkOutcome, ReplayError> {
        let key = ChunkDescriptor::new(&chunk, pipeline).cache_key()?;

        match self.chunk_cache.get(&key).await {
            Ok(Some(bytes)) => match serde_json::from_slice::<Vec<Value>>(&bytes) {
                Ok(records) => {
                    info!(chunk = chunk.index, key = %key, "Loading chunk");
                    return Ok(ChunkOutcome::Loaded(records));
                }
                Err(e) => warn!(chunk = chunk.index, error = %e, "Unreadable chunk result, recomputing"),
            },
            Ok(None) => {}
            Err(e) => warn!(chunk = chunk.index, error = %e, "Chunk cache lookup failed"),
        }

        info!(
            chunk = chunk.index,
            records = chunk.payloads.len(),
            bytes = chunk.bytes,
            "Processing chunk"
        );
        let batch = ChunkBatch::from_payloads(
            chunk.payloads.iter().map(Vec::as_slice),
            &self.settings.timestamp,
        );

        let transform = async {
            match self.settings.transform_timeout {
                Some(limit) => tokio::time::timeout(limit, self.query_engine.apply(batch, pipeline))
                    .await
                    .map_err(|_| limit),
                None => Ok(self.query_engine.apply(batch, pipeline).await),
            }
        };
        let result = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(ReplayError::Cancelled),
            result = transform => result,
        };

        let value = match result {
            Ok(Ok(value)) => value,
            Ok(Err(e)) => {
                return Ok(ChunkOutcome::Skipped(ReplayWarning::TransformFailed {
                    chunk: chunk.index,
                    error: e.to_string(),
                }))
            }
            Err(timeout) => {
                return Ok(ChunkOutcome::Skipped(ReplayWarning::TransformTimedOut {
                    chunk: chunk.index,
                    timeout,
                }))
            }
        };

        let Value::Array(records) = value else {
            return Ok(ChunkOutcome::Skipped(ReplayWarning::NonListResult {
                chunk: chunk.index,
            }));
        };

        let encoded = serde_json::to_vec(&records)?;
        if let Err(e) = self.chunk_cache.put(&key, &encoded, self.settings.ttl).await {
            warn!(chunk = chunk.index, error = %e, "Failed to store chunk result");
        }
        Ok(ChunkOutcome::Transformed(records))
    }
}

fn absorb(outcome: ChunkOutcome, reducer: &mut MergeReducer, stats: &mut ReplayStats) {
    stats.chunks += 1;
    match outcome {
        ChunkOutcome::Loaded(records) => {
            stats.memo_hits += 1;
            reducer.accept(records);
        }
        ChunkOutcome::Transformed(records) => {
            stats.transformed += 1;
            reducer.accept(records);
        }
        ChunkOutcome::Skipped(warning) => {
            warn!(warning = %warning, "Skipping chunk");
            stats.warnings.push(warning);
        }
    }
}
