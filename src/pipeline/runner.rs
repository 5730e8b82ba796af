use super::generate::{GenerationEngine, GenerationReport, GenerationSettings};
use super::replay::{ReplayEngine, ReplayError, ReplayOutput, ReplayRequest, ReplaySettings};
use crate::config::types::Config;
use crate::query::{ChunkBatch, QueryEngine, QueryError};
use crate::source::DataSource;
use crate::splitter::{Partition, SplitError, Splitter};
use crate::storage::{Backends, StoreError};
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("no splitter configured")]
    NoSplitter,

    #[error("splitter produced no partitions")]
    NoPartitions,

    #[error("split error: {0}")]
    Split(#[from] SplitError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("replay error: {0}")]
    Replay(#[from] ReplayError),

    #[error("post-processing failed: {0}")]
    Query(#[from] QueryError),

    #[error("post-processing returned a non-list result")]
    NonListResult,
}

/// Engine knobs derived from the config file
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub generation: GenerationSettings,
    pub replay: ReplaySettings,
    /// Keep ephemeral partition logs after replay
    pub persistent: bool,
}

impl From<&Config> for EngineSettings {
    fn from(config: &Config) -> Self {
        Self {
            generation: GenerationSettings::from(config),
            replay: ReplaySettings::from(config),
            persistent: config.persistent,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub partitions: usize,
    pub chunks: usize,
}

/// Result of a full split, generate, replay and post-process cycle
#[derive(Debug)]
pub struct RunOutcome {
    pub records: Vec<Value>,
    pub generation: GenerationReport,
    pub replay: ReplayOutput,
}

/// Wires the storage backends, splitter, data source and query engine
/// together.
pub struct CachePipeline {
    backends: Backends,
    splitter: Option<Arc<dyn Splitter>>,
    source: Arc<dyn DataSource>,
    query_engine: Arc<dyn QueryEngine>,
    settings: EngineSettings,
    cancel: CancellationToken,
}

impl CachePipeline {
    pub fn new(
        backends: Backends,
        source: Arc<dyn DataSource>,
        query_engine: Arc<dyn QueryEngine>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            backends,
            splitter: None,
            source,
            query_engine,
            settings,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_splitter(mut self, splitter: Arc<dyn Splitter>) -> Self {
        self.splitter = Some(splitter);
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn split(&self) -> Result<Vec<Partition>, PipelineError> {
        let splitter = self.splitter.as_ref().ok_or(PipelineError::NoSplitter)?;
        let partitions = splitter.split()?;
        if partitions.is_empty() {
            return Err(PipelineError::NoPartitions);
        }
        info!(partitions = partitions.len(), "Request split");
        Ok(partitions)
    }

    pub async fn generate(&self, partitions: &[Partition]) -> GenerationReport {
        GenerationEngine::new(
            self.backends.log_store.clone(),
            self.source.clone(),
            self.settings.generation.clone(),
        )
        .with_cancellation(self.cancel.clone())
        .generate(partitions)
        .await
    }

    /// Replay the given partitions. Unless persistent, ephemeral partitions
    /// that have aged out are swept afterwards.
    pub async fn replay(&self, request: &ReplayRequest) -> Result<ReplayOutput, PipelineError> {
        let output = ReplayEngine::new(
            self.backends.log_store.clone(),
            self.backends.chunk_cache.clone(),
            self.query_engine.clone(),
            self.settings.replay.clone(),
        )
        .with_cancellation(self.cancel.clone())
        .replay(request)
        .await?;

        if !self.settings.persistent {
            match self.backends.log_store.sweep_removals().await {
                Ok(purged) => info!(purged, "Ephemeral partitions swept"),
                Err(e) => warn!(error = %e, "Failed to sweep ephemeral partitions"),
            }
        }
        Ok(output)
    }

    /// Run a pipeline over already merged records.
    pub async fn post_process(
        &self,
        records: Vec<Value>,
        pipeline: &Value,
    ) -> Result<Vec<Value>, PipelineError> {
        let fields = records
            .into_iter()
            .filter_map(|record| match record {
                Value::Object(fields) => Some(fields),
                _ => None,
            })
            .collect();
        let batch = ChunkBatch::from_records(fields, &self.settings.replay.timestamp);

        match self.query_engine.apply(batch, pipeline).await? {
            Value::Array(records) => Ok(records),
            _ => Err(PipelineError::NonListResult),
        }
    }

    /// Purge expired partition logs and chunk results.
    pub async fn sweep(&self) -> Result<SweepReport, PipelineError> {
        let partitions = self.backends.log_store.sweep_removals().await?;
        let chunks = self.backends.chunk_cache.sweep_expired().await?;
        info!(partitions, chunks, "Sweep finished");
        Ok(SweepReport { partitions, chunks })
    }

    /// Split, generate, replay, then post-process when a post pipeline is set.
    pub async fn run(
        &self,
        pipeline: &Value,
        merge_fields: &[String],
        ignore_fields: &[String],
        post_pipeline: Option<&Value>,
    ) -> Result<RunOutcome, PipelineError> {
        let partitions = self.split()?;
        let generation = self.generate(&partitions).await;
        for (key, error) in generation.failures() {
            warn!(partition = %key, error = %error, "Partition not fully generated");
        }

        let request = ReplayRequest {
            keys: generation.keys(),
            pipeline: pipeline.clone(),
            merge_fields: merge_fields.to_vec(),
            ignore_fields: ignore_fields.to_vec(),
        };
        let replay = self.replay(&request).await?;

        let records = match post_pipeline {
            Some(post) => self.post_process(replay.records.clone(), post).await?,
            None => replay.records.clone(),
        };

        Ok(RunOutcome {
            records,
            generation,
            replay,
        })
    }
}
