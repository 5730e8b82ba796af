use crate::config::types::Config;
use crate::source::{DataSource, SourceError};
use crate::splitter::Partition;
use crate::storage::{LogStore, StoreError};
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Failure of a single partition. Entries written before the failure stay
/// in the log.
#[derive(Debug, Error)]
pub enum GenerateError {
    #[error("source error: {0}")]
    Source(#[from] SourceError),

    #[error("write error: {0}")]
    Store(#[from] StoreError),

    #[error("failed to encode record: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("source did not finish within {0:?}")]
    TimedOut(Duration),

    #[error("generation cancelled")]
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct GenerationSettings {
    pub force_regenerate: bool,
    pub concurrency: usize,
    pub write_batch_size: usize,
    pub source_timeout: Option<Duration>,
}

impl Default for GenerationSettings {
    fn default() -> Self {
        Self {
            force_regenerate: false,
            concurrency: 1,
            write_batch_size: 1000,
            source_timeout: None,
        }
    }
}

impl From<&Config> for GenerationSettings {
    fn from(config: &Config) -> Self {
        Self {
            force_regenerate: config.force_regenerate,
            concurrency: config.generation.concurrency.max(1),
            write_batch_size: config.generation.write_batch_size.max(1),
            source_timeout: config.generation.source_timeout,
        }
    }
}

#[derive(Debug)]
pub enum PartitionStatus {
    /// Already in the log store, the source was not read
    Preloaded,
    Generated { records: usize },
    Failed(GenerateError),
}

#[derive(Debug)]
pub struct PartitionReport {
    pub key: String,
    pub status: PartitionStatus,
}

/// Outcome of one generation pass, in input order
#[derive(Debug, Default)]
pub struct GenerationReport {
    pub partitions: Vec<PartitionReport>,
}

impl GenerationReport {
    /// Every partition key in input order, whatever happened to it
    pub fn keys(&self) -> Vec<String> {
        self.partitions.iter().map(|p| p.key.clone()).collect()
    }

    pub fn failures(&self) -> impl Iterator<Item = (&str, &GenerateError)> {
        self.partitions.iter().filter_map(|p| match &p.status {
            PartitionStatus::Failed(e) => Some((p.key.as_str(), e)),
            _ => None,
        })
    }

    pub fn preloaded(&self) -> usize {
        self.partitions
            .iter()
            .filter(|p| matches!(p.status, PartitionStatus::Preloaded))
            .count()
    }

    pub fn records_written(&self) -> usize {
        self.partitions
            .iter()
            .map(|p| match p.status {
                PartitionStatus::Generated { records } => records,
                _ => 0,
            })
            .sum()
    }
}

/// Drains data source cursors into the log store, once per partition.
pub struct GenerationEngine {
    log_store: Arc<dyn LogStore>,
    source: Arc<dyn DataSource>,
    settings: GenerationSettings,
    cancel: CancellationToken,
}

impl GenerationEngine {
    pub fn new(
        log_store: Arc<dyn LogStore>,
        source: Arc<dyn DataSource>,
        settings: GenerationSettings,
    ) -> Self {
        Self {
            log_store,
            source,
            settings,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Populate the log store for every partition. A failing partition does
    /// not stop the others.
    pub async fn generate(&self, partitions: &[Partition]) -> GenerationReport {
        let partitions = stream::iter(partitions)
            .map(|partition| async move {
                let status = self.generate_partition(partition).await;
                PartitionReport {
                    key: partition.key.clone(),
                    status,
                }
            })
            .buffered(self.settings.concurrency.max(1))
            .collect()
            .await;
        GenerationReport { partitions }
    }

    async fn generate_partition(&self, partition: &Partition) -> PartitionStatus {
        let key = partition.key.as_str();

        let exists = match self.log_store.exists(key).await {
            Ok(exists) => exists,
            Err(e) => {
                error!(partition = %key, error = %e, "Failed to check partition log");
                return PartitionStatus::Failed(e.into());
            }
        };

        if exists {
            if !self.settings.force_regenerate {
                info!(partition = %key, "Pre-loading partition");
                return PartitionStatus::Preloaded;
            }
            debug!(partition = %key, "Removing partition log before regenerating");
            if let Err(e) = self.log_store.remove(key).await {
                error!(partition = %key, error = %e, "Failed to remove partition log");
                return PartitionStatus::Failed(e.into());
            }
        }

        info!(
            partition = %key,
            kind = partition.kind.as_deref().unwrap_or("-"),
            "Pre-processing partition"
        );

        let drained = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(GenerateError::Cancelled),
            result = self.drain_with_timeout(partition) => result,
        };

        let records = match drained {
            Ok(records) => records,
            Err(e) => {
                error!(partition = %key, error = %e, "Partition generation failed");
                return PartitionStatus::Failed(e);
            }
        };

        if !partition.cacheable {
            if let Err(e) = self.log_store.mark_for_removal(key).await {
                warn!(partition = %key, error = %e, "Failed to mark partition for removal");
                return PartitionStatus::Failed(e.into());
            }
        }

        info!(partition = %key, records, "Partition generated");
        PartitionStatus::Generated { records }
    }

    async fn drain_with_timeout(&self, partition: &Partition) -> Result<usize, GenerateError> {
        match self.settings.source_timeout {
            Some(limit) => tokio::time::timeout(limit, self.drain(partition))
                .await
                .map_err(|_| GenerateError::TimedOut(limit))?,
            None => self.drain(partition).await,
        }
    }

    async fn drain(&self, partition: &Partition) -> Result<usize, GenerateError> {
        let mut cursor = self.source.open(&partition.source_query).await?;
        let batch_size = self.settings.write_batch_size.max(1);
        let mut batch: Vec<Vec<u8>> = Vec::with_capacity(batch_size);
        let mut written = 0usize;

        while let Some(record) = cursor.next().await {
            batch.push(serde_json::to_vec(&record?)?);
            if batch.len() >= batch_size {
                self.log_store.append_batch(&partition.key, &batch).await?;
                written += batch.len();
                batch.clear();
            }
        }

        if !batch.is_empty() {
            self.log_store.append_batch(&partition.key, &batch).await?;
            written += batch.len();
        }
        self.log_store.commit(&partition.key).await?;
        Ok(written)
    }
}
