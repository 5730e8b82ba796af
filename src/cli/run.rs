use crate::config::parse::{load_config, ConfigError};
use crate::config::types::{Config, SourceConfig};
use crate::pipeline::{CachePipeline, EngineSettings, PartitionStatus, PipelineError};
use crate::query::DuckDbQueryEngine;
use crate::storage::{open_backends, StoreError};
use crate::{source, splitter};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum RunError {
    #[error("config not found; use --config <path> or run 'replay-cache config init'")]
    ConfigNotFound,

    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("storage error: {0}")]
    Storage(#[from] StoreError),

    #[error("pipeline error: {0}")]
    Pipeline(#[from] PipelineError),

    #[error("config has no '{0}' section")]
    MissingSection(&'static str),

    #[error("{0} partition(s) failed to generate")]
    Generation(usize),

    #[error("failed to write output: {0}")]
    Output(#[from] serde_json::Error),
}

pub fn load(config_path: Option<&Path>) -> Result<Config, RunError> {
    let path = config_path.ok_or(RunError::ConfigNotFound)?;
    info!(config_path = %path.display(), "Loading configuration");
    Ok(load_config(path)?)
}

/// Assemble the pipeline described by the config. Without a `source`
/// section, JSON-lines files are read from absolute paths.
pub fn build_pipeline(config: &Config, cancel: CancellationToken) -> Result<CachePipeline, RunError> {
    let backends = open_backends(&config.storage, config.ttl)?;
    let source_config = config
        .source
        .clone()
        .unwrap_or(SourceConfig::Jsonl { root: None });

    let mut pipeline = CachePipeline::new(
        backends,
        source::from_config(&source_config),
        Arc::new(DuckDbQueryEngine::new()),
        EngineSettings::from(config),
    )
    .with_cancellation(cancel);

    if let Some(split) = &config.split {
        pipeline = pipeline.with_splitter(splitter::from_config(split));
    }
    Ok(pipeline)
}

/// Cancel the token on Ctrl+C
fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown signal received");
            token.cancel();
        }
    });
    cancel
}

/// Split, generate, replay and print the combined records as JSON.
pub async fn run(config: &Config) -> Result<(), RunError> {
    let job = config.job.as_ref().ok_or(RunError::MissingSection("job"))?;
    let pipeline = build_pipeline(config, cancel_on_ctrl_c())?;

    let outcome = pipeline
        .run(
            &job.pipeline,
            &job.merge_fields,
            &job.ignore_fields,
            job.post_pipeline.as_ref(),
        )
        .await?;

    let stats = &outcome.replay.stats;
    info!(
        records = outcome.records.len(),
        chunks = stats.chunks,
        memo_hits = stats.memo_hits,
        skipped = stats.skipped(),
        "Run complete"
    );
    let failed = outcome.generation.failures().count();
    if failed > 0 {
        warn!(failed, "Output is missing data from failed partitions");
    }

    println!("{}", serde_json::to_string_pretty(&outcome.records)?);
    Ok(())
}

/// Populate the log store without replaying.
pub async fn generate(config: &Config) -> Result<(), RunError> {
    let pipeline = build_pipeline(config, cancel_on_ctrl_c())?;
    let partitions = pipeline.split()?;
    let report = pipeline.generate(&partitions).await;

    for partition in &report.partitions {
        match &partition.status {
            PartitionStatus::Preloaded => println!("{}\tpreloaded", partition.key),
            PartitionStatus::Generated { records } => {
                println!("{}\tgenerated\t{}", partition.key, records)
            }
            PartitionStatus::Failed(e) => println!("{}\tfailed\t{}", partition.key, e),
        }
    }

    match report.failures().count() {
        0 => Ok(()),
        failed => Err(RunError::Generation(failed)),
    }
}

pub async fn sweep(config: &Config) -> Result<(), RunError> {
    let pipeline = build_pipeline(config, CancellationToken::new())?;
    let report = pipeline.sweep().await?;
    println!(
        "Cleared {} partition log(s) and {} chunk result(s)",
        report.partitions, report.chunks
    );
    Ok(())
}

/// Locations checked when no --config is given
pub fn searched_locations() -> Vec<PathBuf> {
    let mut paths = Vec::new();
    if let Some(path) = crate::config::default_user_config_path() {
        paths.push(path);
    }
    paths.push(PathBuf::from("/etc/replay-cache/config.yml"));
    paths
}
