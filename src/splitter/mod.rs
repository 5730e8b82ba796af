pub mod daily;

pub use daily::DailySplitter;

use crate::config::types::{PartitionConfig, SplitConfig};
use crate::hash::HashError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SplitError {
    #[error("hash error: {0}")]
    Hash(#[from] HashError),

    #[error("invalid split request: {0}")]
    Invalid(String),
}

/// A logical slice of the overall query, cached under its own key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Partition {
    pub key: String,
    /// Cacheable partitions keep their raw log across runs until the TTL
    /// expires. Others are marked for removal once generated.
    pub cacheable: bool,
    /// Free-form label, only used in progress messages
    pub kind: Option<String>,
    pub source_query: Value,
}

impl From<&PartitionConfig> for Partition {
    fn from(config: &PartitionConfig) -> Self {
        Self {
            key: config.key.clone(),
            cacheable: config.cacheable,
            kind: config.kind.clone(),
            source_query: config.query.clone(),
        }
    }
}

/// Carves a request into an ordered list of partitions.
pub trait Splitter: Send + Sync {
    fn split(&self) -> Result<Vec<Partition>, SplitError>;
}

/// Returns a fixed list of partitions.
#[derive(Debug, Clone, Default)]
pub struct StaticSplitter {
    partitions: Vec<Partition>,
}

impl StaticSplitter {
    pub fn new(partitions: Vec<Partition>) -> Self {
        Self { partitions }
    }
}

impl Splitter for StaticSplitter {
    fn split(&self) -> Result<Vec<Partition>, SplitError> {
        Ok(self.partitions.clone())
    }
}

/// Build the splitter described by the config
pub fn from_config(config: &SplitConfig) -> Arc<dyn Splitter> {
    match config {
        SplitConfig::Static { partitions } => Arc::new(StaticSplitter::new(
            partitions.iter().map(Partition::from).collect(),
        )),
        SplitConfig::Daily {
            name,
            query,
            start,
            end,
        } => Arc::new(DailySplitter::new(name, query.clone(), *start, *end)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_static_splitter_preserves_order() {
        let splitter = StaticSplitter::new(vec![
            Partition {
                key: "b".to_string(),
                cacheable: true,
                kind: None,
                source_query: json!({"path": "b.jsonl"}),
            },
            Partition {
                key: "a".to_string(),
                cacheable: false,
                kind: Some("backfill".to_string()),
                source_query: json!({"path": "a.jsonl"}),
            },
        ]);
        let keys: Vec<String> = splitter.split().unwrap().into_iter().map(|p| p.key).collect();
        assert_eq!(keys, vec!["b", "a"]);
    }

    #[test]
    fn test_from_partition_config() {
        let config = PartitionConfig {
            key: "eu".to_string(),
            cacheable: true,
            kind: Some("region".to_string()),
            query: json!({"path": "eu.jsonl"}),
        };
        let partition = Partition::from(&config);
        assert_eq!(partition.key, "eu");
        assert!(partition.cacheable);
        assert_eq!(partition.source_query, json!({"path": "eu.jsonl"}));
    }
}
