pub mod duckdb;
pub mod jsonl;

pub use self::duckdb::DuckDbSource;
pub use jsonl::JsonLinesSource;

use crate::config::types::SourceConfig;
use async_trait::async_trait;
use futures::stream::BoxStream;
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to open '{path}': {source}")]
    Open {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("malformed record at {path}:{line}: {source}")]
    Json {
        path: PathBuf,
        line: usize,
        source: serde_json::Error,
    },

    #[error("database error: {0}")]
    Database(#[from] ::duckdb::Error),

    #[error("invalid source query: {0}")]
    InvalidQuery(String),

    #[error("task join error: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Records produced by one source query, ending on exhaustion or the first error
pub type RecordCursor = BoxStream<'static, Result<Value, SourceError>>;

/// Random-access data source that can stream the result of a partition query.
#[async_trait]
pub trait DataSource: Send + Sync {
    async fn open(&self, query: &Value) -> Result<RecordCursor, SourceError>;
}

/// Build the data source described by the config
pub fn from_config(config: &SourceConfig) -> Arc<dyn DataSource> {
    match config {
        SourceConfig::Jsonl { root } => Arc::new(JsonLinesSource::new(root.clone())),
        SourceConfig::Duckdb { path } => Arc::new(DuckDbSource::new(path.clone())),
    }
}

/// Pull a string field out of a query descriptor, accepting a bare string too.
pub(crate) fn query_field<'a>(query: &'a Value, field: &str) -> Result<&'a str, SourceError> {
    match query {
        Value::String(s) => Ok(s),
        Value::Object(map) => map.get(field).and_then(Value::as_str).ok_or_else(|| {
            SourceError::InvalidQuery(format!("expected a string '{}' field", field))
        }),
        other => Err(SourceError::InvalidQuery(format!(
            "expected a string or an object, got {}",
            other
        ))),
    }
}
