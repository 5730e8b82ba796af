pub mod duckdb;
pub mod timestamp;

pub use self::duckdb::DuckDbQueryEngine;
pub use timestamp::{TimestampFormat, TimestampNormalizer};

use crate::Record;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

#[derive(Debug, thiserror::Error)]
pub enum QueryError {
    #[error("database error: {0}")]
    Database(#[from] ::duckdb::Error),

    #[error("invalid pipeline: {0}")]
    InvalidPipeline(String),

    #[error("task join error: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("{0}")]
    Engine(String),
}

/// A structured record ready for the transform step.
///
/// `fields` keeps every value as it was logged. When the designated
/// timestamp field parsed, the typed value is carried alongside.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedRecord {
    pub fields: Record,
    pub timestamp: Option<DateTime<Utc>>,
}

/// Records handed to one [`QueryEngine::apply`] call
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkBatch {
    pub timestamp_field: String,
    pub records: Vec<ParsedRecord>,
}

impl ChunkBatch {
    /// Parse raw log payloads, dropping empty and malformed records.
    pub fn from_payloads<'a, I>(payloads: I, normalizer: &TimestampNormalizer) -> Self
    where
        I: IntoIterator<Item = &'a [u8]>,
    {
        let mut dropped = 0usize;
        let records = payloads
            .into_iter()
            .filter_map(|payload| match serde_json::from_slice::<Value>(payload) {
                Ok(Value::Object(fields)) if !fields.is_empty() => Some(fields),
                _ => {
                    dropped += 1;
                    None
                }
            })
            .map(|fields| normalize_record(fields, normalizer))
            .collect();
        if dropped > 0 {
            tracing::debug!(dropped, "Dropped empty or malformed records");
        }
        Self {
            timestamp_field: normalizer.field().to_string(),
            records,
        }
    }

    /// Wrap already structured records, such as merged replay output.
    pub fn from_records(records: Vec<Record>, normalizer: &TimestampNormalizer) -> Self {
        Self {
            timestamp_field: normalizer.field().to_string(),
            records: records
                .into_iter()
                .map(|fields| normalize_record(fields, normalizer))
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

fn normalize_record(fields: Record, normalizer: &TimestampNormalizer) -> ParsedRecord {
    let timestamp = fields
        .get(normalizer.field())
        .and_then(|value| normalizer.normalize(value));
    ParsedRecord { fields, timestamp }
}

/// Transform engine that turns a batch of records plus a declarative
/// pipeline into a result set.
///
/// A well-behaved engine returns a JSON array of objects. Anything else is
/// passed back to the caller untouched so it can decide how to react.
#[async_trait]
pub trait QueryEngine: Send + Sync {
    async fn apply(&self, batch: ChunkBatch, pipeline: &Value) -> Result<Value, QueryError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_from_payloads_drops_empty_and_malformed() {
        let normalizer = TimestampNormalizer::new("timestamp", "iso8601");
        let payloads: Vec<&[u8]> = vec![
            b"{\"a\":1}",
            b"{}",
            b"not json",
            b"[1,2]",
            b"null",
            b"{\"a\":2,\"timestamp\":\"2026-01-28T10:00:00Z\"}",
        ];
        let batch = ChunkBatch::from_payloads(payloads, &normalizer);
        assert_eq!(batch.len(), 2);
        assert_eq!(batch.timestamp_field, "timestamp");
        assert!(batch.records[0].timestamp.is_none());
        assert_eq!(
            batch.records[1].timestamp,
            Some(Utc.with_ymd_and_hms(2026, 1, 28, 10, 0, 0).unwrap())
        );
        assert_eq!(batch.records[1].fields["timestamp"], "2026-01-28T10:00:00Z");
    }

    #[test]
    fn test_unparseable_timestamp_left_in_place() {
        let normalizer = TimestampNormalizer::new("timestamp", "iso8601");
        let batch = ChunkBatch::from_payloads(
            vec![&b"{\"timestamp\":\"soon\"}"[..]],
            &normalizer,
        );
        assert!(batch.records[0].timestamp.is_none());
        assert_eq!(batch.records[0].fields["timestamp"], "soon");
    }
}
