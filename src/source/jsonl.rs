use super::{query_field, DataSource, RecordCursor, SourceError};
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use serde_json::Value;
use std::path::PathBuf;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader, Lines};

/// Streams JSON-lines files. The query names the file, either as
/// `{path: ...}` or a bare string; relative paths resolve against `root`.
#[derive(Debug, Clone, Default)]
pub struct JsonLinesSource {
    root: Option<PathBuf>,
}

impl JsonLinesSource {
    pub fn new(root: Option<PathBuf>) -> Self {
        Self { root }
    }

    fn resolve(&self, path: &str) -> PathBuf {
        let path = PathBuf::from(path);
        match &self.root {
            Some(root) if path.is_relative() => root.join(path),
            _ => path,
        }
    }
}

struct LineCursor {
    path: PathBuf,
    lines: Lines<BufReader<File>>,
    line: usize,
}

impl LineCursor {
    async fn next_record(mut self) -> Result<Option<(Value, Self)>, SourceError> {
        while let Some(text) = self.lines.next_line().await? {
            self.line += 1;
            if text.trim().is_empty() {
                continue;
            }
            let value = serde_json::from_str(&text).map_err(|source| SourceError::Json {
                path: self.path.clone(),
                line: self.line,
                source,
            })?;
            return Ok(Some((value, self)));
        }
        Ok(None)
    }
}

#[async_trait]
impl DataSource for JsonLinesSource {
    async fn open(&self, query: &Value) -> Result<RecordCursor, SourceError> {
        let path = self.resolve(query_field(query, "path")?);
        let file = File::open(&path).await.map_err(|source| SourceError::Open {
            path: path.clone(),
            source,
        })?;
        tracing::debug!(path = %path.display(), "Opened JSON-lines source");

        let cursor = LineCursor {
            path,
            lines: BufReader::new(file).lines(),
            line: 0,
        };
        Ok(stream::try_unfold(cursor, LineCursor::next_record).boxed())
    }
}
