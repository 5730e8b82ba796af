use super::{query_field, DataSource, RecordCursor, SourceError};
use crate::query::duckdb::db_value_to_json;
use async_trait::async_trait;
use duckdb::types::Value as DbValue;
use duckdb::{AccessMode, Config, Connection};
use futures::stream::{self, StreamExt};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;

const ROW_BUFFER: usize = 1024;

/// Runs SQL against a DuckDB database file and streams the rows as JSON
/// objects. The query is `{sql: ...}` or a bare SQL string.
#[derive(Debug, Clone)]
pub struct DuckDbSource {
    path: PathBuf,
}

impl DuckDbSource {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

#[async_trait]
impl DataSource for DuckDbSource {
    async fn open(&self, query: &Value) -> Result<RecordCursor, SourceError> {
        let sql = query_field(query, "sql")?.to_string();
        let path = self.path.clone();
        let (tx, rx) = mpsc::channel(ROW_BUFFER);

        let handle = tokio::task::spawn_blocking(move || {
            if let Err(e) = stream_rows(&path, &sql, &tx) {
                let _ = tx.blocking_send(Err(e));
            }
        });

        let rows = stream::unfold((rx, Some(handle)), |(mut rx, handle)| async move {
            match rx.recv().await {
                Some(item) => Some((item, (rx, handle))),
                None => match handle?.await {
                    Ok(()) => None,
                    Err(e) => Some((Err(SourceError::Join(e)), (rx, None))),
                },
            }
        });
        Ok(rows.boxed())
    }
}

fn stream_rows(
    path: &Path,
    sql: &str,
    tx: &mpsc::Sender<Result<Value, SourceError>>,
) -> Result<(), SourceError> {
    let config = Config::default().access_mode(AccessMode::ReadOnly)?;
    let conn = Connection::open_with_flags(path, config)?;
    let mut stmt = conn.prepare(sql)?;
    let mut rows = stmt.query([])?;
    let names = rows
        .as_ref()
        .map(|stmt| stmt.column_names())
        .unwrap_or_default();

    let mut sent = 0usize;
    while let Some(row) = rows.next()? {
        let mut object = Map::new();
        for (i, name) in names.iter().enumerate() {
            let value: DbValue = row.get(i)?;
            object.insert(name.clone(), db_value_to_json(value));
        }
        if tx.blocking_send(Ok(Value::Object(object))).is_err() {
            tracing::debug!(sent, "Source cursor dropped before the result set ended");
            return Ok(());
        }
        sent += 1;
    }
    tracing::debug!(rows = sent, path = %path.display(), "Source query drained");
    Ok(())
}
