use super::{ChunkBatch, QueryEngine, QueryError};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate};
use duckdb::types::{TimeUnit, Value as DbValue};
use duckdb::{params_from_iter, Connection, Statement};
use serde_json::{Map, Number, Value};

const TABLE: &str = "records";
const STAGE_TABLE: &str = "__replay_stage";

/// Query engine that loads each batch into an in-memory DuckDB table named
/// `records` and runs SQL over it.
///
/// The pipeline is either one SQL string or a list of SQL strings. With a
/// list, every stage but the last replaces `records` with its output.
#[derive(Debug, Default, Clone)]
pub struct DuckDbQueryEngine;

impl DuckDbQueryEngine {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl QueryEngine for DuckDbQueryEngine {
    async fn apply(&self, batch: ChunkBatch, pipeline: &Value) -> Result<Value, QueryError> {
        let stages = pipeline_stages(pipeline)?;
        tokio::task::spawn_blocking(move || run_stages(&batch, &stages)).await?
    }
}

fn pipeline_stages(pipeline: &Value) -> Result<Vec<String>, QueryError> {
    let stages = match pipeline {
        Value::String(sql) => vec![sql.clone()],
        Value::Array(items) => items
            .iter()
            .map(|item| {
                item.as_str().map(str::to_string).ok_or_else(|| {
                    QueryError::InvalidPipeline("pipeline stages must be SQL strings".to_string())
                })
            })
            .collect::<Result<Vec<_>, _>>()?,
        _ => {
            return Err(QueryError::InvalidPipeline(
                "expected a SQL string or a list of SQL strings".to_string(),
            ))
        }
    };
    if stages.is_empty() {
        return Err(QueryError::InvalidPipeline("pipeline has no stages".to_string()));
    }
    Ok(stages)
}

fn run_stages(batch: &ChunkBatch, stages: &[String]) -> Result<Value, QueryError> {
    if batch.is_empty() {
        return Ok(Value::Array(Vec::new()));
    }

    let conn = Connection::open_in_memory()?;
    load_batch(&conn, batch)?;

    let (last, intermediate) = stages
        .split_last()
        .ok_or_else(|| QueryError::InvalidPipeline("pipeline has no stages".to_string()))?;
    for sql in intermediate {
        conn.execute_batch(&format!(
            "CREATE TABLE {stage} AS {sql}; DROP TABLE {table}; ALTER TABLE {stage} RENAME TO {table};",
            stage = STAGE_TABLE,
            table = TABLE,
            sql = sql.trim().trim_end_matches(';'),
        ))?;
    }

    let mut stmt = conn.prepare(last)?;
    Ok(Value::Array(query_objects(&mut stmt)?))
}

/// Run a prepared statement and collect its rows as JSON objects
fn query_objects(stmt: &mut Statement<'_>) -> Result<Vec<Value>, duckdb::Error> {
    let mut rows = stmt.query([])?;
    let names = rows
        .as_ref()
        .map(|stmt| stmt.column_names())
        .unwrap_or_default();

    let mut objects = Vec::new();
    while let Some(row) = rows.next()? {
        let mut object = Map::new();
        for (i, name) in names.iter().enumerate() {
            let value: DbValue = row.get(i)?;
            object.insert(name.clone(), db_value_to_json(value));
        }
        objects.push(Value::Object(object));
    }
    Ok(objects)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ColumnType {
    Boolean,
    BigInt,
    Double,
    Varchar,
    Timestamp,
}

impl ColumnType {
    fn sql(self) -> &'static str {
        match self {
            ColumnType::Boolean => "BOOLEAN",
            ColumnType::BigInt => "BIGINT",
            ColumnType::Double => "DOUBLE",
            ColumnType::Varchar => "VARCHAR",
            ColumnType::Timestamp => "TIMESTAMP",
        }
    }

    fn of(value: &Value) -> Option<Self> {
        match value {
            Value::Null => None,
            Value::Bool(_) => Some(ColumnType::Boolean),
            Value::Number(n) if n.is_i64() => Some(ColumnType::BigInt),
            Value::Number(_) => Some(ColumnType::Double),
            _ => Some(ColumnType::Varchar),
        }
    }

    fn widen(self, other: Self) -> Self {
        match (self, other) {
            (a, b) if a == b => a,
            (ColumnType::BigInt, ColumnType::Double) | (ColumnType::Double, ColumnType::BigInt) => {
                ColumnType::Double
            }
            _ => ColumnType::Varchar,
        }
    }
}

/// Columns in first-seen order with their inferred types.
///
/// The timestamp field is typed `TIMESTAMP` only when every non-null value
/// in the batch parsed; otherwise it keeps the type of its raw values.
fn infer_columns(batch: &ChunkBatch) -> Vec<(String, ColumnType)> {
    let mut columns: Vec<(String, Option<ColumnType>)> = Vec::new();
    let mut has_timestamp = false;
    let mut has_unparsed = false;

    for record in &batch.records {
        match record.timestamp {
            Some(_) => has_timestamp = true,
            None => {
                has_unparsed |= record
                    .fields
                    .get(&batch.timestamp_field)
                    .is_some_and(|value| !value.is_null())
            }
        }
        for (name, value) in &record.fields {
            let observed = ColumnType::of(value);
            match columns.iter_mut().find(|(existing, _)| existing == name) {
                Some((_, ty)) => {
                    *ty = match (*ty, observed) {
                        (Some(a), Some(b)) => Some(a.widen(b)),
                        (a, b) => a.or(b),
                    }
                }
                None => columns.push((name.clone(), observed)),
            }
        }
    }

    if has_timestamp && !has_unparsed {
        match columns
            .iter_mut()
            .find(|(name, _)| *name == batch.timestamp_field)
        {
            Some((_, ty)) => *ty = Some(ColumnType::Timestamp),
            None => columns.push((batch.timestamp_field.clone(), Some(ColumnType::Timestamp))),
        }
    }

    columns
        .into_iter()
        .map(|(name, ty)| (name, ty.unwrap_or(ColumnType::Varchar)))
        .collect()
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn load_batch(conn: &Connection, batch: &ChunkBatch) -> Result<(), QueryError> {
    let columns = infer_columns(batch);
    if columns.is_empty() {
        return Err(QueryError::Engine("batch has no columns".to_string()));
    }

    let definitions: Vec<String> = columns
        .iter()
        .map(|(name, ty)| format!("{} {}", quote_ident(name), ty.sql()))
        .collect();
    conn.execute_batch(&format!("CREATE TABLE {} ({});", TABLE, definitions.join(", ")))?;

    let placeholders = vec!["?"; columns.len()].join(", ");
    let mut insert = conn.prepare(&format!("INSERT INTO {} VALUES ({})", TABLE, placeholders))?;

    for record in &batch.records {
        let row: Vec<DbValue> = columns
            .iter()
            .map(|(name, ty)| {
                if *ty == ColumnType::Timestamp && *name == batch.timestamp_field {
                    return record
                        .timestamp
                        .map(|ts| DbValue::Timestamp(TimeUnit::Microsecond, ts.timestamp_micros()))
                        .unwrap_or(DbValue::Null);
                }
                record
                    .fields
                    .get(name)
                    .map(|value| json_to_db_value(value, *ty))
                    .unwrap_or(DbValue::Null)
            })
            .collect();
        insert.execute(params_from_iter(row.iter()))?;
    }
    Ok(())
}

fn json_to_db_value(value: &Value, ty: ColumnType) -> DbValue {
    match (ty, value) {
        (_, Value::Null) => DbValue::Null,
        (ColumnType::Boolean, Value::Bool(b)) => DbValue::Boolean(*b),
        (ColumnType::BigInt, Value::Number(n)) => n.as_i64().map(DbValue::BigInt).unwrap_or(DbValue::Null),
        (ColumnType::Double, Value::Number(n)) => n.as_f64().map(DbValue::Double).unwrap_or(DbValue::Null),
        (_, Value::String(s)) => DbValue::Text(s.clone()),
        (_, other) => DbValue::Text(other.to_string()),
    }
}

fn micros(unit: TimeUnit, value: i64) -> i64 {
    match unit {
        TimeUnit::Second => value.saturating_mul(1_000_000),
        TimeUnit::Millisecond => value.saturating_mul(1_000),
        TimeUnit::Microsecond => value,
        TimeUnit::Nanosecond => value / 1_000,
    }
}

fn float(value: f64) -> Value {
    Number::from_f64(value).map(Value::Number).unwrap_or(Value::Null)
}

/// Convert a DuckDB value into its JSON counterpart. Timestamps become
/// RFC 3339 strings, dates `YYYY-MM-DD`, lists arrays.
pub(crate) fn db_value_to_json(value: DbValue) -> Value {
    match value {
        DbValue::Null => Value::Null,
        DbValue::Boolean(b) => Value::Bool(b),
        DbValue::TinyInt(n) => Value::from(n),
        DbValue::SmallInt(n) => Value::from(n),
        DbValue::Int(n) => Value::from(n),
        DbValue::BigInt(n) => Value::from(n),
        DbValue::HugeInt(n) => match i64::try_from(n) {
            Ok(n) => Value::from(n),
            Err(_) => float(n as f64),
        },
        DbValue::UTinyInt(n) => Value::from(n),
        DbValue::USmallInt(n) => Value::from(n),
        DbValue::UInt(n) => Value::from(n),
        DbValue::UBigInt(n) => Value::from(n),
        DbValue::Float(f) => float(f as f64),
        DbValue::Double(f) => float(f),
        DbValue::Decimal(d) => d
            .to_string()
            .parse::<f64>()
            .map(float)
            .unwrap_or_else(|_| Value::String(d.to_string())),
        DbValue::Timestamp(unit, value) => DateTime::from_timestamp_micros(micros(unit, value))
            .map(|dt| Value::String(dt.to_rfc3339()))
            .unwrap_or(Value::Null),
        DbValue::Date32(days) => NaiveDate::from_ymd_opt(1970, 1, 1)
            .and_then(|epoch| epoch.checked_add_signed(chrono::Duration::days(days as i64)))
            .map(|date| Value::String(date.format("%Y-%m-%d").to_string()))
            .unwrap_or(Value::Null),
        DbValue::Text(s) => Value::String(s),
        DbValue::Enum(s) => Value::String(s),
        DbValue::Blob(bytes) => Value::String(String::from_utf8_lossy(&bytes).into_owned()),
        DbValue::List(items) => Value::Array(items.into_iter().map(db_value_to_json).collect()),
        other => Value::String(format!("{:?}", other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::{ParsedRecord, TimestampNormalizer};
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    fn batch(records: Vec<Value>) -> ChunkBatch {
        let normalizer = TimestampNormalizer::new("timestamp", "iso8601");
        let payloads: Vec<Vec<u8>> = records
            .iter()
            .map(|r| serde_json::to_vec(r).unwrap())
            .collect();
        ChunkBatch::from_payloads(payloads.iter().map(|p| p.as_slice()), &normalizer)
    }

    #[tokio::test]
    async fn test_group_by_sum() {
        let engine = DuckDbQueryEngine::new();
        let input = batch(vec![
            json!({"a": 1, "b": 5}),
            json!({"a": 1, "b": 7}),
            json!({"a": 2, "b": 1}),
        ]);
        let result = engine
            .apply(input, &json!("SELECT a, SUM(b) AS b FROM records GROUP BY a ORDER BY a"))
            .await
            .unwrap();
        assert_eq!(result, json!([{"a": 1, "b": 12}, {"a": 2, "b": 1}]));
    }

    #[tokio::test]
    async fn test_multi_stage_pipeline() {
        let engine = DuckDbQueryEngine::new();
        let input = batch(vec![
            json!({"name": "x", "n": 1}),
            json!({"name": "y", "n": 2}),
            json!({"name": "x", "n": 3}),
        ]);
        let pipeline = json!([
            "SELECT name, n * 10 AS n FROM records WHERE n > 1",
            "SELECT name, n FROM records ORDER BY n"
        ]);
        let result = engine.apply(input, &pipeline).await.unwrap();
        assert_eq!(result, json!([{"name": "y", "n": 20}, {"name": "x", "n": 30}]));
    }

    #[tokio::test]
    async fn test_timestamp_column_is_typed() {
        let engine = DuckDbQueryEngine::new();
        let input = batch(vec![
            json!({"id": 1, "timestamp": "2026-01-28T10:00:00Z"}),
            json!({"id": 2, "timestamp": "2026-01-29T10:00:00Z"}),
        ]);
        let result = engine
            .apply(
                input,
                &json!(
                    "SELECT id, \"timestamp\" FROM records WHERE \"timestamp\" >= TIMESTAMP '2026-01-29 00:00:00'"
                ),
            )
            .await
            .unwrap();
        assert_eq!(
            result,
            json!([{"id": 2, "timestamp": "2026-01-29T10:00:00+00:00"}])
        );
    }

    #[tokio::test]
    async fn test_unparsed_timestamp_kept_as_text() {
        let engine = DuckDbQueryEngine::new();
        let input = batch(vec![
            json!({"id": 1, "timestamp": "2026-01-28T10:00:00Z"}),
            json!({"id": 2, "timestamp": "soon"}),
        ]);
        let result = engine
            .apply(input, &json!("SELECT id, \"timestamp\" FROM records ORDER BY id"))
            .await
            .unwrap();
        assert_eq!(
            result,
            json!([
                {"id": 1, "timestamp": "2026-01-28T10:00:00Z"},
                {"id": 2, "timestamp": "soon"}
            ])
        );
    }

    #[tokio::test]
    async fn test_select_keeps_column_order() {
        let engine = DuckDbQueryEngine::new();
        let input = batch(vec![json!({"a": 2, "z": 1})]);
        let result = engine
            .apply(input, &json!("SELECT z, a FROM records"))
            .await
            .unwrap();
        let keys: Vec<&String> = result[0].as_object().unwrap().keys().collect();
        assert_eq!(keys, vec!["z", "a"]);
    }

    #[tokio::test]
    async fn test_list_aggregate_returns_array() {
        let engine = DuckDbQueryEngine::new();
        let input = batch(vec![json!({"k": "x", "tag": "p"}), json!({"k": "x", "tag": "q"})]);
        let result = engine
            .apply(
                input,
                &json!("SELECT k, list(tag ORDER BY tag) AS tags FROM records GROUP BY k"),
            )
            .await
            .unwrap();
        assert_eq!(result, json!([{"k": "x", "tags": ["p", "q"]}]));
    }

    #[tokio::test]
    async fn test_empty_batch_returns_empty_list() {
        let engine = DuckDbQueryEngine::new();
        let input = ChunkBatch {
            timestamp_field: "timestamp".to_string(),
            records: Vec::new(),
        };
        let result = engine.apply(input, &json!("SELECT * FROM records")).await.unwrap();
        assert_eq!(result, json!([]));
    }

    #[tokio::test]
    async fn test_invalid_pipeline() {
        let engine = DuckDbQueryEngine::new();
        let input = batch(vec![json!({"a": 1})]);
        let result = engine.apply(input, &json!({"$match": {}})).await;
        assert!(matches!(result, Err(QueryError::InvalidPipeline(_))));
    }

    #[tokio::test]
    async fn test_sql_error_surfaces() {
        let engine = DuckDbQueryEngine::new();
        let input = batch(vec![json!({"a": 1})]);
        let result = engine.apply(input, &json!("SELECT missing FROM records")).await;
        assert!(matches!(result, Err(QueryError::Database(_))));
    }

    #[test]
    fn test_infer_columns_widens() {
        let input = ChunkBatch {
            timestamp_field: "timestamp".to_string(),
            records: vec![
                ParsedRecord {
                    fields: json!({"n": 1, "s": "a", "z": null}).as_object().unwrap().clone(),
                    timestamp: Some(Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()),
                },
                ParsedRecord {
                    fields: json!({"n": 1.5, "s": 3}).as_object().unwrap().clone(),
                    timestamp: None,
                },
            ],
        };
        let columns = infer_columns(&input);
        assert!(columns.contains(&("n".to_string(), ColumnType::Double)));
        assert!(columns.contains(&("s".to_string(), ColumnType::Varchar)));
        assert!(columns.contains(&("z".to_string(), ColumnType::Varchar)));
        assert!(columns.contains(&("timestamp".to_string(), ColumnType::Timestamp)));
    }

    #[test]
    fn test_infer_columns_mixed_timestamp_falls_back() {
        let input = batch(vec![
            json!({"timestamp": "2026-01-28T10:00:00Z"}),
            json!({"timestamp": "soon"}),
        ]);
        assert_eq!(
            infer_columns(&input),
            vec![("timestamp".to_string(), ColumnType::Varchar)]
        );
    }
}
