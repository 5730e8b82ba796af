use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub chunk: ChunkConfig,
    #[serde(default = "default_ttl", with = "humantime_serde")]
    pub ttl: Duration,
    #[serde(default)]
    pub force_regenerate: bool,
    /// Keep ephemeral partition logs after a replay instead of sweeping them
    #[serde(default)]
    pub persistent: bool,
    #[serde(default)]
    pub debug: bool,
    #[serde(default)]
    pub timestamp: TimestampConfig,
    #[serde(default)]
    pub generation: GenerationConfig,
    #[serde(default)]
    pub replay: ReplayConfig,
    pub source: Option<SourceConfig>,
    pub split: Option<SplitConfig>,
    pub job: Option<JobConfig>,
}

fn default_ttl() -> Duration {
    Duration::from_secs(3600)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: BackendType,
    /// Directory for the file backend
    #[serde(default = "default_root")]
    pub root: PathBuf,
    /// Connection url for the stream backend
    pub url: Option<String>,
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
    /// Entries fetched per round trip when reading a stream
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    #[serde(default = "default_connect_timeout", with = "humantime_serde")]
    pub connect_timeout: Duration,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: BackendType::default(),
            root: default_root(),
            url: None,
            key_prefix: default_key_prefix(),
            page_size: default_page_size(),
            connect_timeout: default_connect_timeout(),
        }
    }
}

fn default_root() -> PathBuf {
    PathBuf::from("./tmp")
}

fn default_key_prefix() -> String {
    "rc".to_string()
}

fn default_page_size() -> usize {
    10000
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(5)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendType {
    #[default]
    File,
    Stream,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkConfig {
    #[serde(default = "default_max_records")]
    pub max_records: usize,
    #[serde(default = "default_max_bytes")]
    pub max_bytes: usize,
}

impl Default for ChunkConfig {
    fn default() -> Self {
        Self {
            max_records: default_max_records(),
            max_bytes: default_max_bytes(),
        }
    }
}

fn default_max_records() -> usize {
    10000
}

fn default_max_bytes() -> usize {
    16_792_600
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimestampConfig {
    #[serde(default = "default_timestamp_field")]
    pub field: String,
    /// One of: `iso8601`, `epoch`, `epoch_ms`, or a strftime pattern
    #[serde(default = "default_timestamp_format")]
    pub format: String,
}

impl Default for TimestampConfig {
    fn default() -> Self {
        Self {
            field: default_timestamp_field(),
            format: default_timestamp_format(),
        }
    }
}

fn default_timestamp_field() -> String {
    "timestamp".to_string()
}

fn default_timestamp_format() -> String {
    "iso8601".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationConfig {
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_write_batch_size")]
    pub write_batch_size: usize,
    #[serde(default, with = "humantime_serde")]
    pub source_timeout: Option<Duration>,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            write_batch_size: default_write_batch_size(),
            source_timeout: None,
        }
    }
}

fn default_concurrency() -> usize {
    1
}

fn default_write_batch_size() -> usize {
    1000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplayConfig {
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default, with = "humantime_serde")]
    pub transform_timeout: Option<Duration>,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            transform_timeout: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SourceConfig {
    /// JSON-lines files; relative query paths resolve against `root`
    Jsonl {
        #[serde(default)]
        root: Option<PathBuf>,
    },
    /// A DuckDB database file queried with SQL
    Duckdb { path: PathBuf },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SplitConfig {
    Static {
        partitions: Vec<PartitionConfig>,
    },
    Daily {
        name: String,
        query: Value,
        start: NaiveDate,
        /// Exclusive
        end: NaiveDate,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartitionConfig {
    pub key: String,
    #[serde(default)]
    pub cacheable: bool,
    #[serde(default)]
    pub kind: Option<String>,
    pub query: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobConfig {
    pub pipeline: Value,
    #[serde(default)]
    pub merge_fields: Vec<String>,
    #[serde(default)]
    pub ignore_fields: Vec<String>,
    /// Run over the merged output once replay finishes
    #[serde(default)]
    pub post_pipeline: Option<Value>,
}
