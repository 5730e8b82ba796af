use replay_cache::config::types::{BackendType, SourceConfig, SplitConfig};
use replay_cache::config::{load_config, ConfigError};
use replay_cache::pipeline::EngineSettings;
use replay_cache::splitter::{self, Splitter};
use std::fs;
use std::time::Duration;
use tempfile::TempDir;

#[test]
fn test_full_config_loads() {
    let temp_dir = TempDir::new().unwrap();
    let config_path = temp_dir.path().join("config.yml");

    let config_yaml = r#"
storage:
  backend: stream
  url: redis://127.0.0.1:6379
  key_prefix: nightly
  page_size: 500
chunk:
  max_records: 250
  max_bytes: 1048576
ttl: 6h
force_regenerate: true
persistent: true
timestamp:
  field: ts
  format: epoch_ms
generation:
  concurrency: 3
  write_batch_size: 100
  source_timeout: 2m
replay:
  concurrency: 2
  transform_timeout: 30s
source:
  type: jsonl
  root: /srv/exports
split:
  type: static
  partitions:
    - key: eu
      cacheable: true
      query: {path: eu.jsonl}
    - key: us
      kind: region
      query: us.jsonl
job:
  pipeline: SELECT region, SUM(total) AS total FROM records GROUP BY region
  merge_fields: [total]
"#;
    fs::write(&config_path, config_yaml).unwrap();

    let config = load_config(&config_path).expect("config should be valid");
    assert_eq!(config.storage.backend, BackendType::Stream);
    assert_eq!(config.storage.key_prefix, "nightly");
    assert_eq!(config.storage.page_size, 500);
    assert_eq!(config.ttl, Duration::from_secs(6 * 3600));
    assert!(config.force_regenerate);
    assert!(matches!(
        config.source,
        Some(SourceConfig::Jsonl { root: Some(_) })
    ));

    let Some(SplitConfig::Static { partitions }) = &config.split else {
        panic!("expected a static split");
    };
    assert_eq!(partitions.len(), 2);
    assert!(partitions[0].cacheable);
    assert!(!partitions[1].cacheable);

    let settings = EngineSettings::from(&config);
    assert!(settings.persistent);
    assert!(settings.generation.force_regenerate);
    assert_eq!(settings.generation.concurrency, 3);
    assert_eq!(settings.generation.source_timeout, Some(Duration::from_secs(120)));
    assert_eq!(settings.replay.limits.max_records, 250);
    assert_eq!(settings.replay.limits.max_bytes, 1048576);
    assert_eq!(settings.replay.timestamp.field(), "ts");
    assert_eq!(settings.replay.transform_timeout, Some(Duration::from_secs(30)));

    let keys: Vec<String> = splitter::from_config(config.split.as_ref().unwrap())
        .split()
        .unwrap()
        .into_iter()
        .map(|p| p.key)
        .collect();
    assert_eq!(keys, vec!["eu", "us"]);
}

#[test]
fn test_daily_split_from_config() {
    let temp_dir = TempDir::new().unwrap();
    let config_path = temp_dir.path().join("config.yml");
    let config_yaml = r#"
split:
  type: daily
  name: events
  query: "SELECT * FROM events WHERE day >= '{start}' AND day < '{end}'"
  start: 2026-03-01
  end: 2026-03-04
"#;
    fs::write(&config_path, config_yaml).unwrap();

    let config = load_config(&config_path).unwrap();
    let partitions = splitter::from_config(config.split.as_ref().unwrap())
        .split()
        .unwrap();
    assert_eq!(partitions.len(), 3);
    assert!(partitions[0].key.starts_with("events_2026-03-01_"));
    assert_eq!(
        partitions[2].source_query,
        serde_json::json!("SELECT * FROM events WHERE day >= '2026-03-03' AND day < '2026-03-04'")
    );
}

#[test]
fn test_validation_errors_are_collected() {
    let temp_dir = TempDir::new().unwrap();
    let config_path = temp_dir.path().join("config.yml");
    let config_yaml = r#"
storage:
  key_prefix: ""
generation:
  concurrency: 0
replay:
  concurrency: 0
split:
  type: static
  partitions:
    - key: "a/b"
      query: {}
"#;
    fs::write(&config_path, config_yaml).unwrap();

    match load_config(&config_path) {
        Err(ConfigError::ValidationList(errors)) => {
            assert_eq!(errors.len(), 4, "{:?}", errors);
            assert!(errors.iter().any(|e| e.contains("key_prefix")));
            assert!(errors.iter().any(|e| e.contains("invalid key 'a/b'")));
        }
        other => panic!("expected validation errors, got {:?}", other.map(|_| ())),
    }
}

#[test]
fn test_missing_file() {
    let temp_dir = TempDir::new().unwrap();
    let result = load_config(&temp_dir.path().join("absent.yml"));
    assert!(matches!(result, Err(ConfigError::Io(_))));
}

#[test]
fn test_unknown_backend_rejected() {
    let temp_dir = TempDir::new().unwrap();
    let config_path = temp_dir.path().join("config.yml");
    fs::write(&config_path, "storage:\n  backend: tape\n").unwrap();
    assert!(load_config(&config_path).is_err());
}

#[test]
fn test_key_prefix_rejects_separator() {
    let temp_dir = TempDir::new().unwrap();
    let config_path = temp_dir.path().join("config.yml");
    fs::write(&config_path, "storage:\n  key_prefix: rc_x\n").unwrap();

    match load_config(&config_path) {
        Err(ConfigError::ValidationList(errors)) => {
            assert_eq!(errors.len(), 1, "{:?}", errors);
            assert!(errors[0].contains("cannot contain '_'"));
        }
        other => panic!("expected validation errors, got {:?}", other.map(|_| ())),
    }
}
