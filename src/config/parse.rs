use super::types::*;
use crate::config::expand_tilde;
use regex::Regex;
use std::collections::HashSet;
use std::path::Path;
use std::sync::OnceLock;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse YAML: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    #[error("validation failed:\n{}", .0.join("\n"))]
    ValidationList(Vec<String>),

    #[error("validation failed: {0}")]
    Validation(String),
}

fn env_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\$env\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("static pattern compiles")
    })
}

/// Replace `$env{NAME}` with the value of the environment variable `NAME`.
/// Unset variables are left in place so they can be reported.
pub fn expand_env_vars(text: &str) -> String {
    env_pattern()
        .replace_all(text, |caps: &regex::Captures| {
            std::env::var(&caps[1]).unwrap_or_else(|_| caps[0].to_string())
        })
        .into_owned()
}

pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
    let yaml = std::fs::read_to_string(path).map_err(|e| {
        ConfigError::Io(std::io::Error::new(
            e.kind(),
            format!("failed to read config file '{}': {}", path.display(), e),
        ))
    })?;

    parse_config(&yaml).map_err(|e| match e {
        ConfigError::YamlParse(e) => ConfigError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("in file '{}': {}", path.display(), e),
        )),
        other => other,
    })
}

/// Parse and validate a config from a YAML string
pub fn parse_config(yaml: &str) -> Result<Config, ConfigError> {
    let yaml = expand_env_vars(yaml);
    check_unexpanded_vars(&yaml)?;

    let mut config: Config = serde_yaml::from_str(&yaml)?;
    expand_paths(&mut config);
    validate_config(&config)?;
    Ok(config)
}

fn check_unexpanded_vars(yaml: &str) -> Result<(), ConfigError> {
    let mut missing: Vec<String> = env_pattern()
        .captures_iter(yaml)
        .map(|caps| caps[1].to_string())
        .collect();
    if missing.is_empty() {
        return Ok(());
    }
    missing.sort();
    missing.dedup();
    Err(ConfigError::Validation(format!(
        "environment variables are not set: {}",
        missing.join(", ")
    )))
}

fn expand_paths(config: &mut Config) {
    config.storage.root = expand_tilde(&config.storage.root);
    match &mut config.source {
        Some(SourceConfig::Jsonl { root: Some(root) }) => *root = expand_tilde(root),
        Some(SourceConfig::Duckdb { path }) => *path = expand_tilde(path),
        _ => {}
    }
}

fn validate_config(config: &Config) -> Result<(), ConfigError> {
    let mut errors = Vec::new();

    validate_storage(&config.storage, &mut errors);

    if config.chunk.max_records == 0 {
        errors.push("chunk.max_records must be greater than 0".to_string());
    }
    if config.chunk.max_bytes == 0 {
        errors.push("chunk.max_bytes must be greater than 0".to_string());
    }
    if config.ttl.is_zero() {
        errors.push("ttl must be greater than 0".to_string());
    }
    if config.generation.concurrency == 0 {
        errors.push("generation.concurrency must be at least 1".to_string());
    }
    if config.generation.write_batch_size == 0 {
        errors.push("generation.write_batch_size must be greater than 0".to_string());
    }
    if config.replay.concurrency == 0 {
        errors.push("replay.concurrency must be at least 1".to_string());
    }
    if config.timestamp.field.is_empty() {
        errors.push("timestamp.field cannot be empty".to_string());
    }

    if let Some(split) = &config.split {
        validate_split(split, &mut errors);
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(ConfigError::ValidationList(errors))
    }
}

fn validate_storage(storage: &StorageConfig, errors: &mut Vec<String>) {
    if storage.key_prefix.is_empty() {
        errors.push("storage.key_prefix cannot be empty".to_string());
    } else if storage.key_prefix.contains(['/', '\\']) {
        errors.push(format!(
            "storage.key_prefix '{}' cannot contain path separators",
            storage.key_prefix
        ));
    } else if storage.key_prefix.contains('_') {
        errors.push(format!(
            "storage.key_prefix '{}' cannot contain '_'",
            storage.key_prefix
        ));
    }

    if storage.backend == BackendType::Stream {
        match storage.url.as_deref() {
            None | Some("") => {
                errors.push("storage.url is required for the stream backend".to_string())
            }
            Some(_) => {}
        }
        if storage.page_size == 0 {
            errors.push("storage.page_size must be greater than 0".to_string());
        }
    }
}

fn validate_split(split: &SplitConfig, errors: &mut Vec<String>) {
    match split {
        SplitConfig::Static { partitions } => {
            if partitions.is_empty() {
                errors.push("split.partitions must contain at least one partition".to_string());
            }
            let mut keys = HashSet::new();
            for (i, partition) in partitions.iter().enumerate() {
                if crate::storage::traits::validate_key(&partition.key).is_err() {
                    errors.push(format!(
                        "split.partitions[{}]: invalid key '{}'",
                        i, partition.key
                    ));
                } else if !keys.insert(&partition.key) {
                    errors.push(format!(
                        "split.partitions[{}]: duplicate key '{}'",
                        i, partition.key
                    ));
                }
            }
        }
        SplitConfig::Daily {
            name, start, end, ..
        } => {
            if crate::storage::traits::validate_key(name).is_err() {
                errors.push(format!("split.name '{}' is not a valid key", name));
            }
            if start >= end {
                errors.push(format!(
                    "split.start ({}) must be before split.end ({})",
                    start, end
                ));
            }
        }
    }
}
