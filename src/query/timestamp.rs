use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimestampFormat {
    /// RFC 3339 strings; numbers are read as epoch milliseconds
    Iso8601,
    Epoch,
    EpochMs,
    Strftime(String),
}

impl TimestampFormat {
    pub fn parse(format: &str) -> Self {
        match format {
            "iso8601" => TimestampFormat::Iso8601,
            "epoch" => TimestampFormat::Epoch,
            "epoch_ms" => TimestampFormat::EpochMs,
            other => TimestampFormat::Strftime(other.to_string()),
        }
    }
}

/// Turns the designated timestamp field of a record into a UTC datetime.
#[derive(Debug, Clone)]
pub struct TimestampNormalizer {
    field: String,
    format: TimestampFormat,
}

impl TimestampNormalizer {
    pub fn new(field: &str, format: &str) -> Self {
        Self {
            field: field.to_string(),
            format: TimestampFormat::parse(format),
        }
    }

    pub fn field(&self) -> &str {
        &self.field
    }

    /// Returns None when the value cannot be read in the configured format.
    pub fn normalize(&self, value: &Value) -> Option<DateTime<Utc>> {
        match (&self.format, value) {
            (TimestampFormat::Iso8601, Value::String(s)) => parse_iso8601(s),
            (TimestampFormat::Iso8601, Value::Number(n)) => {
                n.as_i64().and_then(|ms| Utc.timestamp_millis_opt(ms).single())
            }
            (TimestampFormat::Epoch, value) => {
                let seconds = number_or_string(value)?;
                Utc.timestamp_opt(seconds, 0).single()
            }
            (TimestampFormat::EpochMs, value) => {
                let millis = number_or_string(value)?;
                Utc.timestamp_millis_opt(millis).single()
            }
            (TimestampFormat::Strftime(fmt), Value::String(s)) => parse_strftime(s, fmt),
            _ => None,
        }
    }
}

fn number_or_string(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn parse_iso8601(value: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt.with_timezone(&Utc));
    }
    // Naive forms are taken as UTC
    if let Ok(naive) = NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f") {
        return Some(Utc.from_utc_datetime(&naive));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S%.f") {
        return Some(Utc.from_utc_datetime(&naive));
    }
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| Utc.from_utc_datetime(&naive))
}

fn parse_strftime(value: &str, fmt: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_str(value, fmt) {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(value, fmt)
        .ok()
        .map(|naive| Utc.from_utc_datetime(&naive))
}
