use super::{Partition, SplitError, Splitter};
use crate::hash::hash_value;
use chrono::{DateTime, Days, NaiveDate, Utc};
use serde_json::Value;

/// Splits the half-open date range `[start, end)` into one partition per day.
///
/// Keys look like `{name}_{YYYY-MM-DD}_{hash}` where the hash covers the
/// query template, so editing the query never reuses stale raw logs. Every
/// string in the template has `{start}` and `{end}` replaced with the day's
/// bounds. Days that have not finished yet are not cacheable.
#[derive(Debug, Clone)]
pub struct DailySplitter {
    name: String,
    query_template: Value,
    start: NaiveDate,
    end: NaiveDate,
    now: Option<DateTime<Utc>>,
}

impl DailySplitter {
    pub fn new(name: &str, query_template: Value, start: NaiveDate, end: NaiveDate) -> Self {
        Self {
            name: name.to_string(),
            query_template,
            start,
            end,
            now: None,
        }
    }

    /// Judge cacheability against a fixed instant instead of the clock
    pub fn at(mut self, now: DateTime<Utc>) -> Self {
        self.now = Some(now);
        self
    }
}

impl Splitter for DailySplitter {
    fn split(&self) -> Result<Vec<Partition>, SplitError> {
        if self.start >= self.end {
            return Err(SplitError::Invalid(format!(
                "start {} is not before end {}",
                self.start, self.end
            )));
        }

        let template_hash = hash_value(&self.query_template)?;
        let now = self.now.unwrap_or_else(Utc::now);

        let mut partitions = Vec::new();
        let mut day = self.start;
        while day < self.end {
            let next = day
                .checked_add_days(Days::new(1))
                .ok_or_else(|| SplitError::Invalid(format!("date overflow after {}", day)))?;
            let bounds = (day.format("%Y-%m-%d").to_string(), next.format("%Y-%m-%d").to_string());
            let day_end = next.and_hms_opt(0, 0, 0).map(|dt| dt.and_utc());

            partitions.push(Partition {
                key: format!("{}_{}_{}", self.name, bounds.0, template_hash),
                cacheable: day_end.is_some_and(|end| end <= now),
                kind: Some("daily".to_string()),
                source_query: substitute(&self.query_template, &bounds.0, &bounds.1),
            });
            day = next;
        }
        Ok(partitions)
    }
}

fn substitute(template: &Value, start: &str, end: &str) -> Value {
    match template {
        Value::String(s) => Value::String(s.replace("{start}", start).replace("{end}", end)),
        Value::Array(items) => Value::Array(items.iter().map(|v| substitute(v, start, end)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), substitute(v, start, end)))
                .collect(),
        ),
        other => other.clone(),
    }
}
