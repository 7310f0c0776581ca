//! Fetch adapters: the boundary to the external market-data source.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::{RunConfig, SourceConfig};

pub mod command;
pub mod http;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FetchError {
    #[error("no snapshot within {0:?}")]
    Timeout(Duration),

    #[error("source unavailable: {0}")]
    SourceUnavailable(String),

    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

/// One unit of fetched market data.
///
/// Fields are private: a snapshot is never modified after the adapter
/// builds it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    collected_at: DateTime<Utc>,
    source_id: String,
    records: Vec<serde_json::Value>,
}

impl Snapshot {
    pub fn new(
        source_id: impl Into<String>,
        collected_at: DateTime<Utc>,
        records: Vec<serde_json::Value>,
    ) -> Self {
        Self {
            collected_at,
            source_id: source_id.into(),
            records,
        }
    }

    pub fn collected_at(&self) -> DateTime<Utc> {
        self.collected_at
    }

    pub fn source_id(&self) -> &str {
        &self.source_id
    }

    pub fn records(&self) -> &[serde_json::Value] {
        &self.records
    }

    /// Reject payloads that would persist as useless files: no records, or
    /// records that are not JSON objects.
    pub fn validate(&self) -> Result<(), FetchError> {
        if self.records.is_empty() {
            return Err(FetchError::InvalidResponse(format!(
                "snapshot from '{}' contains no records",
                self.source_id
            )));
        }
        if let Some(pos) = self.records.iter().position(|r| !r.is_object()) {
            return Err(FetchError::InvalidResponse(format!(
                "record {} from '{}' is not an object",
                pos, self.source_id
            )));
        }
        Ok(())
    }
}

/// Trait for all snapshot sources.
#[async_trait::async_trait]
pub trait Fetcher: Send + Sync {
    /// Identifier used in persisted file names.
    fn source_id(&self) -> &str;

    /// Collect one snapshot. Must return `FetchError::Timeout` when nothing
    /// complete arrived within `timeout`; any session the source needs is
    /// opened and closed inside this call.
    async fn fetch(&self, timeout: Duration) -> Result<Snapshot, FetchError>;
}

/// Build the fetcher described by the configuration.
pub fn from_config(config: &RunConfig) -> Box<dyn Fetcher> {
    match config.source() {
        SourceConfig::Command {
            source_id,
            program,
            args,
            working_dir,
        } => {
            let mut fetcher = command::CommandFetcher::new(source_id, program)
                .with_args(args.iter().cloned())
                .with_capture_log(config.collection_log_path());
            if let Some(dir) = working_dir {
                fetcher = fetcher.with_working_dir(dir);
            }
            Box::new(fetcher)
        }
        SourceConfig::Http { source_id, url } => Box::new(http::HttpFetcher::new(source_id, url)),
    }
}

/// Turn a source response body into records.
///
/// Accepts a JSON array, an object carrying a `records` array, a single
/// object, or JSON lines.
pub fn parse_records(body: &str) -> Result<Vec<serde_json::Value>, FetchError> {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return Err(FetchError::InvalidResponse("empty response".to_string()));
    }

    if let Ok(value) = serde_json::from_str::<serde_json::Value>(trimmed) {
        return match value {
            serde_json::Value::Array(items) => Ok(items),
            serde_json::Value::Object(mut map) => match map.remove("records") {
                Some(serde_json::Value::Array(items)) => Ok(items),
                Some(_) => Err(FetchError::InvalidResponse(
                    "`records` is not an array".to_string(),
                )),
                None => Ok(vec![serde_json::Value::Object(map)]),
            },
            other => Err(FetchError::InvalidResponse(format!(
                "expected JSON array or object, got {}",
                json_kind(&other)
            ))),
        };
    }

    trimmed
        .lines()
        .filter(|line| !line.trim().is_empty())
        .enumerate()
        .map(|(i, line)| {
            serde_json::from_str(line).map_err(|e| {
                FetchError::InvalidResponse(format!("line {} is not valid JSON: {}", i + 1, e))
            })
        })
        .collect()
}

fn json_kind(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "bool",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_array() {
        let records = parse_records(r#"[{"ticker":"UX1"},{"ticker":"UX2"}]"#).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1]["ticker"], "UX2");
    }

    #[test]
    fn test_parse_records_envelope() {
        let records =
            parse_records(r#"{"as_of":"2024-05-01","records":[{"ticker":"VIX","px_last":13.2}]}"#)
                .unwrap();
        assert_eq!(records, vec![json!({"ticker":"VIX","px_last":13.2})]);
    }

    #[test]
    fn test_parse_json_lines() {
        let body = "{\"ticker\":\"UX1\"}\n\n{\"ticker\":\"UX2\"}\n";
        let records = parse_records(body).unwrap();
        assert_eq!(records.len(), 2);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        let err = parse_records("Connecting to terminal...\nok").unwrap_err();
        assert!(matches!(err, FetchError::InvalidResponse(_)));

        let err = parse_records("   ").unwrap_err();
        assert!(matches!(err, FetchError::InvalidResponse(_)));

        let err = parse_records("42").unwrap_err();
        assert!(err.to_string().contains("number"));
    }

    #[test]
    fn test_validate() {
        let now = Utc::now();
        assert!(Snapshot::new("vix", now, vec![json!({"a": 1})]).validate().is_ok());
        assert!(Snapshot::new("vix", now, vec![]).validate().is_err());
        assert!(Snapshot::new("vix", now, vec![json!({"a": 1}), json!(3)])
            .validate()
            .is_err());
    }
}
