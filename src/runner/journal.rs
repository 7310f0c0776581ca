//! Append-only execution log (`task_execution.log`).
//!
//! Every lifecycle event of a run is appended as a single JSON line. The
//! health monitor reads the file back to find the last successful run.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::debug;

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunEvent {
    RunStarted,
    /// Another run held the lock for the whole wait.
    LockSkipped,
    AttemptFailed,
    SnapshotStored,
    RunFinished,
}

/// One line of the execution log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalEntry {
    pub timestamp: DateTime<Utc>,
    pub run_id: String,
    pub event: RunEvent,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attempt: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

impl JournalEntry {
    pub fn new(run_id: impl Into<String>, event: RunEvent) -> Self {
        Self {
            timestamp: Utc::now(),
            run_id: run_id.into(),
            event,
            outcome: None,
            attempt: None,
            detail: None,
            path: None,
        }
    }

    pub fn with_outcome(mut self, outcome: impl Into<String>) -> Self {
        self.outcome = Some(outcome.into());
        self
    }

    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = Some(attempt);
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }
}

// ---------------------------------------------------------------------------
// ExecutionLog
// ---------------------------------------------------------------------------

/// Writer for the execution log. Writes are serialized through a mutex.
pub struct ExecutionLog {
    path: PathBuf,
    writer: Mutex<tokio::fs::File>,
}

impl ExecutionLog {
    /// Open (or create) the log in append mode.
    pub async fn open(path: PathBuf) -> Result<Self> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create log directory: {}", parent.display()))?;
        }

        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .with_context(|| format!("failed to open execution log: {}", path.display()))?;

        debug!(path = %path.display(), "execution log opened");
        Ok(Self {
            path,
            writer: Mutex::new(file),
        })
    }

    pub async fn append(&self, entry: &JournalEntry) -> Result<()> {
        let mut line = serde_json::to_string(entry).context("failed to serialize journal entry")?;
        line.push('\n');

        let mut writer = self.writer.lock().await;
        writer
            .write_all(line.as_bytes())
            .await
            .with_context(|| format!("failed to write execution log: {}", self.path.display()))?;
        writer
            .flush()
            .await
            .with_context(|| format!("failed to flush execution log: {}", self.path.display()))?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Read every parseable entry of an execution log. Lines that fail to parse
/// (e.g. a torn last line) are skipped.
pub fn read_entries(path: &Path) -> std::io::Result<Vec<JournalEntry>> {
    let content = std::fs::read_to_string(path)?;
    Ok(content
        .lines()
        .filter_map(|line| serde_json::from_str(line).ok())
        .collect())
}

/// Timestamp of the newest `run_finished` event with outcome `success`.
pub fn last_success(entries: &[JournalEntry]) -> Option<DateTime<Utc>> {
    entries
        .iter()
        .filter(|e| e.event == RunEvent::RunFinished && e.outcome.as_deref() == Some("success"))
        .map(|e| e.timestamp)
        .max()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_append_and_read_back() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("logs/task_execution.log");
        let log = ExecutionLog::open(path.clone()).await.unwrap();

        log.append(&JournalEntry::new("run-1", RunEvent::RunStarted)).await.unwrap();
        log.append(
            &JournalEntry::new("run-1", RunEvent::AttemptFailed)
                .with_attempt(1)
                .with_detail("source unavailable: terminal offline"),
        )
        .await
        .unwrap();
        log.append(
            &JournalEntry::new("run-1", RunEvent::RunFinished)
                .with_outcome("success")
                .with_attempt(2),
        )
        .await
        .unwrap();

        let entries = read_entries(&path).unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[1].event, RunEvent::AttemptFailed);
        assert_eq!(entries[1].attempt, Some(1));
        assert_eq!(last_success(&entries), Some(entries[2].timestamp));
    }

    #[tokio::test]
    async fn test_reopen_appends() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("task_execution.log");

        for run in ["a", "b"] {
            let log = ExecutionLog::open(path.clone()).await.unwrap();
            log.append(&JournalEntry::new(run, RunEvent::RunStarted)).await.unwrap();
        }

        let entries = read_entries(&path).unwrap();
        let ids: Vec<&str> = entries.iter().map(|e| e.run_id.as_str()).collect();
        assert_eq!(ids, ["a", "b"]);
    }

    #[test]
    fn test_torn_line_skipped_and_failures_ignored() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("task_execution.log");
        let finished = JournalEntry::new("r1", RunEvent::RunFinished).with_outcome("failed_after_retries");
        let mut content = serde_json::to_string(&finished).unwrap();
        content.push_str("\n{\"timestamp\":\"2024-");
        std::fs::write(&path, content).unwrap();

        let entries = read_entries(&path).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(last_success(&entries), None);
    }

    #[test]
    fn test_optional_fields_omitted() {
        let json = serde_json::to_string(&JournalEntry::new("r", RunEvent::LockSkipped)).unwrap();
        assert!(json.contains("\"event\":\"lock_skipped\""));
        assert!(!json.contains("outcome"));
        assert!(!json.contains("attempt"));
        assert!(!json.contains("path"));
    }
}
