//! Outcome of a single run.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Terminal state of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Success,
    FailedAfterRetries,
    ConfigError,
    PersistError,
    /// Another run held the data-directory lock.
    SkippedConcurrentRun,
    /// Weekday-only schedule triggered on a weekend.
    SkippedWeekend,
}

impl RunOutcome {
    /// Process exit status reported to the invoking scheduler.
    pub fn exit_code(self) -> u8 {
        match self {
            RunOutcome::Success | RunOutcome::SkippedWeekend => 0,
            RunOutcome::ConfigError => 2,
            RunOutcome::FailedAfterRetries => 3,
            RunOutcome::PersistError => 4,
            RunOutcome::SkippedConcurrentRun => 5,
        }
    }

    /// Outcomes that warrant a failure notification.
    pub fn is_failure(self) -> bool {
        matches!(
            self,
            RunOutcome::FailedAfterRetries | RunOutcome::ConfigError | RunOutcome::PersistError
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RunOutcome::Success => "success",
            RunOutcome::FailedAfterRetries => "failed_after_retries",
            RunOutcome::ConfigError => "config_error",
            RunOutcome::PersistError => "persist_error",
            RunOutcome::SkippedConcurrentRun => "skipped_concurrent_run",
            RunOutcome::SkippedWeekend => "skipped_weekend",
        }
    }
}

impl std::fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Record of one run. Built once when the run reaches its terminal state.
#[derive(Debug, Clone, Serialize)]
pub struct RunResult {
    run_id: Uuid,
    started_at: DateTime<Utc>,
    finished_at: DateTime<Utc>,
    outcome: RunOutcome,
    attempts_made: u32,
    error_detail: Option<String>,
    stored_path: Option<PathBuf>,
}

impl RunResult {
    /// Finalize a run now.
    pub fn finish(
        run_id: Uuid,
        started_at: DateTime<Utc>,
        outcome: RunOutcome,
        attempts_made: u32,
        error_detail: Option<String>,
        stored_path: Option<PathBuf>,
    ) -> Self {
        Self {
            run_id,
            started_at,
            finished_at: Utc::now(),
            outcome,
            attempts_made,
            error_detail,
            stored_path,
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn finished_at(&self) -> DateTime<Utc> {
        self.finished_at
    }

    pub fn outcome(&self) -> RunOutcome {
        self.outcome
    }

    pub fn attempts_made(&self) -> u32 {
        self.attempts_made
    }

    pub fn error_detail(&self) -> Option<&str> {
        self.error_detail.as_deref()
    }

    pub fn stored_path(&self) -> Option<&Path> {
        self.stored_path.as_deref()
    }

    pub fn exit_code(&self) -> u8 {
        self.outcome.exit_code()
    }
}
