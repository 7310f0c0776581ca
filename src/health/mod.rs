//! Read-only health report derived from the data and log directories.
//!
//! Nothing here writes, locks or creates anything. Each sub-check that
//! fails turns into a warning on the report instead of an error.

use std::collections::BTreeSet;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Local, NaiveTime, Timelike, Utc};
use cron::Schedule as CronSchedule;
use serde::Serialize;
use tracing::debug;

use crate::config::EXECUTION_LOG_FILE;
use crate::runner::journal;
use crate::storage::list_snapshot_files;
use crate::system::disk;

/// Number of data files listed in a report.
pub const RECENT_FILE_LIMIT: usize = 5;

#[derive(Debug, Clone, Serialize)]
pub struct DataFile {
    pub name: String,
    pub modified: DateTime<Utc>,
    pub age: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct LogFile {
    pub name: String,
    pub size_bytes: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub checked_at: DateTime<Utc>,
    pub last_successful_run: Option<DateTime<Utc>>,
    /// Newest first.
    pub recent_files: Vec<DataFile>,
    pub data_file_count: usize,
    pub data_dir_bytes: u64,
    pub log_files: Vec<LogFile>,
    pub free_space_bytes: u64,
    pub next_collection: Option<DateTime<Utc>>,
    pub warnings: BTreeSet<String>,
}

impl HealthReport {
    pub fn is_healthy(&self) -> bool {
        self.warnings.is_empty()
    }
}

/// Build a report as of now.
pub fn check(data_dir: &Path, log_dir: &Path, min_free_bytes: u64) -> HealthReport {
    check_at(data_dir, log_dir, min_free_bytes, Utc::now())
}

pub fn check_at(
    data_dir: &Path,
    log_dir: &Path,
    min_free_bytes: u64,
    now: DateTime<Utc>,
) -> HealthReport {
    let mut warnings = BTreeSet::new();

    // 1. Data files
    let mut data_files = Vec::new();
    let mut data_dir_bytes = 0u64;
    match list_snapshot_files(data_dir) {
        Ok(paths) => {
            for path in paths {
                match stat(&path) {
                    Ok((modified, len)) => {
                        data_dir_bytes = data_dir_bytes.saturating_add(len);
                        data_files.push((path, modified));
                    }
                    Err(e) => {
                        warnings.insert(format!("cannot stat {}: {}", path.display(), e));
                    }
                }
            }
            if data_files.is_empty() {
                warnings.insert(format!("no data files in {}", data_dir.display()));
            }
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            warnings.insert(format!("data directory {} does not exist", data_dir.display()));
        }
        Err(e) => {
            warnings.insert(format!("cannot read data directory {}: {}", data_dir.display(), e));
        }
    }
    data_files.sort_by(|a, b| b.1.cmp(&a.1));
    let data_file_count = data_files.len();
    let newest_file = data_files.first().map(|(_, modified)| *modified);

    let recent_files = data_files
        .into_iter()
        .take(RECENT_FILE_LIMIT)
        .map(|(path, modified)| DataFile {
            name: file_name(&path),
            modified,
            age: humanize_age(now - modified),
        })
        .collect();

    // 2. Log files
    let log_files = match list_log_files(log_dir) {
        Ok(files) => files,
        Err(e) => {
            warnings.insert(format!("cannot read log directory {}: {}", log_dir.display(), e));
            Vec::new()
        }
    };

    // 3. Free space
    let free_space_bytes = match disk::available_space(data_dir) {
        Ok(bytes) => {
            if bytes < min_free_bytes {
                warnings.insert(format!(
                    "low disk space: {} MiB free, floor is {} MiB",
                    bytes / MIB,
                    min_free_bytes / MIB
                ));
            }
            bytes
        }
        Err(e) => {
            warnings.insert(format!("cannot determine free space: {}", e));
            0
        }
    };

    // 4. Last success: the execution log knows best, file mtimes are a
    // fallback for data written by older tooling.
    let logged_success = journal::read_entries(&log_dir.join(EXECUTION_LOG_FILE))
        .ok()
        .and_then(|entries| journal::last_success(&entries));
    let last_successful_run = logged_success.or(newest_file);

    debug!(
        data_dir = %data_dir.display(),
        warnings = warnings.len(),
        "health check complete"
    );

    HealthReport {
        checked_at: now,
        last_successful_run,
        recent_files,
        data_file_count,
        data_dir_bytes,
        log_files,
        free_space_bytes,
        next_collection: None,
        warnings,
    }
}

const MIB: u64 = 1024 * 1024;

/// Modification time and size.
fn stat(path: &Path) -> std::io::Result<(DateTime<Utc>, u64)> {
    let metadata = std::fs::metadata(path)?;
    Ok((DateTime::<Utc>::from(metadata.modified()?), metadata.len()))
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

fn list_log_files(log_dir: &Path) -> std::io::Result<Vec<LogFile>> {
    let mut files = Vec::new();
    for entry in std::fs::read_dir(log_dir)? {
        let entry = entry?;
        let metadata = entry.metadata()?;
        if !metadata.is_file() {
            continue;
        }
        files.push(LogFile {
            name: entry.file_name().to_string_lossy().into_owned(),
            size_bytes: metadata.len(),
        });
    }
    files.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(files)
}

/// "just now", "12m ago", "3h 5m ago", "2d 4h ago".
pub fn humanize_age(age: chrono::Duration) -> String {
    let secs = age.num_seconds();
    if secs < 60 {
        return "just now".to_string();
    }
    let minutes = secs / 60;
    let hours = minutes / 60;
    let days = hours / 24;
    if hours == 0 {
        format!("{}m ago", minutes)
    } else if days == 0 {
        format!("{}h {}m ago", hours, minutes % 60)
    } else {
        format!("{}d {}h ago", days, hours % 24)
    }
}

// ---------------------------------------------------------------------------
// Schedule
// ---------------------------------------------------------------------------

/// Expected collection times, in host local time.
#[derive(Debug, Clone)]
pub struct CollectionSchedule {
    expression: String,
    schedule: CronSchedule,
}

impl CollectionSchedule {
    pub fn new(time: NaiveTime, weekdays_only: bool) -> Result<Self> {
        let days = if weekdays_only { "Mon-Fri" } else { "*" };
        let expression = format!("0 {} {} * * {}", time.minute(), time.hour(), days);
        let schedule = CronSchedule::from_str(&expression)
            .map_err(|e| anyhow::anyhow!("Invalid cron expression '{}': {}", expression, e))?;
        Ok(Self {
            expression,
            schedule,
        })
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    pub fn next_after(&self, now: DateTime<Local>) -> Option<DateTime<Local>> {
        self.schedule.after(&now).next()
    }

    /// Latest expected collection at or before `now`.
    pub fn previous_before(&self, now: DateTime<Local>) -> Option<DateTime<Local>> {
        let window_start = now - chrono::Duration::days(8);
        self.schedule
            .after(&window_start)
            .take_while(|t| *t <= now)
            .last()
    }
}

/// Fill in the next collection and warn when the latest expected one has
/// had its full run budget without producing a success.
pub fn check_schedule(
    report: &mut HealthReport,
    schedule: &CollectionSchedule,
    run_budget: Duration,
    now: DateTime<Local>,
) {
    report.next_collection = schedule.next_after(now).map(|t| t.with_timezone(&Utc));

    let Some(expected) = schedule.previous_before(now) else {
        return;
    };
    let budget = chrono::Duration::from_std(run_budget).unwrap_or_else(|_| chrono::Duration::days(1));
    let Some(deadline) = expected.checked_add_signed(budget) else {
        return;
    };
    if now <= deadline {
        return;
    }

    let expected_utc = expected.with_timezone(&Utc);
    let collected = report
        .last_successful_run
        .map(|t| t >= expected_utc)
        .unwrap_or(false);
    if !collected {
        report.warnings.insert(format!(
            "missed collection: expected at {}, no successful run since",
            expected.format("%Y-%m-%d %H:%M %Z")
        ));
    }
}
