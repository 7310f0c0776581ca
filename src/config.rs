//! Run configuration for marketsnap.
//!
//! The on-disk form is [`ScheduleFile`], the same flat `schedule_config.json`
//! layout the collection tooling has always used (TOML is accepted too when
//! the file name ends in `.toml`). [`RunConfig`] is the validated, immutable
//! value that every component receives explicitly.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::NaiveTime;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

/// Default config location, relative to the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "config/schedule_config.json";

/// Name of the append-only lifecycle log inside `log_dir`.
pub const EXECUTION_LOG_FILE: &str = "task_execution.log";

/// Name of the captured fetch-adapter output inside `log_dir`.
pub const COLLECTION_LOG_FILE: &str = "collection.log";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {}: {reason}", .path.display())]
    Parse { path: PathBuf, reason: String },

    #[error("invalid value for `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },
}

impl ConfigError {
    fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// On-disk form
// ---------------------------------------------------------------------------

/// The configuration file as written by operators.
///
/// Every key is optional; unknown keys are ignored so files written for the
/// older scheduler scripts still load.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleFile {
    /// Collection time of day, `HH:MM` (24h).
    pub daily_collection_time: String,
    /// Collect on Saturdays and Sundays too.
    pub weekend_collection: bool,
    /// Retries after the first attempt.
    pub retry_attempts: i64,
    /// Fixed delay between attempts.
    pub retry_delay_minutes: i64,
    /// Per-attempt fetch timeout.
    pub fetch_timeout_minutes: i64,
    /// Reject empty or malformed payloads before persisting.
    pub data_validation: bool,
    pub alert_on_failure: bool,
    pub alert_on_success: bool,
    /// Label of the market timezone the schedule was written for.
    pub timezone: String,
    pub data_dir: PathBuf,
    pub log_dir: PathBuf,
    /// Free-space floor for the data filesystem, in MiB.
    pub min_free_mb: u64,
    /// How long a run waits for the run lock before giving up.
    pub lock_wait_seconds: u64,
    /// Upper bound for a single notification channel.
    pub notify_timeout_seconds: u64,
    pub source: SourceConfig,
    pub email: Option<EmailConfig>,
    pub slack: Option<SlackConfig>,
}

impl Default for ScheduleFile {
    fn default() -> Self {
        Self {
            daily_collection_time: "18:30".to_string(),
            weekend_collection: false,
            retry_attempts: 3,
            retry_delay_minutes: 15,
            fetch_timeout_minutes: 60,
            data_validation: true,
            alert_on_failure: true,
            alert_on_success: true,
            timezone: "US/Eastern".to_string(),
            data_dir: PathBuf::from("data/vix_data"),
            log_dir: PathBuf::from("logs"),
            min_free_mb: 500,
            lock_wait_seconds: 5,
            notify_timeout_seconds: 30,
            source: SourceConfig::default(),
            email: None,
            slack: None,
        }
    }
}

impl ScheduleFile {
    /// Parse the file at `path` without validating or touching the filesystem.
    pub fn read(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(path, &content)
    }

    fn parse(path: &Path, content: &str) -> Result<Self, ConfigError> {
        let parsed = if is_toml_path(path) {
            toml::from_str(content).map_err(|e| e.to_string())
        } else {
            serde_json::from_str(content).map_err(|e| e.to_string())
        };

        parsed.map_err(|reason| ConfigError::Parse {
            path: path.to_path_buf(),
            reason,
        })
    }

    /// Template written by `init-config`, optionally with placeholder
    /// notification sections.
    pub fn template(with_notifications: bool) -> Self {
        let mut file = Self::default();
        if with_notifications {
            file.email = Some(EmailConfig {
                sender_email: "your.email@example.com".to_string(),
                recipient_emails: vec!["recipient1@example.com".to_string()],
                ..EmailConfig::default()
            });
            file.slack = Some(SlackConfig {
                webhook_url: "https://hooks.slack.com/services/YOUR/WEBHOOK/URL".to_string(),
                ..SlackConfig::default()
            });
        }
        file
    }

    pub fn to_pretty_json(&self) -> String {
        // Plain data with string keys; serialization cannot fail.
        serde_json::to_string_pretty(self).unwrap_or_default()
    }

    pub fn to_toml(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }

    /// Worst-case wall time of one run: every attempt timing out plus every
    /// retry delay. Out-of-range values count as zero.
    pub fn run_budget(&self) -> Duration {
        let minutes = |v: i64| Duration::from_secs(u64::try_from(v).unwrap_or(0).saturating_mul(60));
        let retries = u32::try_from(self.retry_attempts).unwrap_or(0);
        minutes(self.fetch_timeout_minutes)
            .saturating_mul(retries.saturating_add(1))
            .saturating_add(minutes(self.retry_delay_minutes).saturating_mul(retries))
    }
}

/// Whether `path` names a TOML file.
pub fn is_toml_path(path: &Path) -> bool {
    path.extension()
        .map(|ext| ext.eq_ignore_ascii_case("toml"))
        .unwrap_or(false)
}

// ---------------------------------------------------------------------------
// Fetch source
// ---------------------------------------------------------------------------

/// Where snapshots come from.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceConfig {
    /// Run an external program and read records from its stdout.
    Command {
        source_id: String,
        program: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        working_dir: Option<PathBuf>,
    },
    /// GET a JSON document from an HTTP endpoint.
    Http { source_id: String, url: String },
}

impl Default for SourceConfig {
    fn default() -> Self {
        SourceConfig::Command {
            source_id: "vix".to_string(),
            program: "python".to_string(),
            args: vec!["scripts/vix_data_fetcher.py".to_string()],
            working_dir: None,
        }
    }
}

impl SourceConfig {
    pub fn source_id(&self) -> &str {
        match self {
            SourceConfig::Command { source_id, .. } | SourceConfig::Http { source_id, .. } => {
                source_id
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Notification channels
// ---------------------------------------------------------------------------

/// Mail delivery through a sendmail-compatible program.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmailConfig {
    pub sender_email: String,
    pub recipient_emails: Vec<String>,
    /// Program invoked as `<sendmail_path> -t`, message on stdin.
    pub sendmail_path: PathBuf,
    pub subject_prefix: String,
}

impl Default for EmailConfig {
    fn default() -> Self {
        Self {
            sender_email: "marketsnap@localhost".to_string(),
            recipient_emails: Vec::new(),
            sendmail_path: PathBuf::from("/usr/sbin/sendmail"),
            subject_prefix: "[VIX Data]".to_string(),
        }
    }
}

/// Chat delivery through an incoming webhook.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SlackConfig {
    pub webhook_url: String,
    pub channel: String,
    pub username: String,
    pub icon_emoji: String,
}

impl Default for SlackConfig {
    fn default() -> Self {
        Self {
            webhook_url: String::new(),
            channel: "#bloomberg-data".to_string(),
            username: "VIX Data Bot".to_string(),
            icon_emoji: ":chart_with_upwards_trend:".to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Validated form
// ---------------------------------------------------------------------------

/// Validated run configuration. Immutable once built.
#[derive(Debug, Clone)]
pub struct RunConfig {
    collection_time: NaiveTime,
    weekdays_only: bool,
    retry_attempts: u32,
    retry_delay: Duration,
    timeout: Duration,
    data_dir: PathBuf,
    log_dir: PathBuf,
    notify_on_success: bool,
    notify_on_failure: bool,
    data_validation: bool,
    timezone: String,
    min_free_bytes: u64,
    lock_wait: Duration,
    notify_timeout: Duration,
    source: SourceConfig,
    email: Option<EmailConfig>,
    slack: Option<SlackConfig>,
}

impl RunConfig {
    /// Load and validate the configuration at `path`.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let file = ScheduleFile::read(path)?;
        let config = Self::from_file(file)?;
        info!(
            path = %path.display(),
            collection_time = %config.collection_time.format("%H:%M"),
            retry_attempts = config.retry_attempts,
            source = config.source.source_id(),
            "loaded run configuration"
        );
        Ok(config)
    }

    /// Validate a parsed file. Fails on the first invalid field; directories
    /// are only created once every other field has passed.
    pub fn from_file(file: ScheduleFile) -> Result<Self, ConfigError> {
        let retry_attempts = u32::try_from(file.retry_attempts).map_err(|_| {
            ConfigError::invalid(
                "retry_attempts",
                format!("must be between 0 and {}, got {}", u32::MAX, file.retry_attempts),
            )
        })?;

        if file.retry_delay_minutes < 0 {
            return Err(ConfigError::invalid(
                "retry_delay_minutes",
                format!("must not be negative, got {}", file.retry_delay_minutes),
            ));
        }
        if retry_attempts > 0 && file.retry_delay_minutes == 0 {
            return Err(ConfigError::invalid(
                "retry_delay_minutes",
                "must be greater than 0 when retry_attempts > 0",
            ));
        }
        let retry_delay = minutes("retry_delay_minutes", file.retry_delay_minutes)?;

        if file.fetch_timeout_minutes <= 0 {
            return Err(ConfigError::invalid(
                "fetch_timeout_minutes",
                format!("must be greater than 0, got {}", file.fetch_timeout_minutes),
            ));
        }
        let timeout = minutes("fetch_timeout_minutes", file.fetch_timeout_minutes)?;

        let collection_time = parse_collection_time(&file.daily_collection_time)?;

        if file.timezone.trim().is_empty() {
            return Err(ConfigError::invalid("timezone", "must not be empty"));
        }

        validate_source(&file.source)?;

        if let Some(email) = &file.email {
            if email.recipient_emails.is_empty() {
                return Err(ConfigError::invalid(
                    "email.recipient_emails",
                    "at least one recipient is required",
                ));
            }
        }
        if let Some(slack) = &file.slack {
            if !is_http_url(&slack.webhook_url) {
                return Err(ConfigError::invalid(
                    "slack.webhook_url",
                    format!("expected an http(s) URL, got '{}'", slack.webhook_url),
                ));
            }
        }

        if file.lock_wait_seconds > MAX_LOCK_WAIT_SECONDS {
            return Err(ConfigError::invalid(
                "lock_wait_seconds",
                format!(
                    "must be at most {}, got {}",
                    MAX_LOCK_WAIT_SECONDS, file.lock_wait_seconds
                ),
            ));
        }

        ensure_dir("data_dir", &file.data_dir)?;
        ensure_dir("log_dir", &file.log_dir)?;

        Ok(Self {
            collection_time,
            weekdays_only: !file.weekend_collection,
            retry_attempts,
            retry_delay,
            timeout,
            data_dir: file.data_dir,
            log_dir: file.log_dir,
            notify_on_success: file.alert_on_success,
            notify_on_failure: file.alert_on_failure,
            data_validation: file.data_validation,
            timezone: file.timezone,
            min_free_bytes: file.min_free_mb.saturating_mul(1024 * 1024),
            lock_wait: Duration::from_secs(file.lock_wait_seconds),
            notify_timeout: Duration::from_secs(file.notify_timeout_seconds.max(1)),
            source: file.source,
            email: file.email,
            slack: file.slack,
        })
    }

    pub fn collection_time(&self) -> NaiveTime {
        self.collection_time
    }

    pub fn weekdays_only(&self) -> bool {
        self.weekdays_only
    }

    pub fn retry_attempts(&self) -> u32 {
        self.retry_attempts
    }

    /// Total fetch calls allowed for one run: the first try plus retries.
    pub fn max_attempts(&self) -> u32 {
        self.retry_attempts.saturating_add(1)
    }

    pub fn retry_delay(&self) -> Duration {
        self.retry_delay
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }

    pub fn notify_on_success(&self) -> bool {
        self.notify_on_success
    }

    pub fn notify_on_failure(&self) -> bool {
        self.notify_on_failure
    }

    pub fn data_validation(&self) -> bool {
        self.data_validation
    }

    pub fn timezone(&self) -> &str {
        &self.timezone
    }

    pub fn min_free_bytes(&self) -> u64 {
        self.min_free_bytes
    }

    pub fn lock_wait(&self) -> Duration {
        self.lock_wait
    }

    pub fn notify_timeout(&self) -> Duration {
        self.notify_timeout
    }

    pub fn source(&self) -> &SourceConfig {
        &self.source
    }

    pub fn email(&self) -> Option<&EmailConfig> {
        self.email.as_ref()
    }

    pub fn slack(&self) -> Option<&SlackConfig> {
        self.slack.as_ref()
    }

    pub fn execution_log_path(&self) -> PathBuf {
        self.log_dir.join(EXECUTION_LOG_FILE)
    }

    pub fn collection_log_path(&self) -> PathBuf {
        self.log_dir.join(COLLECTION_LOG_FILE)
    }
}

/// Upper bound for the minute-valued durations: one week.
const MAX_MINUTES: i64 = 7 * 24 * 60;

/// Upper bound for the run-lock wait: one day.
const MAX_LOCK_WAIT_SECONDS: u64 = 24 * 60 * 60;

/// A non-negative minute count no larger than [`MAX_MINUTES`].
fn minutes(field: &'static str, value: i64) -> Result<Duration, ConfigError> {
    let secs = u64::try_from(value)
        .ok()
        .filter(|_| value <= MAX_MINUTES)
        .and_then(|m| m.checked_mul(60))
        .ok_or_else(|| {
            ConfigError::invalid(
                field,
                format!("must be between 0 and {} minutes, got {}", MAX_MINUTES, value),
            )
        })?;
    Ok(Duration::from_secs(secs))
}

/// Parse `HH:MM` (24h).
pub fn parse_collection_time(value: &str) -> Result<NaiveTime, ConfigError> {
    NaiveTime::parse_from_str(value.trim(), "%H:%M").map_err(|e| {
        ConfigError::invalid(
            "daily_collection_time",
            format!("expected HH:MM (24h), got '{}': {}", value, e),
        )
    })
}

fn validate_source(source: &SourceConfig) -> Result<(), ConfigError> {
    let id = source.source_id();
    let id_ok = !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if !id_ok {
        return Err(ConfigError::invalid(
            "source.source_id",
            format!("must be non-empty and use only [A-Za-z0-9_-], got '{}'", id),
        ));
    }

    match source {
        SourceConfig::Command { program, .. } if program.trim().is_empty() => Err(
            ConfigError::invalid("source.program", "must not be empty"),
        ),
        SourceConfig::Http { url, .. } if !is_http_url(url) => Err(ConfigError::invalid(
            "source.url",
            format!("expected an http(s) URL, got '{}'", url),
        )),
        _ => Ok(()),
    }
}

fn is_http_url(value: &str) -> bool {
    value.starts_with("http://") || value.starts_with("https://")
}

fn ensure_dir(field: &'static str, path: &Path) -> Result<(), ConfigError> {
    if path.as_os_str().is_empty() {
        return Err(ConfigError::invalid(field, "must not be empty"));
    }
    if path.exists() && !path.is_dir() {
        return Err(ConfigError::invalid(
            field,
            format!("{} exists and is not a directory", path.display()),
        ));
    }
    std::fs::create_dir_all(path).map_err(|e| {
        ConfigError::invalid(field, format!("cannot create {}: {}", path.display(), e))
    })?;
    debug!(field, path = %path.display(), "directory ready");
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
