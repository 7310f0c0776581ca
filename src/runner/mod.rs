//! One end-to-end collection run: load, lock, fetch with retry, persist,
//! notify.
//!
//! The run walks `Idle -> Loading -> Fetching -> Persisting -> Notifying ->
//! Done(outcome)`. Every run ends in a [`RunResult`]; nothing here returns an
//! error to the caller, the outcome carries it.

pub mod history;
pub mod journal;
pub mod lock;
pub mod retry;

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Datelike, Local, Utc, Weekday};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::{ConfigError, RunConfig, ScheduleFile, EXECUTION_LOG_FILE};
use crate::fetch::{self, FetchError, Fetcher, Snapshot};
use crate::notify::Notifier;
use crate::storage::SnapshotStore;
use crate::system::disk;

pub use history::{RunOutcome, RunResult};
use journal::{ExecutionLog, JournalEntry, RunEvent};
use lock::RunLock;
use retry::{run_with_retry, RetryPolicy};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Loading,
    Fetching,
    Persisting,
    Notifying,
    Done(RunOutcome),
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions {
    /// Run even when the weekday-only schedule would skip today.
    pub force: bool,
}

/// Whether a weekday-only schedule collects on `day`.
pub fn is_collection_day(weekdays_only: bool, day: Weekday) -> bool {
    !weekdays_only || !matches!(day, Weekday::Sat | Weekday::Sun)
}

/// Load the configuration at `config_path` and run once with the fetcher it
/// describes.
pub async fn run_once(config_path: &Path, options: RunOptions) -> RunResult {
    run_once_with(config_path, options, fetch::from_config).await
}

/// Like [`run_once`] with a caller-supplied fetcher factory.
pub async fn run_once_with<B>(config_path: &Path, options: RunOptions, build_fetcher: B) -> RunResult
where
    B: FnOnce(&RunConfig) -> Box<dyn Fetcher>,
{
    let mut run = RunTracker::new();
    run.enter(RunState::Loading);

    let config = match RunConfig::load(config_path) {
        Ok(config) => config,
        Err(e) => return config_failure(run, config_path, e).await,
    };

    let notifier = Notifier::from_config(config.email(), config.slack(), config.notify_timeout());
    let fetcher = build_fetcher(&config);
    Orchestrator::new(config, fetcher, notifier)
        .execute(run, options)
        .await
}

/// Owns everything one run needs once the configuration is valid.
pub struct Orchestrator {
    config: RunConfig,
    fetcher: Box<dyn Fetcher>,
    notifier: Notifier,
}

impl Orchestrator {
    pub fn new(config: RunConfig, fetcher: Box<dyn Fetcher>, notifier: Notifier) -> Self {
        Self {
            config,
            fetcher,
            notifier,
        }
    }

    pub async fn run(&self, options: RunOptions) -> RunResult {
        self.execute(RunTracker::new(), options).await
    }

    async fn execute(&self, mut run: RunTracker, options: RunOptions) -> RunResult {
        run.attach_journal(self.config.execution_log_path()).await;
        info!(
            run_id = %run.run_id,
            source = self.fetcher.source_id(),
            max_attempts = self.config.max_attempts(),
            "collection run started"
        );

        let today = Local::now().weekday();
        if !options.force && !is_collection_day(self.config.weekdays_only(), today) {
            info!(weekday = %today, "weekend collection disabled, skipping");
            let result = run.result(
                RunOutcome::SkippedWeekend,
                0,
                Some(format!("weekend collection disabled ({today})")),
                None,
            );
            return self.complete(run, result, false).await;
        }

        let lock = match RunLock::acquire(self.config.data_dir(), self.config.lock_wait()).await {
            Ok(Some(lock)) => lock,
            Ok(None) => {
                run.record(run.entry(RunEvent::LockSkipped)).await;
                let result = run.result(
                    RunOutcome::SkippedConcurrentRun,
                    0,
                    Some("another run holds the data directory lock".to_string()),
                    None,
                );
                return self.complete(run, result, false).await;
            }
            Err(e) => {
                let result = run.result(
                    RunOutcome::PersistError,
                    0,
                    Some(format!(
                        "cannot lock {}: {}",
                        self.config.data_dir().display(),
                        e
                    )),
                    None,
                );
                let notify = self.config.notify_on_failure();
                return self.complete(run, result, notify).await;
            }
        };

        run.enter(RunState::Fetching);
        let (snapshot, attempts) = match self.fetch_with_retry(&run).await {
            Ok(fetched) => fetched,
            Err(failure) => {
                drop(lock);
                let result = run.result(
                    RunOutcome::FailedAfterRetries,
                    failure.attempts,
                    Some(failure.last_error.to_string()),
                    None,
                );
                let notify = self.config.notify_on_failure();
                return self.complete(run, result, notify).await;
            }
        };

        run.enter(RunState::Persisting);
        if disk::is_disk_critical(self.config.data_dir(), self.config.min_free_bytes()) {
            warn!(
                data_dir = %self.config.data_dir().display(),
                floor_mb = self.config.min_free_bytes() / (1024 * 1024),
                "free space below configured floor"
            );
        }
        let stored = SnapshotStore::open(self.config.data_dir()).and_then(|store| store.store(snapshot));
        drop(lock);

        let (result, notify) = match stored {
            Ok(path) => {
                run.record(
                    run.entry(RunEvent::SnapshotStored)
                        .with_attempt(attempts)
                        .with_path(path.clone()),
                )
                .await;
                (
                    run.result(RunOutcome::Success, attempts, None, Some(path)),
                    self.config.notify_on_success(),
                )
            }
            Err(e) => {
                error!(error = %e, "snapshot could not be persisted");
                (
                    run.result(RunOutcome::PersistError, attempts, Some(e.to_string()), None),
                    self.config.notify_on_failure(),
                )
            }
        };
        self.complete(run, result, notify).await
    }

    async fn fetch_with_retry(
        &self,
        run: &RunTracker,
    ) -> Result<(Snapshot, u32), retry::RunFailure<FetchError>> {
        let policy = RetryPolicy::new(self.config.max_attempts(), self.config.retry_delay());
        let timeout = self.config.timeout();
        let validate = self.config.data_validation();
        let fetcher = &self.fetcher;

        let attempted = run_with_retry(policy, |attempt| async move {
            let fetched = match fetcher.fetch(timeout).await {
                Ok(snapshot) if validate => snapshot.validate().map(|_| snapshot),
                other => other,
            };
            if let Err(e) = &fetched {
                run.record(
                    run.entry(RunEvent::AttemptFailed)
                        .with_attempt(attempt)
                        .with_detail(e.to_string()),
                )
                .await;
            }
            fetched
        })
        .await?;

        Ok((attempted.value, attempted.attempts))
    }

    async fn complete(&self, run: RunTracker, result: RunResult, notify: bool) -> RunResult {
        finish(run, result, notify.then_some(&self.notifier)).await
    }
}

/// Config could not be loaded. Failure alerts still go out when the file
/// parsed far enough to name its channels.
async fn config_failure(mut run: RunTracker, path: &Path, err: ConfigError) -> RunResult {
    error!(config = %path.display(), error = %err, "configuration rejected");

    let parsed = ScheduleFile::read(path).ok();
    if let Some(file) = &parsed {
        // Never create directories for a config that failed validation.
        if file.log_dir.is_dir() {
            run.attach_journal(file.log_dir.join(EXECUTION_LOG_FILE)).await;
        }
    }

    let result = run.result(RunOutcome::ConfigError, 0, Some(err.to_string()), None);
    let notifier = parsed.filter(|file| file.alert_on_failure).map(|file| {
        Notifier::from_config(
            file.email.as_ref(),
            file.slack.as_ref(),
            Duration::from_secs(file.notify_timeout_seconds.max(1)),
        )
    });
    finish(run, result, notifier.as_ref()).await
}

async fn finish(mut run: RunTracker, result: RunResult, notifier: Option<&Notifier>) -> RunResult {
    if let Some(notifier) = notifier.filter(|n| !n.is_empty()) {
        run.enter(RunState::Notifying);
        let deliveries = notifier.notify(&result).await;
        let delivered = deliveries.iter().filter(|d| d.is_delivered()).count();
        debug!(delivered, channels = deliveries.len(), "notifications done");
    }

    let outcome = result.outcome();
    run.enter(RunState::Done(outcome));

    let mut entry = run
        .entry(RunEvent::RunFinished)
        .with_outcome(outcome.as_str())
        .with_attempt(result.attempts_made());
    if let Some(detail) = result.error_detail() {
        entry = entry.with_detail(detail);
    }
    if let Some(path) = result.stored_path() {
        entry = entry.with_path(path);
    }
    run.record(entry).await;

    let elapsed_ms = (result.finished_at() - result.started_at()).num_milliseconds();
    match outcome {
        RunOutcome::Success | RunOutcome::SkippedWeekend | RunOutcome::SkippedConcurrentRun => info!(
            run_id = %result.run_id(),
            outcome = %outcome,
            attempts = result.attempts_made(),
            elapsed_ms,
            "collection run finished"
        ),
        _ => error!(
            run_id = %result.run_id(),
            outcome = %outcome,
            attempts = result.attempts_made(),
            error = result.error_detail().unwrap_or_default(),
            elapsed_ms,
            "collection run failed"
        ),
    }
    result
}

// ---------------------------------------------------------------------------
// Per-run bookkeeping
// ---------------------------------------------------------------------------

struct RunTracker {
    run_id: Uuid,
    started_at: DateTime<Utc>,
    state: RunState,
    journal: Option<ExecutionLog>,
}

impl RunTracker {
    fn new() -> Self {
        Self {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            state: RunState::Idle,
            journal: None,
        }
    }

    fn enter(&mut self, next: RunState) {
        debug!(run_id = %self.run_id, from = ?self.state, to = ?next, "run state");
        self.state = next;
    }

    async fn attach_journal(&mut self, path: PathBuf) {
        match ExecutionLog::open(path).await {
            Ok(log) => {
                self.journal = Some(log);
                self.record(self.entry(RunEvent::RunStarted)).await;
            }
            Err(e) => warn!(error = %format!("{e:#}"), "execution log unavailable"),
        }
    }

    fn entry(&self, event: RunEvent) -> JournalEntry {
        JournalEntry::new(self.run_id.to_string(), event)
    }

    async fn record(&self, entry: JournalEntry) {
        if let Some(journal) = &self.journal {
            if let Err(e) = journal.append(&entry).await {
                warn!(
                    path = %journal.path().display(),
                    error = %format!("{e:#}"),
                    "failed to write execution log"
                );
            }
        }
    }

    fn result(
        &self,
        outcome: RunOutcome,
        attempts: u32,
        detail: Option<String>,
        path: Option<PathBuf>,
    ) -> RunResult {
        RunResult::finish(self.run_id, self.started_at, outcome, attempts, detail, path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};

    use chrono::TimeZone;
    use serde_json::json;

    use crate::notify::{Channel, Message, NotificationError};
    use crate::storage::list_snapshot_files;

    /// Plays back a script of results, then keeps failing.
    struct ScriptedFetcher {
        script: Mutex<VecDeque<Result<Snapshot, FetchError>>>,
        fallback: FetchError,
        calls: Arc<AtomicU32>,
    }

    impl ScriptedFetcher {
        fn new(script: Vec<Result<Snapshot, FetchError>>, fallback: FetchError) -> (Self, Arc<AtomicU32>) {
            let calls = Arc::new(AtomicU32::new(0));
            let fetcher = Self {
                script: Mutex::new(script.into()),
                fallback,
                calls: calls.clone(),
            };
            (fetcher, calls)
        }
    }

    #[async_trait::async_trait]
    impl Fetcher for ScriptedFetcher {
        fn source_id(&self) -> &str {
            "vix"
        }

        async fn fetch(&self, _timeout: Duration) -> Result<Snapshot, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let next = self.script.lock().unwrap().pop_front();
            next.unwrap_or_else(|| Err(self.fallback.clone()))
        }
    }

    struct RecordingChannel {
        sent: Arc<Mutex<Vec<Message>>>,
    }

    #[async_trait::async_trait]
    impl Channel for RecordingChannel {
        fn name(&self) -> &str {
            "recording"
        }

        async fn send(&self, message: &Message) -> Result<(), NotificationError> {
            self.sent.lock().unwrap().push(message.clone());
            Ok(())
        }
    }

    struct Fixture {
        dir: tempfile::TempDir,
        sent: Arc<Mutex<Vec<Message>>>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                dir: tempfile::TempDir::new().unwrap(),
                sent: Arc::new(Mutex::new(Vec::new())),
            }
        }

        fn file(&self) -> ScheduleFile {
            ScheduleFile {
                weekend_collection: true,
                retry_attempts: 3,
                retry_delay_minutes: 15,
                data_dir: self.dir.path().join("data"),
                log_dir: self.dir.path().join("logs"),
                lock_wait_seconds: 0,
                ..ScheduleFile::default()
            }
        }

        fn orchestrator(&self, file: ScheduleFile, fetcher: ScriptedFetcher) -> Orchestrator {
            let config = RunConfig::from_file(file).unwrap();
            let notifier = Notifier::new(Duration::from_secs(30)).with_channel(Box::new(RecordingChannel {
                sent: self.sent.clone(),
            }));
            Orchestrator::new(config, Box::new(fetcher), notifier)
        }

        fn data_files(&self) -> Vec<PathBuf> {
            list_snapshot_files(&self.dir.path().join("data")).unwrap()
        }

        fn messages(&self) -> Vec<Message> {
            self.sent.lock().unwrap().clone()
        }

        fn journal_events(&self) -> Vec<RunEvent> {
            journal::read_entries(&self.dir.path().join("logs").join(EXECUTION_LOG_FILE))
                .unwrap()
                .into_iter()
                .map(|e| e.event)
                .collect()
        }
    }

    fn snapshot() -> Snapshot {
        Snapshot::new("vix", Utc::now(), vec![json!({"ticker": "UX1 Index", "px_last": 14.25})])
    }

    fn unavailable() -> FetchError {
        FetchError::SourceUnavailable("terminal not logged in".to_string())
    }

    #[tokio::test(start_paused = true)]
    async fn test_two_failures_then_success() {
        let fx = Fixture::new();
        let (fetcher, calls) = ScriptedFetcher::new(
            vec![Err(unavailable()), Err(unavailable()), Ok(snapshot())],
            unavailable(),
        );

        let result = fx.orchestrator(fx.file(), fetcher).run(RunOptions::default()).await;

        assert_eq!(result.outcome(), RunOutcome::Success);
        assert_eq!(result.attempts_made(), 3);
        assert_eq!(result.exit_code(), 0);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(fx.data_files().len(), 1);
        assert_eq!(result.stored_path(), Some(fx.data_files()[0].as_path()));

        let messages = fx.messages();
        assert_eq!(messages.len(), 1);
        assert!(messages[0].subject.contains("succeeded"));

        assert_eq!(
            fx.journal_events(),
            [
                RunEvent::RunStarted,
                RunEvent::AttemptFailed,
                RunEvent::AttemptFailed,
                RunEvent::SnapshotStored,
                RunEvent::RunFinished,
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_always_timing_out_exhausts_retries() {
        let fx = Fixture::new();
        let (fetcher, calls) =
            ScriptedFetcher::new(Vec::new(), FetchError::Timeout(Duration::from_secs(3600)));

        let result = fx.orchestrator(fx.file(), fetcher).run(RunOptions::default()).await;

        assert_eq!(result.outcome(), RunOutcome::FailedAfterRetries);
        assert_eq!(result.attempts_made(), 4);
        assert_eq!(result.exit_code(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert!(fx.data_files().is_empty());

        let messages = fx.messages();
        assert_eq!(messages.len(), 1);
        assert!(messages[0].subject.contains("FAILED"));
        assert!(messages[0].body.contains("no snapshot within"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_payload_is_retried() {
        let fx = Fixture::new();
        let empty = Snapshot::new("vix", Utc::now(), Vec::new());
        let (fetcher, calls) = ScriptedFetcher::new(vec![Ok(empty), Ok(snapshot())], unavailable());

        let result = fx.orchestrator(fx.file(), fetcher).run(RunOptions::default()).await;

        assert_eq!(result.outcome(), RunOutcome::Success);
        assert_eq!(result.attempts_made(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_success_without_alert_sends_nothing() {
        let fx = Fixture::new();
        let file = ScheduleFile {
            alert_on_success: false,
            ..fx.file()
        };
        let (fetcher, _) = ScriptedFetcher::new(vec![Ok(snapshot())], unavailable());

        let result = fx.orchestrator(file, fetcher).run(RunOptions::default()).await;

        assert_eq!(result.outcome(), RunOutcome::Success);
        assert!(fx.messages().is_empty());
    }

    #[tokio::test]
    async fn test_existing_snapshot_is_persist_error() {
        let fx = Fixture::new();
        let collected = Utc.with_ymd_and_hms(2024, 3, 4, 22, 30, 0).unwrap();
        let records = vec![json!({"ticker": "VIX Index", "px_last": 13.1})];

        let store = SnapshotStore::open(fx.dir.path().join("data")).unwrap();
        let first = store
            .store(Snapshot::new("vix", collected, records.clone()))
            .unwrap();
        let before = std::fs::read(&first).unwrap();

        let (fetcher, calls) =
            ScriptedFetcher::new(vec![Ok(Snapshot::new("vix", collected, records))], unavailable());
        let result = fx.orchestrator(fx.file(), fetcher).run(RunOptions::default()).await;

        assert_eq!(result.outcome(), RunOutcome::PersistError);
        assert_eq!(result.exit_code(), 4);
        assert_eq!(calls.load(Ordering::SeqCst), 1, "persist errors are not retried");
        assert!(result.error_detail().unwrap().contains("already exists"));
        assert_eq!(std::fs::read(&first).unwrap(), before);
        assert_eq!(fx.messages().len(), 1);
    }

    #[tokio::test]
    async fn test_held_lock_skips_without_fetching() {
        let fx = Fixture::new();
        let file = fx.file();
        std::fs::create_dir_all(&file.data_dir).unwrap();
        let _held = RunLock::acquire(&file.data_dir, Duration::ZERO)
            .await
            .unwrap()
            .unwrap();

        let (fetcher, calls) = ScriptedFetcher::new(vec![Ok(snapshot())], unavailable());
        let result = fx.orchestrator(file, fetcher).run(RunOptions::default()).await;

        assert_eq!(result.outcome(), RunOutcome::SkippedConcurrentRun);
        assert_eq!(result.exit_code(), 5);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(fx.data_files().is_empty());
        assert!(fx.messages().is_empty());
        assert!(fx.journal_events().contains(&RunEvent::LockSkipped));
    }

    #[test]
    fn test_weekday_guard() {
        assert!(!is_collection_day(true, Weekday::Sat));
        assert!(!is_collection_day(true, Weekday::Sun));
        assert!(is_collection_day(true, Weekday::Mon));
        assert!(is_collection_day(true, Weekday::Fri));
        assert!(is_collection_day(false, Weekday::Sun));
    }

    #[tokio::test]
    async fn test_invalid_config_never_fetches() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("schedule_config.json");
        let logs = dir.path().join("logs");
        std::fs::create_dir(&logs).unwrap();
        let body = serde_json::json!({"daily_collection_time": "25:99", "log_dir": logs});
        std::fs::write(&path, body.to_string()).unwrap();

        let built = Arc::new(AtomicU32::new(0));
        let counter = built.clone();
        let result = run_once_with(&path, RunOptions::default(), move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            let (fetcher, _) = ScriptedFetcher::new(Vec::new(), unavailable());
            Box::new(fetcher)
        })
        .await;

        assert_eq!(result.outcome(), RunOutcome::ConfigError);
        assert_eq!(result.exit_code(), 2);
        assert_eq!(built.load(Ordering::SeqCst), 0);
        assert!(result.error_detail().unwrap().contains("daily_collection_time"));

        let entries = journal::read_entries(&logs.join(EXECUTION_LOG_FILE)).unwrap();
        let last = entries.last().unwrap();
        assert_eq!(last.event, RunEvent::RunFinished);
        assert_eq!(last.outcome.as_deref(), Some("config_error"));
    }

    #[tokio::test]
    async fn test_missing_config_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let result = run_once(&dir.path().join("absent.json"), RunOptions::default()).await;
        assert_eq!(result.outcome(), RunOutcome::ConfigError);
        assert_eq!(result.attempts_made(), 0);
    }
}
