//! Best-effort run notifications.
//!
//! Every configured channel gets one attempt per run. Sends run
//! concurrently, each bounded by the same timeout; a failing channel is
//! logged and reported back, never escalated into the run outcome.

use std::fmt::Write as _;
use std::time::Duration;

use futures::future::join_all;
use thiserror::Error;
use tracing::{info, warn};

use crate::config::{EmailConfig, SlackConfig};
use crate::runner::{RunOutcome, RunResult};

pub mod email;
pub mod webhook;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NotificationError {
    #[error("transport failure: {0}")]
    Transport(String),

    #[error("rejected: {0}")]
    Rejected(String),

    #[error("no answer within {0:?}")]
    Timeout(Duration),
}

/// Rendered notification, shared by every channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub subject: String,
    pub body: String,
}

impl Message {
    /// Summarize a finished run.
    pub fn for_run(result: &RunResult) -> Self {
        let outcome = result.outcome();
        let date = result.started_at().format("%Y-%m-%d");
        let subject = match outcome {
            RunOutcome::Success => format!("Daily collection succeeded ({date})"),
            RunOutcome::FailedAfterRetries => format!("Daily collection FAILED ({date})"),
            RunOutcome::ConfigError => format!("Daily collection not started: config error ({date})"),
            RunOutcome::PersistError => format!("Daily collection FAILED to save ({date})"),
            RunOutcome::SkippedConcurrentRun | RunOutcome::SkippedWeekend => {
                format!("Daily collection skipped ({date})")
            }
        };

        let mut body = String::new();
        let _ = writeln!(body, "Outcome:   {}", outcome);
        let _ = writeln!(body, "Run:       {}", result.run_id());
        let _ = writeln!(body, "Started:   {}", result.started_at().to_rfc3339());
        let _ = writeln!(body, "Finished:  {}", result.finished_at().to_rfc3339());
        let _ = writeln!(body, "Attempts:  {}", result.attempts_made());
        if let Some(path) = result.stored_path() {
            let _ = writeln!(body, "Saved to:  {}", path.display());
        }
        if let Some(detail) = result.error_detail() {
            let _ = writeln!(body, "Error:     {}", detail);
        }

        if outcome.is_failure() {
            body.push_str("\nPlease check:\n");
            for item in FAILURE_CHECKLIST {
                let _ = writeln!(body, "  - {}", item);
            }
        }

        Self { subject, body }
    }
}

const FAILURE_CHECKLIST: &[&str] = &[
    "the market-data terminal is running and logged in",
    "network connectivity to the data source",
    "the fetch program runs by hand from the working directory",
    "free disk space on the data volume",
    "the configuration file loads (marketsnap status --detailed)",
];

/// A notification transport.
#[async_trait::async_trait]
pub trait Channel: Send + Sync {
    fn name(&self) -> &str;

    async fn send(&self, message: &Message) -> Result<(), NotificationError>;
}

/// Result of one channel send.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub channel: String,
    pub result: Result<(), NotificationError>,
}

impl Delivery {
    pub fn is_delivered(&self) -> bool {
        self.result.is_ok()
    }
}

/// Fan-out over the configured channels.
pub struct Notifier {
    channels: Vec<Box<dyn Channel>>,
    per_channel_timeout: Duration,
}

impl Notifier {
    pub fn new(per_channel_timeout: Duration) -> Self {
        Self {
            channels: Vec::new(),
            per_channel_timeout,
        }
    }

    pub fn with_channel(mut self, channel: Box<dyn Channel>) -> Self {
        self.channels.push(channel);
        self
    }

    /// Channels for the configured email and Slack sections, if any.
    pub fn from_config(
        email: Option<&EmailConfig>,
        slack: Option<&SlackConfig>,
        per_channel_timeout: Duration,
    ) -> Self {
        let mut notifier = Self::new(per_channel_timeout);
        if let Some(email) = email {
            notifier = notifier.with_channel(Box::new(email::EmailChannel::new(email.clone())));
        }
        if let Some(slack) = slack {
            notifier = notifier.with_channel(Box::new(webhook::SlackChannel::new(slack.clone())));
        }
        notifier
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    pub fn channel_names(&self) -> Vec<&str> {
        self.channels.iter().map(|c| c.name()).collect()
    }

    pub async fn notify(&self, result: &RunResult) -> Vec<Delivery> {
        self.send(&Message::for_run(result)).await
    }

    /// Send `message` on every channel concurrently. Always returns one
    /// delivery per channel.
    pub async fn send(&self, message: &Message) -> Vec<Delivery> {
        let timeout = self.per_channel_timeout;
        let sends = self.channels.iter().map(|channel| async move {
            let result = match tokio::time::timeout(timeout, channel.send(message)).await {
                Ok(result) => result,
                Err(_) => Err(NotificationError::Timeout(timeout)),
            };
            match &result {
                Ok(()) => info!(channel = channel.name(), "notification sent"),
                Err(e) => warn!(channel = channel.name(), error = %e, "notification failed"),
            }
            Delivery {
                channel: channel.name().to_string(),
                result,
            }
        });
        join_all(sends).await
    }
}
