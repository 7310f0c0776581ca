//! Email through a local sendmail-compatible program.

use std::process::Stdio;

use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use super::{Channel, Message, NotificationError};
use crate::config::EmailConfig;

pub struct EmailChannel {
    config: EmailConfig,
}

impl EmailChannel {
    pub fn new(config: EmailConfig) -> Self {
        Self { config }
    }

    /// RFC 5322 text handed to `sendmail -t`, which takes recipients from
    /// the headers.
    pub fn render(&self, message: &Message) -> String {
        let subject = if self.config.subject_prefix.is_empty() {
            message.subject.clone()
        } else {
            format!("{} {}", self.config.subject_prefix, message.subject)
        };
        format!(
            "From: {}\r\nTo: {}\r\nSubject: {}\r\nMIME-Version: 1.0\r\nContent-Type: text/plain; charset=utf-8\r\n\r\n{}",
            self.config.sender_email,
            self.config.recipient_emails.join(", "),
            subject,
            message.body.replace('\n', "\r\n"),
        )
    }
}

#[async_trait::async_trait]
impl Channel for EmailChannel {
    fn name(&self) -> &str {
        "email"
    }

    async fn send(&self, message: &Message) -> Result<(), NotificationError> {
        let program = &self.config.sendmail_path;
        let mut child = Command::new(program)
            .arg("-t")
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                NotificationError::Transport(format!("cannot run {}: {}", program.display(), e))
            })?;

        let rendered = self.render(message);
        let written = match child.stdin.take() {
            Some(mut stdin) => stdin.write_all(rendered.as_bytes()).await,
            None => Ok(()),
        };

        let output = child.wait_with_output().await.map_err(|e| {
            NotificationError::Transport(format!("{} did not finish: {}", program.display(), e))
        })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(NotificationError::Rejected(format!(
                "{} exited with {}: {}",
                program.display(),
                output.status,
                stderr.trim()
            )));
        }
        written.map_err(|e| NotificationError::Transport(format!("writing message: {e}")))?;

        debug!(recipients = self.config.recipient_emails.len(), "mail handed to sendmail");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn channel(sendmail: &str) -> EmailChannel {
        EmailChannel::new(EmailConfig {
            sender_email: "collector@example.com".to_string(),
            recipient_emails: vec!["a@example.com".to_string(), "b@example.com".to_string()],
            sendmail_path: PathBuf::from(sendmail),
            subject_prefix: "[VIX Data]".to_string(),
        })
    }

    fn message() -> Message {
        Message {
            subject: "Daily collection FAILED (2024-03-04)".to_string(),
            body: "Outcome:   failed_after_retries\nAttempts:  4\n".to_string(),
        }
    }

    #[test]
    fn test_render_headers() {
        let text = channel("/usr/sbin/sendmail").render(&message());
        let (headers, body) = text.split_once("\r\n\r\n").unwrap();

        assert!(headers.contains("From: collector@example.com"));
        assert!(headers.contains("To: a@example.com, b@example.com"));
        assert!(headers.contains("Subject: [VIX Data] Daily collection FAILED (2024-03-04)"));
        assert!(body.starts_with("Outcome:   failed_after_retries\r\n"));
    }

    #[tokio::test]
    async fn test_missing_program_is_transport_error() {
        let err = channel("/nonexistent/sendmail").send(&message()).await.unwrap_err();
        assert!(matches!(err, NotificationError::Transport(_)), "{err:?}");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_nonzero_exit_is_rejected() {
        let err = channel("false").send(&message()).await.unwrap_err();
        assert!(matches!(err, NotificationError::Rejected(_)), "{err:?}");
    }
}
