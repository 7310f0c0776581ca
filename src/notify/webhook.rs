//! Slack-style incoming webhook.

use reqwest::Client;
use serde::Serialize;

use super::{Channel, Message, NotificationError};
use crate::config::SlackConfig;

#[derive(Debug, Serialize)]
struct Payload<'a> {
    channel: &'a str,
    text: String,
    username: &'a str,
    icon_emoji: &'a str,
}

pub struct SlackChannel {
    config: SlackConfig,
    client: Client,
}

impl SlackChannel {
    pub fn new(config: SlackConfig) -> Self {
        Self {
            config,
            client: Client::new(),
        }
    }

    fn payload<'a>(&'a self, message: &Message) -> Payload<'a> {
        Payload {
            channel: &self.config.channel,
            text: format!("*{}*\n```{}```", message.subject, message.body.trim_end()),
            username: &self.config.username,
            icon_emoji: &self.config.icon_emoji,
        }
    }
}

#[async_trait::async_trait]
impl Channel for SlackChannel {
    fn name(&self) -> &str {
        "slack"
    }

    async fn send(&self, message: &Message) -> Result<(), NotificationError> {
        let response = self
            .client
            .post(&self.config.webhook_url)
            .json(&self.payload(message))
            .send()
            .await
            .map_err(|e| NotificationError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(NotificationError::Rejected(format!(
                "webhook returned HTTP {}: {}",
                status,
                body.trim()
            )));
        }
        Ok(())
    }
}
