use async_trait::async_trait;
use serde_json::json;
use std::time::Duration;
use tracing::{debug, info};

use crate::types::{PipelineError, Result};

/// Opaque channel transport. Used only by the publisher.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, message: &str) -> Result<()>;
}

/// Telegram bot API transport posting to a channel.
pub struct TelegramTransport {
    client: reqwest::Client,
    bot_token: String,
    channel_id: String,
}

impl TelegramTransport {
    pub fn new(
        bot_token: impl Into<String>,
        channel_id: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let bot_token = bot_token.into();
        let channel_id = channel_id.into();
        if bot_token.is_empty() || channel_id.is_empty() {
            return Err(PipelineError::Configuration(
                "TELEGRAM_BOT_TOKEN and TELEGRAM_CHANNEL_ID must be set".to_string(),
            ));
        }
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            bot_token,
            channel_id,
        })
    }
}

#[async_trait]
impl Transport for TelegramTransport {
    async fn send(&self, message: &str) -> Result<()> {
        debug!(channel = %self.channel_id, "sending message");

        let response = self
            .client
            .post(format!(
                "https://api.telegram.org/bot{}/sendMessage",
                self.bot_token
            ))
            .json(&json!({
                "chat_id": self.channel_id,
                "text": message,
                "parse_mode": "Markdown",
                "disable_web_page_preview": true,
            }))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(PipelineError::Transport(format!(
                "telegram returned {}: {}",
                status, body
            )));
        }
        Ok(())
    }
}

/// Transport that only logs; used for credential-less local runs.
pub struct EchoTransport;

#[async_trait]
impl Transport for EchoTransport {
    async fn send(&self, message: &str) -> Result<()> {
        info!("would publish:\n{}", message);
        Ok(())
    }
}
