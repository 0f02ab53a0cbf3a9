//! Telegram Bot API channel for human approvals.
//!
//! Requests are posted to a chat with `sendMessage`. Verdicts arrive as
//! replies of the form `/approve <id>` or `/reject <id>`, collected by
//! long-polling `getUpdates`.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::domain::ApprovalRequest;

use super::NotificationChannel;

/// Seconds Telegram holds a `getUpdates` call open
const LONG_POLL_SECONDS: u64 = 25;

/// Telegram Bot API client
pub struct TelegramChannel {
    /// Bot token
    bot_token: String,
    /// Target chat ID
    chat_id: String,
    /// HTTP client
    client: reqwest::Client,
    /// Next `getUpdates` offset; held for the duration of a poll
    offset: Mutex<i64>,
    /// Verdicts seen by one waiter for another waiter's request
    verdicts: std::sync::Mutex<HashMap<Uuid, bool>>,
    /// Pause between polls after a transport error
    retry_interval: Duration,
}

/// Response from Telegram API
#[derive(Debug, Deserialize)]
struct TelegramResponse<T> {
    ok: bool,
    result: Option<T>,
    description: Option<String>,
}

/// Message result from sendMessage
#[derive(Debug, Deserialize)]
struct MessageResult {
    message_id: i64,
}

#[derive(Debug, Deserialize)]
struct Update {
    update_id: i64,
    message: Option<IncomingMessage>,
}

#[derive(Debug, Deserialize)]
struct IncomingMessage {
    chat: Chat,
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Chat {
    id: i64,
}

/// Configuration for Telegram channel
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramConfig {
    pub bot_token: String,
    pub chat_id: String,
}

impl TelegramChannel {
    /// Create a new Telegram channel
    pub fn new(bot_token: String, chat_id: String) -> Self {
        Self {
            bot_token,
            chat_id,
            client: reqwest::Client::new(),
            offset: Mutex::new(0),
            verdicts: std::sync::Mutex::new(HashMap::new()),
            retry_interval: Duration::from_secs(5),
        }
    }

    /// Create from config
    pub fn from_config(config: TelegramConfig) -> Self {
        Self::new(config.bot_token, config.chat_id)
    }

    /// Build API URL
    fn api_url(&self, method: &str) -> String {
        format!("https://api.telegram.org/bot{}/{}", self.bot_token, method)
    }

    /// Send a text message
    pub async fn send_message(&self, text: &str) -> Result<i64> {
        let url = self.api_url("sendMessage");

        let response = self
            .client
            .post(&url)
            .json(&serde_json::json!({
                "chat_id": self.chat_id,
                "text": text,
            }))
            .send()
            .await
            .context("Failed to send Telegram message")?;

        let result: TelegramResponse<MessageResult> = response
            .json()
            .await
            .context("Failed to parse Telegram response")?;

        if !result.ok {
            anyhow::bail!(
                "Telegram API error: {}",
                result.description.unwrap_or_default()
            );
        }

        Ok(result.result.map(|r| r.message_id).unwrap_or(0))
    }

    /// One long-poll round; advances the offset past everything returned
    async fn poll_updates(&self, offset: &mut i64) -> Result<Vec<Update>> {
        let url = self.api_url("getUpdates");

        let response = self
            .client
            .post(&url)
            .json(&serde_json::json!({
                "offset": *offset,
                "timeout": LONG_POLL_SECONDS,
                "allowed_updates": ["message"],
            }))
            .timeout(Duration::from_secs(LONG_POLL_SECONDS + 10))
            .send()
            .await
            .context("Failed to poll Telegram updates")?;

        let result: TelegramResponse<Vec<Update>> = response
            .json()
            .await
            .context("Failed to parse Telegram updates")?;

        if !result.ok {
            anyhow::bail!(
                "Telegram API error: {}",
                result.description.unwrap_or_default()
            );
        }

        let updates = result.result.unwrap_or_default();
        if let Some(last) = updates.iter().map(|u| u.update_id).max() {
            *offset = last + 1;
        }
        Ok(updates)
    }

    fn from_our_chat(&self, message: &IncomingMessage) -> bool {
        message.chat.id.to_string() == self.chat_id
    }

    /// Record every verdict from our chat, whichever request it answers
    fn buffer_verdicts(&self, updates: Vec<Update>) {
        let mut verdicts = self
            .verdicts
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        for message in updates.into_iter().filter_map(|u| u.message) {
            if !self.from_our_chat(&message) {
                continue;
            }
            if let Some((id, approved)) = message.text.as_deref().and_then(parse_verdict) {
                debug!(request_id = %id, approved, "Verdict buffered");
                verdicts.insert(id, approved);
            }
        }
    }

    fn verdicts_contain(&self, request_id: Uuid) -> bool {
        self.verdicts
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .contains_key(&request_id)
    }

    fn take_verdict(&self, request_id: Uuid) -> Option<bool> {
        self.verdicts
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&request_id)
    }
}

/// Parse `/approve <id>` or `/reject <id>` into (id, approved)
pub fn parse_verdict(text: &str) -> Option<(Uuid, bool)> {
    let mut parts = text.split_whitespace();
    let command = parts.next()?;
    // Bot commands in groups may carry a `@botname` suffix
    let command = command.split('@').next().unwrap_or(command);

    let approved = match command {
        "/approve" => true,
        "/reject" => false,
        _ => return None,
    };

    let id = Uuid::parse_str(parts.next()?).ok()?;
    Some((id, approved))
}

#[async_trait]
impl NotificationChannel for TelegramChannel {
    fn name(&self) -> &str {
        "telegram"
    }

    async fn send(&self, request: &ApprovalRequest) -> Result<()> {
        let message_id = self.send_message(&request.to_message()).await?;
        info!(request_id = %request.id, message_id, "Approval request sent to Telegram");
        Ok(())
    }

    async fn await_response(&self, request_id: Uuid) -> Result<bool> {
        loop {
            if let Some(approved) = self.take_verdict(request_id) {
                info!(request_id = %request_id, approved, "Verdict received");
                return Ok(approved);
            }

            let polled = {
                let mut offset = self.offset.lock().await;
                // Another waiter may have buffered our verdict while we queued
                if self.verdicts_contain(request_id) {
                    continue;
                }
                self.poll_updates(&mut offset).await
            };

            match polled {
                Ok(updates) => self.buffer_verdicts(updates),
                Err(e) => {
                    warn!(error = %e, "Telegram poll failed, retrying");
                    tokio::time::sleep(self.retry_interval).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_url() {
        let channel = TelegramChannel::new("TOKEN".to_string(), "123".to_string());
        assert_eq!(
            channel.api_url("sendMessage"),
            "https://api.telegram.org/botTOKEN/sendMessage"
        );
    }

    #[test]
    fn test_parse_verdict() {
        let id = Uuid::new_v4();

        assert_eq!(parse_verdict(&format!("/approve {}", id)), Some((id, true)));
        assert_eq!(parse_verdict(&format!("/reject {}", id)), Some((id, false)));
        assert_eq!(
            parse_verdict(&format!("/approve@carecrew_bot {}", id)),
            Some((id, true))
        );
        assert_eq!(parse_verdict("/approve not-a-uuid"), None);
        assert_eq!(parse_verdict("/approve"), None);
        assert_eq!(parse_verdict(&format!("looks good {}", id)), None);
    }

    #[test]
    fn test_update_parsing() {
        let json = r#"{"ok":true,"result":[{"update_id":7,"message":{"chat":{"id":123},"text":"/reject x"}}]}"#;
        let parsed: TelegramResponse<Vec<Update>> = serde_json::from_str(json).unwrap();
        let updates = parsed.result.unwrap();
        assert_eq!(updates[0].update_id, 7);
        assert_eq!(updates[0].message.as_ref().unwrap().chat.id, 123);
    }

    #[test]
    fn test_verdicts_for_other_requests_are_kept() {
        let channel = TelegramChannel::new("TOKEN".to_string(), "123".to_string());
        let (first, second) = (Uuid::new_v4(), Uuid::new_v4());

        let json = format!(
            r#"{{"ok":true,"result":[
                {{"update_id":1,"message":{{"chat":{{"id":123}},"text":"/approve {second}"}}}},
                {{"update_id":2,"message":{{"chat":{{"id":999}},"text":"/approve {first}"}}}},
                {{"update_id":3,"message":{{"chat":{{"id":123}},"text":"/reject {first}"}}}},
                {{"update_id":4,"message":{{"chat":{{"id":123}},"text":"thanks"}}}}
            ]}}"#
        );
        let parsed: TelegramResponse<Vec<Update>> = serde_json::from_str(&json).unwrap();
        channel.buffer_verdicts(parsed.result.unwrap());

        // The other chat's approval is ignored; ours rejects
        assert_eq!(channel.take_verdict(first), Some(false));
        assert_eq!(channel.take_verdict(second), Some(true));
        assert_eq!(channel.take_verdict(second), None);
    }

    #[tokio::test]
    async fn test_buffered_verdict_answers_without_polling() {
        let channel = TelegramChannel::new("TOKEN".to_string(), "123".to_string());
        let id = Uuid::new_v4();
        channel.verdicts.lock().unwrap().insert(id, true);

        let approved = tokio::time::timeout(Duration::from_secs(1), channel.await_response(id))
            .await
            .unwrap()
            .unwrap();
        assert!(approved);
    }
}
