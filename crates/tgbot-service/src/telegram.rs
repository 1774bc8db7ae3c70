//! Telegram Bot API adapter
//!
//! Thin JSON client over the Bot API implementing both transport traits:
//! `sendMessage` for the outbound side and long-poll `getUpdates` for the
//! inbound side when webhook delivery is off. Only the fields the dispatcher
//! consumes are deserialized.

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client as HttpClient;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use crate::transport::{ChatTransport, Outbound, Result, TransportError, Update, UpdateSource};

const LONG_POLL_SECONDS: u64 = 30;

/// Bot API client.
#[derive(Debug)]
pub struct TelegramApi {
    http: HttpClient,
    base_url: String,
    /// Next getUpdates offset.
    offset: AtomicI64,
}

#[derive(Debug, Deserialize)]
struct ApiEnvelope<T> {
    ok: bool,
    #[serde(default)]
    description: Option<String>,
    result: Option<T>,
}

#[derive(Debug, Deserialize)]
pub struct TelegramUpdate {
    pub update_id: i64,
    #[serde(default)]
    pub message: Option<TelegramMessage>,
    #[serde(default)]
    pub callback_query: Option<TelegramCallbackQuery>,
}

#[derive(Debug, Deserialize)]
pub struct TelegramMessage {
    pub message_id: i64,
    #[serde(default)]
    pub from: Option<TelegramUser>,
    pub chat: TelegramChat,
    #[serde(default)]
    pub text: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct TelegramCallbackQuery {
    pub id: String,
    pub from: TelegramUser,
    #[serde(default)]
    pub message: Option<TelegramMessage>,
    #[serde(default)]
    pub data: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct TelegramUser {
    pub id: i64,
}

#[derive(Debug, Deserialize)]
pub struct TelegramChat {
    pub id: i64,
}

/// Map a raw Bot API update onto the transport's [`Update`].
pub fn into_update(raw: TelegramUpdate) -> Option<Update> {
    if let Some(query) = raw.callback_query {
        let chat_id = query.message.as_ref().map(|m| m.chat.id)?;
        return Some(Update {
            user_id: query.from.id.to_string(),
            chat_id,
            text: None,
            callback_data: query.data,
            message_id: query.message.map(|m| m.message_id),
        });
    }
    let message = raw.message?;
    let user = message.from.as_ref()?;
    Some(Update {
        user_id: user.id.to_string(),
        chat_id: message.chat.id,
        text: message.text,
        callback_data: None,
        message_id: Some(message.message_id),
    })
}

impl TelegramApi {
    pub fn new(bot_token: &str) -> Self {
        let http = HttpClient::builder()
            .timeout(Duration::from_secs(LONG_POLL_SECONDS + 10))
            .build()
            .expect("failed to build HTTP client");
        Self {
            http,
            base_url: format!("https://api.telegram.org/bot{bot_token}"),
            offset: AtomicI64::new(0),
        }
    }

    async fn call<T: serde::de::DeserializeOwned>(
        &self,
        method: &str,
        body: serde_json::Value,
    ) -> Result<T> {
        let url = format!("{}/{method}", self.base_url);
        let response = self
            .http
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| TransportError::Http(e.to_string()))?;
        let envelope: ApiEnvelope<T> = response
            .json()
            .await
            .map_err(|e| TransportError::Http(e.to_string()))?;
        if !envelope.ok {
            return Err(TransportError::Api(
                envelope.description.unwrap_or_else(|| "unknown error".to_string()),
            ));
        }
        envelope
            .result
            .ok_or_else(|| TransportError::Api("missing result".to_string()))
    }
}

#[async_trait]
impl ChatTransport for TelegramApi {
    async fn send(&self, message: Outbound) -> Result<()> {
        let mut body = json!({
            "chat_id": message.chat_id,
            "text": message.text,
        });
        if let Some(mode) = &message.parse_mode {
            body["parse_mode"] = json!(mode);
        }
        if let Some(rows) = &message.buttons {
            let keyboard: Vec<Vec<serde_json::Value>> = rows
                .iter()
                .map(|row| {
                    row.iter()
                        .map(|b| json!({"text": b.label, "callback_data": b.callback_data}))
                        .collect()
                })
                .collect();
            body["reply_markup"] = json!({ "inline_keyboard": keyboard });
        }
        let _: serde_json::Value = self.call("sendMessage", body).await?;
        Ok(())
    }
}

#[async_trait]
impl UpdateSource for TelegramApi {
    async fn next_batch(&self) -> Result<Vec<Update>> {
        let offset = self.offset.load(Ordering::SeqCst);
        let body = json!({
            "offset": offset,
            "timeout": LONG_POLL_SECONDS,
            "allowed_updates": ["message", "callback_query"],
        });
        let raw: Vec<TelegramUpdate> = self.call("getUpdates", body).await?;
        if let Some(last) = raw.last() {
            self.offset.store(last.update_id + 1, Ordering::SeqCst);
        }
        debug!(count = raw.len(), "polled updates");
        Ok(raw.into_iter().filter_map(into_update).collect())
    }
}
