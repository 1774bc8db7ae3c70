//! Chat transport abstraction
//!
//! The service consumes [`Update`]s and produces [`Outbound`] messages; the
//! concrete bot API client is injected behind [`ChatTransport`] and
//! [`UpdateSource`] so polling, webhook, and test transports are
//! interchangeable.

use std::sync::Mutex;

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;

/// Transport result alias
pub type Result<T> = std::result::Result<T, TransportError>;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport HTTP error: {0}")]
    Http(String),

    #[error("bot API error: {0}")]
    Api(String),
}

/// One inbound chat event.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Update {
    pub user_id: String,
    pub chat_id: i64,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub callback_data: Option<String>,
    #[serde(default)]
    pub message_id: Option<i64>,
}

impl Update {
    pub fn text(user_id: &str, chat_id: i64, text: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            chat_id,
            text: Some(text.to_string()),
            callback_data: None,
            message_id: None,
        }
    }

    pub fn callback(user_id: &str, chat_id: i64, data: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            chat_id,
            text: None,
            callback_data: Some(data.to_string()),
            message_id: None,
        }
    }
}

/// One button of an inline keyboard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Button {
    pub label: String,
    pub callback_data: String,
}

impl Button {
    pub fn new(label: impl Into<String>, callback_data: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            callback_data: callback_data.into(),
        }
    }
}

/// One outbound chat message.
#[derive(Debug, Clone, Default)]
pub struct Outbound {
    pub chat_id: i64,
    pub text: String,
    /// Inline keyboard rows.
    pub buttons: Option<Vec<Vec<Button>>>,
    pub parse_mode: Option<String>,
}

impl Outbound {
    pub fn text(chat_id: i64, text: impl Into<String>) -> Self {
        Self {
            chat_id,
            text: text.into(),
            buttons: None,
            parse_mode: None,
        }
    }

    pub fn with_buttons(mut self, buttons: Vec<Vec<Button>>) -> Self {
        self.buttons = Some(buttons);
        self
    }
}

/// Outbound side of the chat transport.
#[async_trait]
pub trait ChatTransport: Send + Sync {
    async fn send(&self, message: Outbound) -> Result<()>;
}

/// Inbound side for poll-style delivery.
#[async_trait]
pub trait UpdateSource: Send + Sync {
    /// Block until at least one update is available or a poll cycle expires.
    async fn next_batch(&self) -> Result<Vec<Update>>;
}

/// Transport double that records everything it is asked to send.
#[derive(Debug, Default)]
pub struct RecordingTransport {
    sent: Mutex<Vec<Outbound>>,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<Outbound> {
        self.sent.lock().unwrap().clone()
    }

    /// All message texts, in send order.
    pub fn texts(&self) -> Vec<String> {
        self.sent.lock().unwrap().iter().map(|m| m.text.clone()).collect()
    }
}

#[async_trait]
impl ChatTransport for RecordingTransport {
    async fn send(&self, message: Outbound) -> Result<()> {
        self.sent.lock().unwrap().push(message);
        Ok(())
    }
}
