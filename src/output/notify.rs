//! Best-effort status notifications
//!
//! A notifier never fails the pipeline: delivery errors are logged and
//! dropped inside the implementation.

use crate::config::NotifyConfig;
use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;

const TELEGRAM_API: &str = "https://api.telegram.org";

/// Severity of a notification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyLevel {
    Info,
    Success,
    Warning,
    Error,
}

impl NotifyLevel {
    pub fn emoji(&self) -> &'static str {
        match self {
            Self::Info => "ℹ️",
            Self::Success => "✅",
            Self::Warning => "⚠️",
            Self::Error => "🚨",
        }
    }
}

impl fmt::Display for NotifyLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Info => "info",
            Self::Success => "success",
            Self::Warning => "warning",
            Self::Error => "error",
        };
        f.write_str(name)
    }
}

/// Notification channel
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, message: &str, level: NotifyLevel);
}

/// Writes notifications to the log only
#[derive(Debug, Clone, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, message: &str, level: NotifyLevel) {
        match level {
            NotifyLevel::Error => tracing::error!("{}", message),
            NotifyLevel::Warning => tracing::warn!("{}", message),
            NotifyLevel::Info | NotifyLevel::Success => tracing::info!("{}", message),
        }
    }
}

#[derive(Serialize)]
struct SendMessage<'a> {
    chat_id: &'a str,
    text: String,
    parse_mode: &'static str,
}

/// Posts notifications to a Telegram chat through the Bot API
#[derive(Debug, Clone)]
pub struct TelegramNotifier {
    client: Client,
    api_base: String,
    token: String,
    chat_id: String,
}

impl TelegramNotifier {
    pub fn new(client: Client, token: impl Into<String>, chat_id: impl Into<String>) -> Self {
        Self {
            client,
            api_base: TELEGRAM_API.to_string(),
            token: token.into(),
            chat_id: chat_id.into(),
        }
    }

    /// Overrides the API origin (used against mock servers)
    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into();
        self
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/bot{}/sendMessage",
            self.api_base.trim_end_matches('/'),
            self.token
        )
    }
}

/// Prefixes the message with the level's emoji and a header line
///
/// The message body is escaped, so error texts such as `SERVER_ERROR` reach
/// the chat verbatim instead of being parsed as Markdown.
pub fn format_message(message: &str, level: NotifyLevel) -> String {
    format!("{} *Tomecrawl*\n\n{}", level.emoji(), escape_markdown(message))
}

/// Escapes the entity markers of Telegram's legacy Markdown
pub fn escape_markdown(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        if matches!(c, '_' | '*' | '`' | '[') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn notify(&self, message: &str, level: NotifyLevel) {
        let body = SendMessage {
            chat_id: &self.chat_id,
            text: format_message(message, level),
            parse_mode: "Markdown",
        };

        let result = self
            .client
            .post(self.endpoint())
            .json(&body)
            .send()
            .await
            .and_then(|r| r.error_for_status());

        if let Err(e) = result {
            tracing::warn!("Failed to send {} notification: {}", level, e);
        }
    }
}

/// Builds the configured notifier, falling back to the log
pub fn build_notifier(config: Option<&NotifyConfig>, client: Client) -> Arc<dyn Notifier> {
    match config {
        Some(c) if c.enabled => Arc::new(TelegramNotifier::new(
            client,
            c.telegram_token.clone(),
            c.telegram_chat_id.clone(),
        )),
        _ => Arc::new(LogNotifier),
    }
}
