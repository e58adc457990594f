use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::observability;

const API_BASE: &str = "https://api.telegram.org";

#[derive(Debug, Error)]
pub enum TelegramError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("telegram rejected message ({status}): {description}")]
    Rejected { status: u16, description: String },
}

/// Outbound chat channel used for broadcasts.
#[async_trait]
pub trait MessageSender: Send + Sync {
    async fn send(&self, chat_id: &str, text: &str) -> Result<(), TelegramError>;
}

#[derive(Debug, Serialize)]
struct SendMessage<'a> {
    chat_id: &'a str,
    text: &'a str,
    disable_web_page_preview: bool,
}

#[derive(Debug, Deserialize)]
struct ApiReply {
    ok: bool,
    #[serde(default)]
    description: Option<String>,
}

/// Bot API client.
pub struct TelegramClient {
    client: Client,
    token: String,
    base: String,
}

impl TelegramClient {
    pub fn new(token: impl Into<String>) -> Self {
        Self::with_base(token, API_BASE)
    }

    /// Point at another Bot API server, e.g. a local one.
    pub fn with_base(token: impl Into<String>, base: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            token: token.into(),
            base: base.into(),
        }
    }

    fn url(&self, method: &str) -> String {
        format!("{}/bot{}/{method}", self.base.trim_end_matches('/'), self.token)
    }
}

#[async_trait]
impl MessageSender for TelegramClient {
    async fn send(&self, chat_id: &str, text: &str) -> Result<(), TelegramError> {
        let body = SendMessage { chat_id, text, disable_web_page_preview: true };
        let response = self.client.post(self.url("sendMessage")).json(&body).send().await?;
        let status = response.status();
        let reply: ApiReply = response.json().await?;
        if !status.is_success() || !reply.ok {
            let description = reply.description.unwrap_or_else(|| "no description".into());
            warn!(chat_id, status = status.as_u16(), "telegram send failed: {description}");
            metrics::counter!(observability::MESSAGES_SENT_TOTAL, "outcome" => "error").increment(1);
            return Err(TelegramError::Rejected { status: status.as_u16(), description });
        }
        metrics::counter!(observability::MESSAGES_SENT_TOTAL, "outcome" => "ok").increment(1);
        info!(chat_id, "telegram message sent ({} chars)", text.chars().count());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_embeds_token() {
        let client = TelegramClient::with_base("123:abc", "http://localhost:8081/");
        assert_eq!(client.url("sendMessage"), "http://localhost:8081/bot123:abc/sendMessage");
        assert!(TelegramClient::new("t").url("getMe").starts_with("https://api.telegram.org/bott/"));
    }

    #[test]
    fn request_body_shape() {
        let body = SendMessage { chat_id: "-100", text: "hi", disable_web_page_preview: true };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["chat_id"], "-100");
        assert_eq!(json["text"], "hi");
    }
}
