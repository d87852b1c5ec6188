//! Outbound Telegram Bot API client.
//!
//! One POST per call against `https://api.telegram.org/bot<token>/<method>`.
//! The base URL is overridable so tests can point at a local mock server.

use anyhow::{bail, Result};
use serde::Deserialize;

pub const TELEGRAM_API_BASE: &str = "https://api.telegram.org";

#[derive(Debug, Deserialize)]
struct TelegramApiResponse {
    ok: bool,
    #[serde(default)]
    result: Option<serde_json::Value>,
    #[serde(default)]
    error_code: Option<i64>,
    #[serde(default)]
    description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendOutcome {
    /// Telegram's `message_id` for the delivered message, when the method
    /// returns one.
    pub provider_message_id: Option<i64>,
}

pub struct TelegramApi {
    client: reqwest::Client,
    base_url: String,
    token: String,
}

impl TelegramApi {
    pub fn new(token: impl Into<String>) -> Self {
        Self::with_base_url(TELEGRAM_API_BASE, token)
    }

    pub fn with_base_url(base_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
        }
    }

    /// Invoke a Bot API method with the given params, verbatim.
    pub async fn send(&self, method: &str, params: serde_json::Value) -> Result<SendOutcome> {
        let url = format!("{}/bot{}/{}", self.base_url, self.token, method);
        let response = self.client.post(&url).json(&params).send().await?;
        let status = response.status();

        let body: TelegramApiResponse = match response.json().await {
            Ok(body) => body,
            Err(_) => bail!(
                "telegram_api_error:{}:{}",
                status.as_u16(),
                "unreadable response body"
            ),
        };

        if !status.is_success() || !body.ok {
            let code = body
                .error_code
                .unwrap_or_else(|| i64::from(status.as_u16()));
            let description = body
                .description
                .unwrap_or_else(|| "unknown error".to_string());
            bail!("telegram_api_error:{code}:{description}");
        }

        let provider_message_id = body
            .result
            .as_ref()
            .and_then(|r| r.get("message_id"))
            .and_then(serde_json::Value::as_i64);
        Ok(SendOutcome {
            provider_message_id,
        })
    }

    pub async fn send_message(&self, chat_id: &str, text: &str) -> Result<SendOutcome> {
        self.send(
            "sendMessage",
            serde_json::json!({ "chat_id": chat_id, "text": text }),
        )
        .await
    }
}
