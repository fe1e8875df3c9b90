//! Telegram delivery through the Bot API (`POST /bot<token>/sendMessage`).
//!
//! The notification recipient is the target chat id.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::json;

use herald_common::error::AppError;

use crate::sender::{DeliveryError, Sender};

/// Envelope of every Bot API response.
#[derive(Debug, Deserialize)]
struct ApiResponse {
    ok: bool,
    #[serde(default)]
    description: Option<String>,
}

pub struct TelegramSender {
    client: Client,
    endpoint: String,
}

impl TelegramSender {
    /// `timeout` bounds each whole request, connect through body.
    pub fn new(api_url: &str, bot_token: &str, timeout: Duration) -> Result<Self, AppError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::Config(format!("Failed to build Telegram client: {e}")))?;

        Ok(Self::with_client(client, api_url, bot_token))
    }

    pub fn with_client(client: Client, api_url: &str, bot_token: &str) -> Self {
        Self {
            client,
            endpoint: format!(
                "{}/bot{}/sendMessage",
                api_url.trim_end_matches('/'),
                bot_token
            ),
        }
    }
}

#[async_trait]
impl Sender for TelegramSender {
    async fn send(&self, recipient: &str, message: &str) -> Result<(), DeliveryError> {
        let chat_id = recipient.trim();
        if chat_id.is_empty() {
            return Err(DeliveryError::InvalidRecipient("empty chat id".to_string()));
        }

        let response = self
            .client
            .post(&self.endpoint)
            .json(&json!({ "chat_id": chat_id, "text": message }))
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        let body = response.text().await.map_err(transport_error)?;

        check_response(status, &body)?;

        tracing::debug!(chat_id, "Telegram message accepted");
        Ok(())
    }
}

fn transport_error(e: reqwest::Error) -> DeliveryError {
    if e.is_timeout() {
        DeliveryError::Transport(format!("Telegram request timed out: {e}"))
    } else {
        DeliveryError::Transport(format!("Telegram request failed: {e}"))
    }
}

/// A delivery succeeded only on a 2xx status with `"ok": true`.
fn check_response(status: StatusCode, body: &str) -> Result<(), DeliveryError> {
    let parsed = serde_json::from_str::<ApiResponse>(body).ok();
    let description = parsed
        .as_ref()
        .and_then(|r| r.description.clone())
        .unwrap_or_else(|| body.to_string());

    if !status.is_success() {
        return Err(DeliveryError::Rejected(format!("{status}: {description}")));
    }

    match parsed {
        Some(ApiResponse { ok: true, .. }) => Ok(()),
        Some(_) => Err(DeliveryError::Rejected(description)),
        None => Err(DeliveryError::Rejected(format!(
            "unexpected Telegram response: {body}"
        ))),
    }
}
