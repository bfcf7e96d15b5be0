//! Operational notifiers.
//!
//! `TelegramNotifier` posts lifecycle events to a chat; `LogNotifier` is the
//! fallback when no bot is configured.

use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use std::time::Duration;
use tracing::{error, info, instrument};

use crate::domain::card::mask_public_id;
use crate::domain::{AppError, CardEvent, CardEventKind, ExternalServiceError, Notifier};

/// Default Telegram Bot API base URL
pub const DEFAULT_TELEGRAM_API_URL: &str = "https://api.telegram.org";

#[derive(Debug, Serialize)]
struct SendMessage<'a> {
    chat_id: &'a str,
    text: String,
    disable_web_page_preview: bool,
}

/// Human-readable one-liner for an event
#[must_use]
pub fn format_event(event: &CardEvent) -> String {
    let card = mask_public_id(&event.public_id);
    let mut text = match event.kind {
        CardEventKind::Created => format!("New card {}", card),
        CardEventKind::Funded => format!("Card {} funded", card),
        CardEventKind::Locked => format!("Card {} locked", card),
        CardEventKind::Claimed => format!("Card {} claimed", card),
        CardEventKind::Refunded => format!("Card {} refunded", card),
    };
    if let Some(amount) = event.amount_sol {
        text.push_str(&format!(" ({:.4} SOL)", amount));
    }
    if let Some(currency) = &event.currency {
        text.push_str(&format!(" [{}]", currency));
    }
    if let Some(signature) = &event.signature {
        text.push_str(&format!("\nhttps://solscan.io/tx/{}", signature));
    }
    text
}

/// Sends events to a Telegram chat through the Bot API
pub struct TelegramNotifier {
    http_client: Client,
    base_url: String,
    bot_token: SecretString,
    chat_id: String,
}

impl TelegramNotifier {
    pub fn new(
        bot_token: SecretString,
        chat_id: String,
        base_url: Option<String>,
    ) -> Result<Self, AppError> {
        let http_client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| ExternalServiceError::Configuration(e.to_string()))?;

        Ok(Self {
            http_client,
            base_url: base_url
                .unwrap_or_else(|| DEFAULT_TELEGRAM_API_URL.to_string())
                .trim_end_matches('/')
                .to_string(),
            bot_token,
            chat_id,
        })
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    #[instrument(skip(self, event), fields(public_id = %event.public_id, kind = %event.kind))]
    async fn notify(&self, event: &CardEvent) -> Result<(), AppError> {
        let url = format!(
            "{}/bot{}/sendMessage",
            self.base_url,
            self.bot_token.expose_secret()
        );
        let body = SendMessage {
            chat_id: &self.chat_id,
            text: format_event(event),
            disable_web_page_preview: true,
        };

        // The URL embeds the token; never log the reqwest error verbatim
        let response = self
            .http_client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                let err = ExternalServiceError::from(e.without_url());
                error!(error = %err, "Telegram request failed");
                err
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            error!(status = %status, body = %body, "Telegram API returned error");
            return Err(ExternalServiceError::ApiError {
                status_code: status.as_u16(),
                message: body,
            }
            .into());
        }
        Ok(())
    }
}

/// Writes events to the log only
#[derive(Debug, Default, Clone)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, event: &CardEvent) -> Result<(), AppError> {
        info!(kind = %event.kind, message = %format_event(event), "Card event");
        Ok(())
    }
}
