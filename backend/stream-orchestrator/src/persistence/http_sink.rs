//! HTTP delegation to the wallet and chat services.
//!
//! Tips and chat history are persisted by those services, not here; this
//! sink only forwards the record and relays the outcome. A rejected tip
//! (insufficient balance, frozen wallet) comes back as a structured
//! validation failure for the caller.

use async_trait::async_trait;
use serde::Deserialize;

use super::{ChatRecord, EventSink, TipReceipt, TipRecord};
use crate::error::{AppError, AppResult};

#[derive(Debug, Deserialize)]
struct UpstreamError {
    error: String,
}

pub struct HttpEventSink {
    client: reqwest::Client,
    wallet_base_url: String,
    chat_base_url: String,
}

impl HttpEventSink {
    pub fn new(wallet_base_url: String, chat_base_url: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            wallet_base_url,
            chat_base_url,
        }
    }
}

#[async_trait]
impl EventSink for HttpEventSink {
    async fn tip_sent(&self, tip: &TipRecord) -> AppResult<TipReceipt> {
        let url = format!("{}/internal/tips", self.wallet_base_url);
        let response = self.client.post(&url).json(tip).send().await.map_err(|err| {
            tracing::error!(error = %err, "wallet service unreachable");
            AppError::Internal
        })?;

        let status = response.status();
        if status.is_client_error() {
            let reason = response
                .json::<UpstreamError>()
                .await
                .map(|e| e.error)
                .unwrap_or_else(|_| "tip rejected by wallet service".into());
            return Err(AppError::Validation(reason));
        }
        if !status.is_success() {
            tracing::error!(status = %status, "wallet service tip write failed");
            return Err(AppError::Internal);
        }

        response.json::<TipReceipt>().await.map_err(|err| {
            tracing::error!(error = %err, "malformed wallet service response");
            AppError::Internal
        })
    }

    async fn chat_message(&self, chat: &ChatRecord) -> AppResult<()> {
        let url = format!("{}/internal/messages", self.chat_base_url);
        let response = self
            .client
            .post(&url)
            .json(chat)
            .send()
            .await
            .map_err(|err| {
                tracing::error!(error = %err, "chat service unreachable");
                AppError::Internal
            })?;

        if !response.status().is_success() {
            tracing::error!(status = %response.status(), "chat service message write failed");
            return Err(AppError::Internal);
        }
        Ok(())
    }
}
