use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use super::{ChatMessage, MessageSink, TradeDetails, TradeSource};
use crate::error::{AppError, AppResult};

/// HTTP client for the peer-to-peer exchange API.
///
/// Thin shim: every method is a single invoke against the exchange,
/// mapped onto the engine's collaborator traits.
pub struct ExchangeClient {
    base_url: String,
    http: reqwest::Client,
}

#[derive(Deserialize)]
struct TradeEnvelope {
    data: TradeData,
}

#[derive(Deserialize)]
struct TradeData {
    trade: TradeDetails,
}

#[derive(Deserialize)]
struct ChatEnvelope {
    data: ChatData,
}

#[derive(Deserialize)]
struct ChatData {
    #[serde(default)]
    messages: Vec<ChatMessage>,
}

impl ExchangeClient {
    pub fn new(base_url: String) -> Self {
        Self {
            base_url,
            http: reqwest::Client::new(),
        }
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }
}

#[async_trait]
impl TradeSource for ExchangeClient {
    async fn get_trade(&self, trade_hash: &str) -> AppResult<TradeDetails> {
        debug!("Fetching trade details for {}", trade_hash);
        let response = self
            .http
            .post(self.endpoint("/paxful/v1/trade/get"))
            .json(&json!({ "trade_hash": trade_hash }))
            .send()
            .await?
            .error_for_status()?;

        let envelope: TradeEnvelope = response.json().await.map_err(|e| {
            AppError::ExternalError(format!("Malformed trade response for {}: {}", trade_hash, e))
        })?;
        Ok(envelope.data.trade)
    }

    async fn chat_messages(&self, trade_hash: &str) -> AppResult<Vec<ChatMessage>> {
        let response = self
            .http
            .post(self.endpoint("/paxful/v1/trade-chat/get"))
            .json(&json!({ "trade_hash": trade_hash }))
            .send()
            .await?
            .error_for_status()?;

        let envelope: ChatEnvelope = response.json().await.map_err(|e| {
            AppError::ExternalError(format!("Malformed chat response for {}: {}", trade_hash, e))
        })?;
        Ok(envelope.data.messages)
    }
}

#[async_trait]
impl MessageSink for ExchangeClient {
    async fn post_message(&self, trade_hash: &str, text: &str) -> AppResult<()> {
        self.http
            .post(self.endpoint("/paxful/v1/trade-chat/post"))
            .json(&json!({ "trade_hash": trade_hash, "message": text }))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}
