pub mod chat;
pub mod client;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::AppResult;

pub use chat::{fetch_chat_with_retry, ChatFetch};
pub use client::ExchangeClient;

/// Trade details as returned by the exchange's trade-details call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeDetails {
    pub trade_hash: String,
    pub fiat_amount_requested: Decimal,
    pub fiat_currency_code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub buyer_name: Option<String>,
}

/// One chat message on a trade. `text` stays untyped because the
/// exchange sends plain strings for normal messages and nested
/// objects for bank-account instructions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trade_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<serde_json::Value>,
}

/// Read side of the external exchange.
#[async_trait]
pub trait TradeSource: Send + Sync {
    async fn get_trade(&self, trade_hash: &str) -> AppResult<TradeDetails>;

    async fn chat_messages(&self, trade_hash: &str) -> AppResult<Vec<ChatMessage>>;
}

/// Write side of the external exchange chat.
#[async_trait]
pub trait MessageSink: Send + Sync {
    async fn post_message(&self, trade_hash: &str, text: &str) -> AppResult<()>;
}
