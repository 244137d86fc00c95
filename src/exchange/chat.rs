use std::time::Duration;

use tracing::warn;

use super::{ChatMessage, TradeSource};

/// Outcome of the chat-retrieval polling loop.
///
/// The exchange populates chat history asynchronously after a
/// webhook fires, so an empty result right away is normal. Callers
/// must handle `GaveUp` explicitly; it is never an error.
#[derive(Debug)]
pub enum ChatFetch {
    Messages(Vec<ChatMessage>),
    GaveUp { attempts: u32 },
}

/// Poll the trade chat until messages arrive, with a fixed attempt
/// budget and fixed inter-attempt delay. Fail-soft: store errors and
/// empty responses both count as a missed attempt.
pub async fn fetch_chat_with_retry(
    source: &dyn TradeSource,
    trade_hash: &str,
    attempts: u32,
    delay: Duration,
) -> ChatFetch {
    for attempt in 1..=attempts {
        match source.chat_messages(trade_hash).await {
            Ok(messages) if !messages.is_empty() => {
                return ChatFetch::Messages(messages);
            }
            Ok(_) => {}
            Err(e) => {
                warn!(
                    "Chat fetch attempt {}/{} failed for {}: {}",
                    attempt, attempts, trade_hash, e
                );
            }
        }
        if attempt < attempts {
            tokio::time::sleep(delay).await;
        }
    }

    warn!(
        "Chat messages for {} not available after {} attempts, giving up",
        trade_hash, attempts
    );
    ChatFetch::GaveUp { attempts }
}
