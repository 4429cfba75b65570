//! Topic-addressed publish/subscribe bus
//!
//! One topic per market per kind: `trades.<marketId>` carries trade and
//! indexed-progress messages, `comments.<marketId>` carries discussion
//! events published elsewhere. Delivery is at-most-once per subscriber
//! connection and not durable; indexing correctness never depends on the
//! bus, so publish failures are logged and swallowed by callers.

pub mod local;
pub mod redis;

pub use local::LocalEventBus;
pub use redis::RedisEventBus;

use crate::error::IndexerResult;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

pub fn trades_topic(market_id: Uuid) -> String {
    format!("trades.{market_id}")
}

pub fn comments_topic(market_id: Uuid) -> String {
    format!("comments.{market_id}")
}

/// Messages the indexer publishes. Amounts are fixed-18 decimal strings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BusMessage {
    #[serde(rename_all = "camelCase")]
    Trade {
        market_id: Uuid,
        tx_hash: String,
        log_index: u64,
        block_number: u64,
        timestamp: DateTime<Utc>,
        side: String,
        outcome: i32,
        #[serde(rename = "amountInUSDF")]
        amount_in_usdf: String,
        price: String,
        amount_out_shares: String,
    },
    #[serde(rename_all = "camelCase")]
    Indexed {
        last_indexed_block: u64,
        head_block: u64,
        lag_blocks: u64,
        emitted_at: DateTime<Utc>,
    },
    #[serde(rename_all = "camelCase")]
    Comment {
        #[serde(flatten)]
        payload: serde_json::Value,
    },
}

/// A live subscription. Messages arrive as the raw JSON published to the
/// topic; dropping the receiver tears the subscription down.
pub struct BusSubscription {
    pub receiver: mpsc::Receiver<(String, String)>,
}

#[async_trait]
pub trait EventBus: Send + Sync {
    async fn publish(&self, topic: &str, message: &BusMessage) -> IndexerResult<()>;

    /// Subscribe to a set of topics with one upstream subscription
    async fn subscribe(&self, topics: &[String]) -> IndexerResult<BusSubscription>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trade_message_serializes_with_wire_field_names() {
        let message = BusMessage::Trade {
            market_id: Uuid::nil(),
            tx_hash: "0xabc".to_string(),
            log_index: 1,
            block_number: 10,
            timestamp: Utc::now(),
            side: "buy".to_string(),
            outcome: 0,
            amount_in_usdf: "1000000000000000000".to_string(),
            price: "500000000000000000".to_string(),
            amount_out_shares: "2000000000000000000".to_string(),
        };
        let value = serde_json::to_value(&message).unwrap();
        assert_eq!(value["type"], "trade");
        assert_eq!(value["amountInUSDF"], "1000000000000000000");
        assert_eq!(value["txHash"], "0xabc");
    }

    #[test]
    fn indexed_message_round_trips() {
        let message = BusMessage::Indexed {
            last_indexed_block: 100,
            head_block: 102,
            lag_blocks: 2,
            emitted_at: Utc::now(),
        };
        let json = serde_json::to_string(&message).unwrap();
        assert!(json.contains("\"type\":\"indexed\""));
        let parsed: BusMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, message);
    }
}
