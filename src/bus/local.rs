//! In-process bus fallback
//!
//! Broadcast channel per topic, created lazily. Used when Redis is disabled
//! and by the test suite; delivery semantics match the Redis bus from a
//! subscriber's point of view.

use super::{BusMessage, BusSubscription, EventBus};
use crate::error::IndexerResult;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::{broadcast, mpsc};

const TOPIC_BUFFER: usize = 256;

#[derive(Default)]
pub struct LocalEventBus {
    topics: Mutex<HashMap<String, broadcast::Sender<String>>>,
}

impl LocalEventBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn sender(&self, topic: &str) -> broadcast::Sender<String> {
        let mut topics = self.topics.lock().unwrap();
        topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(TOPIC_BUFFER).0)
            .clone()
    }
}

#[async_trait]
impl EventBus for LocalEventBus {
    async fn publish(&self, topic: &str, message: &BusMessage) -> IndexerResult<()> {
        let payload = serde_json::to_string(message)?;
        // No subscribers is not an error
        let _ = self.sender(topic).send(payload);
        Ok(())
    }

    async fn subscribe(&self, topics: &[String]) -> IndexerResult<BusSubscription> {
        let (tx, rx) = mpsc::channel(TOPIC_BUFFER);
        for topic in topics {
            let mut upstream = self.sender(topic).subscribe();
            let tx = tx.clone();
            let topic = topic.clone();
            tokio::spawn(async move {
                loop {
                    match upstream.recv().await {
                        Ok(payload) => {
                            if tx.send((topic.clone(), payload)).await.is_err() {
                                break; // subscriber went away
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            });
        }
        Ok(BusSubscription { receiver: rx })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::trades_topic;
    use chrono::Utc;
    use uuid::Uuid;

    #[tokio::test]
    async fn subscriber_receives_published_messages() {
        let bus = LocalEventBus::new();
        let market_id = Uuid::new_v4();
        let topic = trades_topic(market_id);

        let mut subscription = bus.subscribe(&[topic.clone()]).await.unwrap();
        bus.publish(
            &topic,
            &BusMessage::Indexed {
                last_indexed_block: 5,
                head_block: 6,
                lag_blocks: 1,
                emitted_at: Utc::now(),
            },
        )
        .await
        .unwrap();

        let (received_topic, payload) = subscription.receiver.recv().await.unwrap();
        assert_eq!(received_topic, topic);
        assert!(payload.contains("\"type\":\"indexed\""));
    }

    #[tokio::test]
    async fn topics_are_isolated() {
        let bus = LocalEventBus::new();
        let topic_a = trades_topic(Uuid::new_v4());
        let topic_b = trades_topic(Uuid::new_v4());

        let mut sub_a = bus.subscribe(&[topic_a.clone()]).await.unwrap();
        bus.publish(
            &topic_b,
            &BusMessage::Indexed {
                last_indexed_block: 1,
                head_block: 1,
                lag_blocks: 0,
                emitted_at: Utc::now(),
            },
        )
        .await
        .unwrap();

        // Nothing lands on the unrelated topic
        let nothing =
            tokio::time::timeout(std::time::Duration::from_millis(50), sub_a.receiver.recv())
                .await;
        assert!(nothing.is_err());
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_fine() {
        let bus = LocalEventBus::new();
        bus.publish(
            &trades_topic(Uuid::new_v4()),
            &BusMessage::Indexed {
                last_indexed_block: 1,
                head_block: 1,
                lag_blocks: 0,
                emitted_at: Utc::now(),
            },
        )
        .await
        .unwrap();
    }
}
