//! Redis pub/sub bus
//!
//! Publishes through the shared command pool; each subscription holds its
//! own pub/sub connection, torn down when the subscriber drops its receiver.

use super::{BusMessage, BusSubscription, EventBus};
use crate::error::{IndexerError, IndexerResult, StorageError};
use async_trait::async_trait;
use deadpool_redis::{Config, Pool, Runtime};
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tracing::{debug, warn};

const SUBSCRIPTION_BUFFER: usize = 256;

pub struct RedisEventBus {
    pool: Pool,
    client: redis::Client,
}

impl RedisEventBus {
    pub fn new(redis_url: &str) -> IndexerResult<Self> {
        let cfg = Config::from_url(redis_url);
        let pool = cfg
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| IndexerError::Storage(StorageError::Cache(e.to_string())))?;
        let client = redis::Client::open(redis_url)?;
        Ok(Self { pool, client })
    }
}

#[async_trait]
impl EventBus for RedisEventBus {
    async fn publish(&self, topic: &str, message: &BusMessage) -> IndexerResult<()> {
        let payload = serde_json::to_string(message)?;
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| IndexerError::Storage(StorageError::Cache(e.to_string())))?;
        redis::cmd("PUBLISH")
            .arg(topic)
            .arg(payload)
            .query_async::<_, ()>(&mut *conn)
            .await?;
        Ok(())
    }

    async fn subscribe(&self, topics: &[String]) -> IndexerResult<BusSubscription> {
        let mut pubsub = self.client.get_async_connection().await?.into_pubsub();
        for topic in topics {
            pubsub.subscribe(topic).await?;
        }

        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        tokio::spawn(async move {
            let mut stream = pubsub.on_message();
            while let Some(message) = stream.next().await {
                let topic = message.get_channel_name().to_string();
                let payload: String = match message.get_payload() {
                    Ok(payload) => payload,
                    Err(err) => {
                        warn!(error = %err, "dropping undecodable bus payload");
                        continue;
                    }
                };
                if tx.send((topic, payload)).await.is_err() {
                    debug!("bus subscriber dropped, closing pubsub connection");
                    break;
                }
            }
        });

        Ok(BusSubscription { receiver: rx })
    }
}
