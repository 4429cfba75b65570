//! Redis queue backend
//!
//! Lists for the FIFOs (`LPUSH`/`BRPOP`), `SET NX EX` for the sweep locks.
//! Connections come from a deadpool pool shared with the event bus.

use super::QueueBackend;
use crate::error::{IndexerError, IndexerResult, StorageError};
use async_trait::async_trait;
use deadpool_redis::{Config, Pool, Runtime};
use std::time::Duration;

pub struct RedisQueueBackend {
    pool: Pool,
}

impl RedisQueueBackend {
    pub fn new(redis_url: &str) -> IndexerResult<Self> {
        let cfg = Config::from_url(redis_url);
        let pool = cfg
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| IndexerError::Storage(StorageError::Queue(e.to_string())))?;
        Ok(Self { pool })
    }

    async fn conn(&self) -> IndexerResult<deadpool_redis::Connection> {
        self.pool
            .get()
            .await
            .map_err(|e| IndexerError::Storage(StorageError::Queue(e.to_string())))
    }
}

#[async_trait]
impl QueueBackend for RedisQueueBackend {
    async fn push(&self, queue: &str, payload: String) -> IndexerResult<()> {
        let mut conn = self.conn().await?;
        redis::cmd("LPUSH")
            .arg(queue)
            .arg(payload)
            .query_async::<_, ()>(&mut *conn)
            .await?;
        Ok(())
    }

    async fn pop_blocking(&self, queue: &str, timeout: Duration) -> IndexerResult<Option<String>> {
        let mut conn = self.conn().await?;
        // BRPOP returns (queue, payload) or nil on timeout
        let popped: Option<(String, String)> = redis::cmd("BRPOP")
            .arg(queue)
            .arg(timeout.as_secs().max(1))
            .query_async(&mut *conn)
            .await?;
        Ok(popped.map(|(_, payload)| payload))
    }

    async fn len(&self, queue: &str) -> IndexerResult<u64> {
        let mut conn = self.conn().await?;
        let len: u64 = redis::cmd("LLEN").arg(queue).query_async(&mut *conn).await?;
        Ok(len)
    }

    async fn try_acquire_lock(&self, key: &str, ttl: Duration) -> IndexerResult<bool> {
        let mut conn = self.conn().await?;
        let reserved: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(1)
            .arg("NX")
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async(&mut *conn)
            .await?;
        Ok(reserved.is_some())
    }

    async fn release_lock(&self, key: &str) -> IndexerResult<()> {
        let mut conn = self.conn().await?;
        redis::cmd("DEL")
            .arg(key)
            .query_async::<_, ()>(&mut *conn)
            .await?;
        Ok(())
    }
}
