//! Prioritized work queues
//!
//! Two FIFO queues drive the pipeline: transaction hints and market sweeps.
//! Backends are pluggable; the Redis and in-memory implementations behave
//! identically (blocking pop with a bounded timeout, at-least-once delivery,
//! TTL'd sweep locks for per-market dedupe).

pub mod memory;
pub mod redis;

pub use memory::MemoryQueueBackend;
pub use redis::RedisQueueBackend;

use crate::error::IndexerResult;
use crate::models::{SweepJob, TxJob};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

pub const TX_QUEUE: &str = "jobs:tx";
pub const SWEEP_QUEUE: &str = "jobs:sweep";

/// Dequeues block for at most this long before returning empty
pub const POP_TIMEOUT: Duration = Duration::from_secs(2);

/// Raw FIFO + lock primitives a queue backend must provide
#[async_trait]
pub trait QueueBackend: Send + Sync {
    async fn push(&self, queue: &str, payload: String) -> IndexerResult<()>;

    /// FIFO pop, blocking up to `timeout`; `None` on timeout
    async fn pop_blocking(&self, queue: &str, timeout: Duration) -> IndexerResult<Option<String>>;

    async fn len(&self, queue: &str) -> IndexerResult<u64>;

    /// Atomically reserve `key` for `ttl`. True only when newly reserved.
    async fn try_acquire_lock(&self, key: &str, ttl: Duration) -> IndexerResult<bool>;

    async fn release_lock(&self, key: &str) -> IndexerResult<()>;
}

/// Typed facade over the two queues plus the sweep dedupe lock
pub struct JobQueues {
    backend: Arc<dyn QueueBackend>,
    sweep_dedupe_ttl: Duration,
}

impl JobQueues {
    pub fn new(backend: Arc<dyn QueueBackend>, sweep_dedupe_ttl: Duration) -> Self {
        Self {
            backend,
            sweep_dedupe_ttl,
        }
    }

    fn sweep_lock_key(market_id: Uuid) -> String {
        format!("sweep-lock:{market_id}")
    }

    pub async fn enqueue_tx(&self, job: &TxJob) -> IndexerResult<()> {
        self.backend
            .push(TX_QUEUE, serde_json::to_string(job)?)
            .await
    }

    pub async fn pop_tx(&self) -> IndexerResult<Option<TxJob>> {
        match self.backend.pop_blocking(TX_QUEUE, POP_TIMEOUT).await? {
            Some(payload) => Ok(Some(serde_json::from_str(&payload)?)),
            None => Ok(None),
        }
    }

    /// Schedule a sweep unless one is already pending for the market.
    /// Returns true only when this call reserved the dedupe lock and pushed
    /// the job; the lock is released when the sweep completes (or here, if
    /// the push itself fails).
    pub async fn enqueue_sweep(&self, market_id: Uuid) -> IndexerResult<bool> {
        let key = Self::sweep_lock_key(market_id);
        if !self
            .backend
            .try_acquire_lock(&key, self.sweep_dedupe_ttl)
            .await?
        {
            return Ok(false);
        }
        let job = SweepJob { market_id };
        if let Err(err) = self
            .backend
            .push(SWEEP_QUEUE, serde_json::to_string(&job)?)
            .await
        {
            self.backend.release_lock(&key).await?;
            return Err(err);
        }
        Ok(true)
    }

    pub async fn pop_sweep(&self) -> IndexerResult<Option<SweepJob>> {
        match self.backend.pop_blocking(SWEEP_QUEUE, POP_TIMEOUT).await? {
            Some(payload) => Ok(Some(serde_json::from_str(&payload)?)),
            None => Ok(None),
        }
    }

    pub async fn release_sweep_lock(&self, market_id: Uuid) -> IndexerResult<()> {
        self.backend
            .release_lock(&Self::sweep_lock_key(market_id))
            .await
    }

    /// Pending (tx, sweep) depths for observability
    pub async fn pending_counts(&self) -> IndexerResult<(u64, u64)> {
        let tx = self.backend.len(TX_QUEUE).await?;
        let sweep = self.backend.len(SWEEP_QUEUE).await?;
        Ok((tx, sweep))
    }
}
