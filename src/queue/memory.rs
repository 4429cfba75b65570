//! In-process queue backend
//!
//! VecDeque FIFOs with a notify-based blocking pop and deadline-expiring
//! locks. Semantics match the Redis backend so the two are interchangeable.

use super::QueueBackend;
use crate::error::IndexerResult;
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

#[derive(Default)]
struct Inner {
    queues: HashMap<String, VecDeque<String>>,
    locks: HashMap<String, Instant>,
}

#[derive(Default)]
pub struct MemoryQueueBackend {
    inner: Mutex<Inner>,
    notify: Notify,
}

impl MemoryQueueBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn try_pop(&self, queue: &str) -> Option<String> {
        let mut inner = self.inner.lock().unwrap();
        inner.queues.get_mut(queue).and_then(|q| q.pop_front())
    }
}

#[async_trait]
impl QueueBackend for MemoryQueueBackend {
    async fn push(&self, queue: &str, payload: String) -> IndexerResult<()> {
        {
            let mut inner = self.inner.lock().unwrap();
            inner
                .queues
                .entry(queue.to_string())
                .or_default()
                .push_back(payload);
        }
        self.notify.notify_waiters();
        Ok(())
    }

    async fn pop_blocking(&self, queue: &str, timeout: Duration) -> IndexerResult<Option<String>> {
        let deadline = Instant::now() + timeout;
        loop {
            // Register interest before checking, so a push between the check
            // and the wait still wakes this task.
            let notified = self.notify.notified();
            if let Some(payload) = self.try_pop(queue) {
                return Ok(Some(payload));
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            let _ = tokio::time::timeout(remaining, notified).await;
            if Instant::now() >= deadline {
                return Ok(self.try_pop(queue));
            }
        }
    }

    async fn len(&self, queue: &str) -> IndexerResult<u64> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.queues.get(queue).map_or(0, |q| q.len() as u64))
    }

    async fn try_acquire_lock(&self, key: &str, ttl: Duration) -> IndexerResult<bool> {
        let mut inner = self.inner.lock().unwrap();
        let now = Instant::now();
        // A lock past its deadline counts as released
        if let Some(deadline) = inner.locks.get(key) {
            if *deadline > now {
                return Ok(false);
            }
        }
        inner.locks.insert(key.to_string(), now + ttl);
        Ok(true)
    }

    async fn release_lock(&self, key: &str) -> IndexerResult<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.locks.remove(key);
        Ok(())
    }
}
