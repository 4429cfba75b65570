//! Rate-limited RPC gateway
//!
//! Every outbound chain read passes through one shared token bucket so the
//! whole process stays inside the provider's request budget. Rate-limited
//! calls retry forever with adaptive exponential backoff; all other errors
//! propagate to the caller.

use crate::config::RpcConfig;
use crate::error::IndexerResult;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Gateway counters readable without write contention
#[derive(Debug, Clone, serde::Serialize)]
pub struct GatewayTelemetry {
    /// RPC attempts in the trailing 60 seconds
    pub qps_1m: u64,
    /// Current adaptive backoff
    pub backoff_ms: u64,
    /// Unix millis of the last rate-limit response
    pub last_429_at: Option<i64>,
}

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

pub struct RpcGateway {
    max_qps: f64,
    burst: f64,
    backoff_base: Duration,
    backoff_max: Duration,
    bucket: Mutex<Bucket>,
    attempts: Mutex<VecDeque<Instant>>,
    backoff_ms: AtomicU64,
    last_429_at: AtomicI64,
}

impl RpcGateway {
    pub fn new(config: &RpcConfig) -> Self {
        Self {
            max_qps: f64::from(config.max_qps.max(1)),
            burst: f64::from(config.burst.max(1)),
            backoff_base: Duration::from_millis(config.backoff_base_ms),
            backoff_max: Duration::from_millis(config.backoff_max_ms),
            bucket: Mutex::new(Bucket {
                tokens: f64::from(config.burst.max(1)),
                last_refill: Instant::now(),
            }),
            attempts: Mutex::new(VecDeque::new()),
            backoff_ms: AtomicU64::new(config.backoff_base_ms),
            last_429_at: AtomicI64::new(0),
        }
    }

    /// Run `op` under the limiter. Retries forever on rate-limit errors,
    /// sleeping the current backoff and doubling it up to the cap; any other
    /// error propagates. A success resets the backoff to its base.
    pub async fn with_limit<T, F, Fut>(&self, label: &str, op: F) -> IndexerResult<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = IndexerResult<T>>,
    {
        loop {
            self.acquire().await;
            self.record_attempt().await;
            match op().await {
                Ok(value) => {
                    self.backoff_ms
                        .store(self.backoff_base.as_millis() as u64, Ordering::Relaxed);
                    return Ok(value);
                }
                Err(err) if err.is_rate_limited() => {
                    let backoff = self.backoff_ms.load(Ordering::Relaxed);
                    self.last_429_at
                        .store(chrono::Utc::now().timestamp_millis(), Ordering::Relaxed);
                    warn!(label, backoff_ms = backoff, "rpc rate limited, backing off");
                    tokio::time::sleep(Duration::from_millis(backoff)).await;
                    let next = (backoff * 2).min(self.backoff_max.as_millis() as u64);
                    self.backoff_ms.store(next, Ordering::Relaxed);
                }
                Err(err) => {
                    debug!(label, error = %err, "rpc call failed");
                    return Err(err);
                }
            }
        }
    }

    pub fn telemetry_sync(&self) -> (u64, Option<i64>) {
        let backoff = self.backoff_ms.load(Ordering::Relaxed);
        let last = self.last_429_at.load(Ordering::Relaxed);
        (backoff, (last != 0).then_some(last))
    }

    pub async fn telemetry(&self) -> GatewayTelemetry {
        let cutoff = Instant::now() - Duration::from_secs(60);
        let qps_1m = {
            let mut attempts = self.attempts.lock().await;
            while attempts.front().is_some_and(|t| *t < cutoff) {
                attempts.pop_front();
            }
            attempts.len() as u64
        };
        let (backoff_ms, last_429_at) = self.telemetry_sync();
        GatewayTelemetry {
            qps_1m,
            backoff_ms,
            last_429_at,
        }
    }

    /// Block until a token is available
    async fn acquire(&self) {
        let quantum =
            Duration::from_millis(((1000.0 / self.max_qps) as u64).max(50));
        loop {
            {
                let mut bucket = self.bucket.lock().await;
                let elapsed = bucket.last_refill.elapsed().as_secs_f64();
                bucket.tokens = (bucket.tokens + elapsed * self.max_qps).min(self.burst);
                bucket.last_refill = Instant::now();
                if bucket.tokens >= 1.0 {
                    bucket.tokens -= 1.0;
                    return;
                }
            }
            tokio::time::sleep(quantum).await;
        }
    }

    async fn record_attempt(&self) {
        let now = Instant::now();
        let cutoff = now - Duration::from_secs(60);
        let mut attempts = self.attempts.lock().await;
        while attempts.front().is_some_and(|t| *t < cutoff) {
            attempts.pop_front();
        }
        attempts.push_back(now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{IndexerError, NetworkError};
    use std::sync::atomic::AtomicU32;

    fn test_config(max_qps: u32, burst: u32) -> RpcConfig {
        RpcConfig {
            max_qps,
            burst,
            backoff_base_ms: 300,
            backoff_max_ms: 5000,
            ..RpcConfig::default()
        }
    }

    fn rate_limit_error() -> IndexerError {
        IndexerError::Network(NetworkError::Rpc {
            code: -32005,
            message: "rate limit exceeded".to_string(),
        })
    }

    #[tokio::test(start_paused = true)]
    async fn two_rate_limits_sleep_base_then_doubled() {
        let gateway = RpcGateway::new(&test_config(100, 100));
        let calls = AtomicU32::new(0);

        let start = Instant::now();
        let result = gateway
            .with_limit("getBlockNumber", || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(rate_limit_error())
                    } else {
                        Ok(42u64)
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(result, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // First retry sleeps the 300ms base, second sleeps the doubled 600ms
        assert!(start.elapsed() >= Duration::from_millis(900));

        let telemetry = gateway.telemetry().await;
        assert_eq!(telemetry.qps_1m, 3);
        assert!(telemetry.last_429_at.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn success_resets_backoff_to_base() {
        let gateway = RpcGateway::new(&test_config(100, 100));
        let calls = AtomicU32::new(0);

        gateway
            .with_limit("getLogs", || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 0 {
                        Err(rate_limit_error())
                    } else {
                        Ok(())
                    }
                }
            })
            .await
            .unwrap();

        let telemetry = gateway.telemetry().await;
        assert_eq!(telemetry.backoff_ms, 300);
    }

    #[tokio::test(start_paused = true)]
    async fn attempts_stay_within_bucket_budget() {
        let gateway = RpcGateway::new(&test_config(2, 2));
        let start = Instant::now();

        for _ in 0..10 {
            gateway
                .with_limit("getBlockNumber", || async { Ok::<(), IndexerError>(()) })
                .await
                .unwrap();
        }

        // 2 burst tokens, then 8 more refilled at 2/s: at least ~4s of
        // virtual time must pass, i.e. attempts <= burst + qps * elapsed.
        assert!(start.elapsed() >= Duration::from_secs(3));
        assert_eq!(gateway.telemetry().await.qps_1m, 10);
    }

    #[tokio::test]
    async fn non_rate_limit_errors_propagate() {
        let gateway = RpcGateway::new(&test_config(100, 100));
        let result: IndexerResult<()> = gateway
            .with_limit("getLogs", || async {
                Err(IndexerError::Network(NetworkError::ConnectionFailed(
                    "connection refused".to_string(),
                )))
            })
            .await;
        assert!(result.is_err());
    }
}
