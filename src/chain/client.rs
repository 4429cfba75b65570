//! Typed EVM JSON-RPC client
//!
//! Implements only the methods the indexer needs, each wrapped in the shared
//! rate-limit gateway. A configured fallback endpoint is tried when the
//! primary refuses the connection.

use super::gateway::RpcGateway;
use super::types::{BlockHeader, LogEntry, LogFilter, TransactionReceipt};
use super::ChainReader;
use crate::config::RpcConfig;
use crate::error::{IndexerError, IndexerResult, NetworkError};
use alloy_primitives::{keccak256, Address, B256, U256};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// RPC response envelope
#[derive(Debug, Deserialize)]
struct RpcResponse<T> {
    result: Option<T>,
    error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
struct RpcError {
    code: i64,
    message: String,
}

pub struct ChainClient {
    http: reqwest::Client,
    url: String,
    fallback_url: Option<String>,
    gateway: Arc<RpcGateway>,
    next_id: AtomicU64,
}

impl ChainClient {
    pub fn new(config: &RpcConfig, gateway: Arc<RpcGateway>) -> IndexerResult<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            http,
            url: config.http_url.clone(),
            fallback_url: config.fallback_http_url.clone(),
            gateway,
            next_id: AtomicU64::new(1),
        })
    }

    /// Make a JSON-RPC call against the primary endpoint, falling back to
    /// the secondary when the primary is unreachable.
    async fn call<T>(&self, method: &str, params: Value) -> IndexerResult<T>
    where
        T: for<'de> Deserialize<'de>,
    {
        match self.call_endpoint(&self.url, method, params.clone()).await {
            Err(IndexerError::Network(NetworkError::ConnectionFailed(primary_err))) => {
                if let Some(fallback) = &self.fallback_url {
                    debug!(method, error = %primary_err, "primary rpc unreachable, trying fallback");
                    self.call_endpoint(fallback, method, params).await
                } else {
                    Err(IndexerError::Network(NetworkError::ConnectionFailed(
                        primary_err,
                    )))
                }
            }
            other => other,
        }
    }

    async fn call_endpoint<T>(&self, url: &str, method: &str, params: Value) -> IndexerResult<T>
    where
        T: for<'de> Deserialize<'de>,
    {
        let body = json!({
            "jsonrpc": "2.0",
            "id": self.next_id.fetch_add(1, Ordering::Relaxed),
            "method": method,
            "params": params,
        });

        debug!(method, "rpc call");
        let response = self.http.post(url).json(&body).send().await?;
        let status = response.status();
        if status.as_u16() == 429 {
            return Err(IndexerError::Network(NetworkError::Rpc {
                code: 429,
                message: "429 too many requests".to_string(),
            }));
        }
        let envelope: RpcResponse<T> = response.json().await?;

        if let Some(error) = envelope.error {
            return Err(IndexerError::Network(NetworkError::Rpc {
                code: error.code,
                message: error.message,
            }));
        }
        envelope.result.ok_or_else(|| {
            IndexerError::Network(NetworkError::Rpc {
                code: 0,
                message: format!("no result in {method} response (status {status})"),
            })
        })
    }
}

/// 4-byte selector of the pool's reserve view, used by the summary
/// assembler's on-chain probe.
fn pool_balances_selector() -> [u8; 4] {
    let hash = keccak256(b"getPoolBalances()");
    [hash[0], hash[1], hash[2], hash[3]]
}

fn parse_quantity(raw: &str) -> IndexerResult<u64> {
    u64::from_str_radix(raw.trim_start_matches("0x"), 16)
        .map_err(|e| IndexerError::Decode(format!("bad quantity {raw}: {e}")))
}

#[async_trait]
impl ChainReader for ChainClient {
    async fn block_number(&self) -> IndexerResult<u64> {
        let raw: String = self
            .gateway
            .with_limit("getBlockNumber", || {
                self.call("eth_blockNumber", json!([]))
            })
            .await?;
        parse_quantity(&raw)
    }

    async fn block_header_by_hash(&self, hash: B256) -> IndexerResult<Option<BlockHeader>> {
        self.gateway
            .with_limit("getBlock", || {
                self.call("eth_getBlockByHash", json!([hash, false]))
            })
            .await
    }

    async fn transaction_receipt(&self, tx_hash: &str) -> IndexerResult<Option<TransactionReceipt>> {
        self.gateway
            .with_limit("getTransactionReceipt", || {
                self.call("eth_getTransactionReceipt", json!([tx_hash]))
            })
            .await
    }

    async fn logs(&self, filter: &LogFilter) -> IndexerResult<Vec<LogEntry>> {
        self.gateway
            .with_limit("getLogs", || self.call("eth_getLogs", json!([filter])))
            .await
    }

    async fn pool_reserves(&self, pool: Address) -> IndexerResult<(U256, U256)> {
        let data = format!("0x{}", alloy_primitives::hex::encode(pool_balances_selector()));
        let raw: String = self
            .gateway
            .with_limit("probeReserves", || {
                self.call(
                    "eth_call",
                    json!([{ "to": pool, "data": data }, "latest"]),
                )
            })
            .await?;

        let bytes = alloy_primitives::hex::decode(raw.trim_start_matches("0x"))
            .map_err(|e| IndexerError::Decode(format!("bad eth_call return: {e}")))?;
        if bytes.len() < 64 {
            return Err(IndexerError::Decode(format!(
                "reserve probe returned {} bytes, expected 64",
                bytes.len()
            )));
        }
        let yes = U256::from_be_slice(&bytes[0..32]);
        let no = U256::from_be_slice(&bytes[32..64]);
        Ok((yes, no))
    }

    async fn code_exists(&self, address: Address) -> IndexerResult<bool> {
        let raw: String = self
            .gateway
            .with_limit("getCode", || {
                self.call("eth_getCode", json!([address, "latest"]))
            })
            .await?;
        Ok(!raw.trim_start_matches("0x").is_empty())
    }
}
