//! Chain access layer
//!
//! The gateway owns the request budget, the client speaks JSON-RPC, the
//! decoder turns raw logs into typed AMM events. Components depend on the
//! `ChainReader` trait so tests can swap in the mock backend.

pub mod client;
pub mod events;
pub mod gateway;
pub mod types;

#[cfg(any(test, feature = "mock-chain"))]
pub mod mock;

pub use client::ChainClient;
pub use gateway::{GatewayTelemetry, RpcGateway};

use crate::error::IndexerResult;
use alloy_primitives::{Address, B256, U256};
use async_trait::async_trait;
use types::{BlockHeader, LogEntry, LogFilter, TransactionReceipt};

/// Every chain read the pipeline performs
#[async_trait]
pub trait ChainReader: Send + Sync {
    /// Current head block number
    async fn block_number(&self) -> IndexerResult<u64>;

    /// Header lookup for block-timestamp resolution
    async fn block_header_by_hash(&self, hash: B256) -> IndexerResult<Option<BlockHeader>>;

    /// Receipt lookup; `None` while the transaction is still pending
    async fn transaction_receipt(&self, tx_hash: &str)
        -> IndexerResult<Option<TransactionReceipt>>;

    /// Log scan by range or block hash
    async fn logs(&self, filter: &LogFilter) -> IndexerResult<Vec<LogEntry>>;

    /// Direct reserve probe against a pool contract
    async fn pool_reserves(&self, pool: Address) -> IndexerResult<(U256, U256)>;

    /// Whether any bytecode is deployed at the address
    async fn code_exists(&self, address: Address) -> IndexerResult<bool>;
}
