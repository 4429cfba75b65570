//! In-process chain backend for tests and offline development
//!
//! Holds canned blocks, receipts, and logs behind the same `ChainReader`
//! surface the real client implements. Receipts can be delayed by a number
//! of lookups to exercise the indexer's poll-and-retry path.

use super::types::{BlockHeader, LogEntry, LogFilter, TransactionReceipt};
use super::ChainReader;
use crate::error::{IndexerError, IndexerResult, NetworkError};
use alloy_primitives::{Address, B256, U256};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

#[derive(Default)]
struct MockState {
    headers: HashMap<B256, BlockHeader>,
    receipts: HashMap<String, TransactionReceipt>,
    /// Receipts withheld for the first N lookups (chain lag simulation)
    receipt_delays: HashMap<String, u32>,
    logs: Vec<LogEntry>,
    reserves: HashMap<Address, (U256, U256)>,
    deployed: HashMap<Address, bool>,
}

pub struct MockChain {
    head: AtomicU64,
    state: Mutex<MockState>,
}

impl Default for MockChain {
    fn default() -> Self {
        Self::new(0)
    }
}

impl MockChain {
    pub fn new(head: u64) -> Self {
        Self {
            head: AtomicU64::new(head),
            state: Mutex::new(MockState::default()),
        }
    }

    pub fn set_head(&self, head: u64) {
        self.head.store(head, Ordering::SeqCst);
    }

    /// Register a block header so timestamp lookups resolve
    pub fn add_block(&self, hash: B256, number: u64, timestamp: u64) {
        let mut state = self.state.lock().unwrap();
        state.headers.insert(
            hash,
            BlockHeader {
                hash,
                number,
                timestamp,
            },
        );
    }

    /// Register a mined transaction and its block's logs
    pub fn add_transaction(&self, tx_hash: &str, block_hash: B256, block_number: u64, logs: Vec<LogEntry>) {
        let mut state = self.state.lock().unwrap();
        state.receipts.insert(
            tx_hash.to_string(),
            TransactionReceipt {
                transaction_hash: tx_hash.parse().unwrap_or(B256::ZERO),
                block_hash,
                block_number,
                logs: Vec::new(),
                status: Some("0x1".to_string()),
            },
        );
        state.logs.extend(logs);
    }

    /// Withhold the receipt for the first `lookups` queries
    pub fn delay_receipt(&self, tx_hash: &str, lookups: u32) {
        let mut state = self.state.lock().unwrap();
        state.receipt_delays.insert(tx_hash.to_string(), lookups);
    }

    pub fn set_reserves(&self, pool: Address, yes: U256, no: U256) {
        let mut state = self.state.lock().unwrap();
        state.reserves.insert(pool, (yes, no));
    }

    pub fn set_deployed(&self, address: Address, deployed: bool) {
        let mut state = self.state.lock().unwrap();
        state.deployed.insert(address, deployed);
    }
}

#[async_trait]
impl ChainReader for MockChain {
    async fn block_number(&self) -> IndexerResult<u64> {
        Ok(self.head.load(Ordering::SeqCst))
    }

    async fn block_header_by_hash(&self, hash: B256) -> IndexerResult<Option<BlockHeader>> {
        let state = self.state.lock().unwrap();
        Ok(state.headers.get(&hash).cloned())
    }

    async fn transaction_receipt(
        &self,
        tx_hash: &str,
    ) -> IndexerResult<Option<TransactionReceipt>> {
        let mut state = self.state.lock().unwrap();
        if let Some(remaining) = state.receipt_delays.get_mut(tx_hash) {
            if *remaining > 0 {
                *remaining -= 1;
                return Ok(None);
            }
        }
        Ok(state.receipts.get(tx_hash).cloned())
    }

    async fn logs(&self, filter: &LogFilter) -> IndexerResult<Vec<LogEntry>> {
        let state = self.state.lock().unwrap();
        let matches = state
            .logs
            .iter()
            .filter(|log| {
                if let Some(hash) = filter.block_hash {
                    return log.block_hash == hash;
                }
                let from = filter
                    .from_block
                    .as_deref()
                    .and_then(|s| u64::from_str_radix(s.trim_start_matches("0x"), 16).ok())
                    .unwrap_or(0);
                let to = filter
                    .to_block
                    .as_deref()
                    .and_then(|s| u64::from_str_radix(s.trim_start_matches("0x"), 16).ok())
                    .unwrap_or(u64::MAX);
                if log.block_number < from || log.block_number > to {
                    return false;
                }
                match &filter.address {
                    Some(addresses) => addresses.contains(&log.address),
                    None => true,
                }
            })
            .cloned()
            .collect();
        Ok(matches)
    }

    async fn pool_reserves(&self, pool: Address) -> IndexerResult<(U256, U256)> {
        let state = self.state.lock().unwrap();
        state.reserves.get(&pool).copied().ok_or_else(|| {
            IndexerError::Network(NetworkError::Rpc {
                code: 3,
                message: "execution reverted".to_string(),
            })
        })
    }

    async fn code_exists(&self, address: Address) -> IndexerResult<bool> {
        let state = self.state.lock().unwrap();
        Ok(*state.deployed.get(&address).unwrap_or(&false))
    }
}
