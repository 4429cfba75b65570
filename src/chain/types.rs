//! EVM JSON-RPC wire types
//!
//! Hand-rolled (de)serialization for the handful of shapes the indexer
//! actually reads. Quantities arrive as 0x-prefixed hex strings.

use alloy_primitives::{Address, Bytes, B256};
use serde::{Deserialize, Serialize};

/// Serde adapter for hex-encoded u64 quantities ("0x10" <-> 16)
pub mod hex_u64 {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &u64, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format!("{value:#x}"))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
        let raw = String::deserialize(deserializer)?;
        let digits = raw.trim_start_matches("0x");
        u64::from_str_radix(digits, 16).map_err(serde::de::Error::custom)
    }
}

/// One event log as returned by `eth_getLogs` / push subscriptions
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    pub address: Address,
    pub topics: Vec<B256>,
    pub data: Bytes,
    #[serde(with = "hex_u64")]
    pub block_number: u64,
    pub block_hash: B256,
    pub transaction_hash: B256,
    #[serde(with = "hex_u64")]
    pub log_index: u64,
    #[serde(default)]
    pub removed: bool,
}

/// The subset of a transaction receipt the indexer consumes
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionReceipt {
    pub transaction_hash: B256,
    pub block_hash: B256,
    #[serde(with = "hex_u64")]
    pub block_number: u64,
    #[serde(default)]
    pub logs: Vec<LogEntry>,
    pub status: Option<String>,
}

/// Header fields for block-timestamp resolution
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockHeader {
    pub hash: B256,
    #[serde(with = "hex_u64")]
    pub number: u64,
    #[serde(with = "hex_u64")]
    pub timestamp: u64,
}

/// `eth_getLogs` filter. Either a block range or a single block hash.
#[derive(Debug, Clone, Serialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct LogFilter {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from_block: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to_block: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub block_hash: Option<B256>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<Vec<Address>>,
}

impl LogFilter {
    /// Filter over an inclusive block range for a set of pool addresses
    pub fn range(from: u64, to: u64, address: Vec<Address>) -> Self {
        Self {
            from_block: Some(format!("{from:#x}")),
            to_block: Some(format!("{to:#x}")),
            block_hash: None,
            address: if address.is_empty() {
                None
            } else {
                Some(address)
            },
        }
    }

    /// Every log of a single block
    pub fn block(hash: B256) -> Self {
        Self {
            block_hash: Some(hash),
            ..Self::default()
        }
    }
}
