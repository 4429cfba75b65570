//! Domain entities and persisted row types

use alloy_primitives::U256;
use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// All on-chain amounts and prices are 18-decimal fixed precision.
pub const SCALE: u128 = 1_000_000_000_000_000_000;

/// Market lifecycle status
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MarketStatus {
    Active,
    Resolved,
    Deleted,
    Cancelled,
}

impl fmt::Display for MarketStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MarketStatus::Active => write!(f, "active"),
            MarketStatus::Resolved => write!(f, "resolved"),
            MarketStatus::Deleted => write!(f, "deleted"),
            MarketStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl FromStr for MarketStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(MarketStatus::Active),
            "resolved" => Ok(MarketStatus::Resolved),
            "deleted" => Ok(MarketStatus::Deleted),
            "cancelled" => Ok(MarketStatus::Cancelled),
            other => Err(format!("unknown market status: {other}")),
        }
    }
}

/// A binary prediction market. Created by admin collaborators; the indexer
/// reads `{id, condition_id, fpmm_address}` to resolve logs.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Market {
    pub id: Uuid,
    pub slug: Option<String>,
    pub condition_id: Option<String>,
    pub fpmm_address: Option<String>,
    pub title: String,
    pub outcome_yes: String,
    pub outcome_no: String,
    pub status: String,
    pub category: Option<String>,
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolution_data: Option<serde_json::Value>,
}

impl Market {
    pub fn is_deleted(&self) -> bool {
        self.status == MarketStatus::Deleted.to_string()
    }

    /// Pool address lowered for partition keys and watch lists
    pub fn pool_address_lower(&self) -> Option<String> {
        self.fpmm_address.as_ref().map(|a| a.to_lowercase())
    }
}

/// Per-market indexing cursor. `last_indexed_block` only moves forward.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct MarketSync {
    pub market_id: Uuid,
    pub last_indexed_block: i64,
    pub sweeping: bool,
    pub updated_at: DateTime<Utc>,
}

/// Trade direction
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TradeSide {
    Buy,
    Sell,
}

impl fmt::Display for TradeSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TradeSide::Buy => write!(f, "buy"),
            TradeSide::Sell => write!(f, "sell"),
        }
    }
}

/// A persisted trade. Append-only, unique on `(tx_hash, log_index)`.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct TradeRow {
    pub market_id: Uuid,
    pub fpmm_address: String,
    pub tx_hash: String,
    pub log_index: i64,
    pub block_number: i64,
    pub timestamp: DateTime<Utc>,
    pub side: String,
    pub outcome: i32,
    pub amount_in_usdf: BigDecimal,
    pub price: BigDecimal,
    pub amount_out_shares: BigDecimal,
    pub fee_usdf: Option<BigDecimal>,
}

/// What moved the pool reserves
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LiquidityKind {
    Init,
    Add,
    Remove,
    Trade,
}

impl fmt::Display for LiquidityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LiquidityKind::Init => write!(f, "init"),
            LiquidityKind::Add => write!(f, "add"),
            LiquidityKind::Remove => write!(f, "remove"),
            LiquidityKind::Trade => write!(f, "trade"),
        }
    }
}

/// Post-event reserve snapshot. The latest row by
/// `(block_number desc, log_index desc)` is the authoritative reserve state.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct LiquidityEventRow {
    pub market_id: Uuid,
    pub fpmm_address: String,
    pub tx_hash: String,
    pub log_index: i64,
    pub block_number: i64,
    pub timestamp: DateTime<Utc>,
    pub kind: String,
    pub yes_reserves: BigDecimal,
    pub no_reserves: BigDecimal,
    pub tvl_usdf: BigDecimal,
    pub source: Option<String>,
}

/// One 5-minute OHLCV bucket, unique on `(market_id, bucket_start)`
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct CandleRow {
    pub market_id: Uuid,
    pub bucket_start: DateTime<Utc>,
    pub open: BigDecimal,
    pub high: BigDecimal,
    pub low: BigDecimal,
    pub close: BigDecimal,
    pub volume_usdf: BigDecimal,
}

/// Sampled `(yes, no)` price observation; `yes + no = 1` up to rounding
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct SpotPointRow {
    pub market_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub yes_price: BigDecimal,
    pub no_price: BigDecimal,
}

/// Healthz top-laggards view
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LaggingMarket {
    pub market_id: Uuid,
    pub slug: Option<String>,
    pub last_indexed_block: i64,
    pub lag_blocks: u64,
}

/// Transaction hint consumed by the on-demand indexer
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TxJob {
    pub tx_hash: String,
    pub market_id: Option<Uuid>,
}

/// Windowed replay request for one market
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SweepJob {
    pub market_id: Uuid,
}

/// Convert a fixed-18 amount to the NUMERIC(78,0) storage representation
pub fn fixed18_to_decimal(value: U256) -> BigDecimal {
    BigDecimal::from_str(&value.to_string()).unwrap_or_else(|_| BigDecimal::from(0))
}

/// Read a NUMERIC(78,0) column back into fixed-18. Negative or fractional
/// values clamp to zero; reserves and amounts are never negative on-chain.
pub fn decimal_to_fixed18(value: &BigDecimal) -> U256 {
    let normalized = value.with_scale(0);
    if normalized < BigDecimal::from(0) {
        return U256::ZERO;
    }
    U256::from_str_radix(&normalized.to_string(), 10).unwrap_or(U256::ZERO)
}

/// Display a fixed-18 value as a base-10 decimal string (the wire format)
pub fn fixed18_string(value: &BigDecimal) -> String {
    value.with_scale(0).to_string()
}
