//! Persistence layer
//!
//! One `Store` trait, two backends: PostgreSQL for production and an
//! in-memory twin with the same observable semantics for tests and offline
//! development. Writes are idempotent on their documented unique keys;
//! duplicate delivery is silently dropped by design.

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PostgresStore;

use crate::error::IndexerResult;
use crate::models::{
    CandleRow, LaggingMarket, LiquidityEventRow, Market, MarketSync, SpotPointRow, TradeRow,
};
use alloy_primitives::U256;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Append-only, idempotent storage surface for indexed market state
#[async_trait]
pub trait Store: Send + Sync {
    // Market registry (written by admin collaborators, read by the indexer)

    async fn insert_market(&self, market: &Market) -> IndexerResult<()>;

    /// Resolve by id or slug (slug match is case-insensitive). Soft-deleted
    /// markets resolve too; read paths filter them.
    async fn find_market_by_key(&self, key: &str) -> IndexerResult<Option<Market>>;

    /// Resolve by pool address, case-insensitive
    async fn find_market_by_pool(&self, pool: &str) -> IndexerResult<Option<Market>>;

    async fn list_markets(&self, limit: i64, offset: i64) -> IndexerResult<Vec<Market>>;

    /// Lowercased pool addresses of every non-deleted market with a pool
    async fn list_pool_addresses(&self) -> IndexerResult<Vec<(Uuid, String)>>;

    // Event history (unique on (tx_hash, log_index); conflict = no-op)

    /// Returns false when the row already existed
    async fn insert_trade(&self, row: &TradeRow) -> IndexerResult<bool>;

    /// Returns false when the row already existed
    async fn insert_liquidity_event(&self, row: &LiquidityEventRow) -> IndexerResult<bool>;

    /// Merge rule on collision: high=max, low=min, close=new, volume+=new,
    /// open immutable
    async fn upsert_candle(&self, row: &CandleRow) -> IndexerResult<()>;

    /// Conflict on (market_id, timestamp) is a no-op
    async fn upsert_spot_point(&self, row: &SpotPointRow) -> IndexerResult<()>;

    /// Commit every row one applied event derives — liquidity snapshot plus
    /// the optional trade, candle, and spot sample — as a single atomic
    /// write. Either all rows land or none do, so a trade can never go
    /// missing behind a committed liquidity snapshot. Returns false (and
    /// writes nothing) when the event was already applied, i.e. the
    /// liquidity row's `(tx_hash, log_index)` key exists.
    async fn apply_event(
        &self,
        liquidity: &LiquidityEventRow,
        trade: Option<&TradeRow>,
        candle: Option<&CandleRow>,
        spot: Option<&SpotPointRow>,
    ) -> IndexerResult<bool>;

    // Sync cursor (monotonic non-decreasing)

    /// Create the cursor row at `baseline` when absent
    async fn ensure_market_sync(&self, market_id: Uuid, baseline: u64)
        -> IndexerResult<MarketSync>;

    async fn get_market_sync(&self, market_id: Uuid) -> IndexerResult<Option<MarketSync>>;

    /// `last_indexed_block = GREATEST(existing, block)`; never regresses
    async fn advance_market_sync(
        &self,
        market_id: Uuid,
        block: u64,
        sweeping: bool,
    ) -> IndexerResult<()>;

    /// Bootstrap-only rewind/positioning of a fresh cursor
    async fn set_market_sync_block(&self, market_id: Uuid, block: u64) -> IndexerResult<()>;

    // Read queries

    /// Latest reserves from the liquidity history, `(0, 0)` when empty
    async fn load_pool_reserves(&self, market_id: Uuid) -> IndexerResult<(U256, U256)>;

    async fn latest_liquidity_event(
        &self,
        market_id: Uuid,
    ) -> IndexerResult<Option<LiquidityEventRow>>;

    async fn volume_24h(&self, market_id: Uuid, now: DateTime<Utc>) -> IndexerResult<U256>;

    async fn last_trade(&self, market_id: Uuid) -> IndexerResult<Option<TradeRow>>;

    async fn first_trade_block(&self, market_id: Uuid) -> IndexerResult<Option<u64>>;

    async fn trades_page(
        &self,
        market_id: Uuid,
        limit: i64,
        before: Option<DateTime<Utc>>,
    ) -> IndexerResult<Vec<TradeRow>>;

    async fn candles_page(&self, market_id: Uuid, limit: i64) -> IndexerResult<Vec<CandleRow>>;

    async fn spot_series_page(
        &self,
        market_id: Uuid,
        limit: i64,
    ) -> IndexerResult<Vec<SpotPointRow>>;

    /// Markets furthest behind `head`, for the health endpoint
    async fn lagging_markets(&self, head: u64, limit: i64) -> IndexerResult<Vec<LaggingMarket>>;

    async fn health_check(&self) -> IndexerResult<()>;
}
