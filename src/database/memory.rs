//! In-memory store
//!
//! Mirrors the PostgreSQL backend's observable semantics (unique keys,
//! candle merge, monotonic cursor) over BTree maps. Used by the test suite
//! and for offline development; writes can be made to fail on demand to
//! exercise the pipeline's storage-recovery paths.

use super::Store;
use crate::error::{IndexerError, IndexerResult, StorageError};
use crate::models::{
    decimal_to_fixed18, fixed18_to_decimal, CandleRow, LaggingMarket, LiquidityEventRow, Market,
    MarketSync, SpotPointRow, TradeRow,
};
use alloy_primitives::U256;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use uuid::Uuid;

#[derive(Default)]
struct Inner {
    markets: HashMap<Uuid, Market>,
    syncs: HashMap<Uuid, MarketSync>,
    trades: BTreeMap<(String, i64), TradeRow>,
    liquidity: BTreeMap<(String, i64), LiquidityEventRow>,
    candles: BTreeMap<(Uuid, DateTime<Utc>), CandleRow>,
    spots: BTreeMap<(Uuid, DateTime<Utc>), SpotPointRow>,
}

impl Inner {
    fn insert_trade(&mut self, row: &TradeRow) -> bool {
        let key = (row.tx_hash.clone(), row.log_index);
        if self.trades.contains_key(&key) {
            return false;
        }
        self.trades.insert(key, row.clone());
        true
    }

    fn insert_liquidity_event(&mut self, row: &LiquidityEventRow) -> bool {
        let key = (row.tx_hash.clone(), row.log_index);
        if self.liquidity.contains_key(&key) {
            return false;
        }
        self.liquidity.insert(key, row.clone());
        true
    }

    fn upsert_candle(&mut self, row: &CandleRow) {
        let key = (row.market_id, row.bucket_start);
        match self.candles.get_mut(&key) {
            Some(existing) => {
                if row.high > existing.high {
                    existing.high = row.high.clone();
                }
                if row.low < existing.low {
                    existing.low = row.low.clone();
                }
                existing.close = row.close.clone();
                existing.volume_usdf = &existing.volume_usdf + &row.volume_usdf;
            }
            None => {
                self.candles.insert(key, row.clone());
            }
        }
    }

    fn upsert_spot_point(&mut self, row: &SpotPointRow) {
        let key = (row.market_id, row.timestamp);
        self.spots.entry(key).or_insert_with(|| row.clone());
    }
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
    fail_writes: AtomicBool,
    volume_delay: Mutex<Option<std::time::Duration>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every write fail until reset; simulates database unavailability
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn write_guard(&self) -> IndexerResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(IndexerError::Storage(StorageError::Database(
                "storage unavailable".to_string(),
            )));
        }
        Ok(())
    }

    /// Slow down the 24h-volume read; simulates one query blowing its budget
    pub fn set_volume_delay(&self, delay: Option<std::time::Duration>) {
        *self.volume_delay.lock().unwrap() = delay;
    }

    /// Row counts for test assertions: (trades, liquidity, candles, spots)
    pub fn row_counts(&self) -> (usize, usize, usize, usize) {
        let inner = self.inner.lock().unwrap();
        (
            inner.trades.len(),
            inner.liquidity.len(),
            inner.candles.len(),
            inner.spots.len(),
        )
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn insert_market(&self, market: &Market) -> IndexerResult<()> {
        self.write_guard()?;
        let mut inner = self.inner.lock().unwrap();
        inner.markets.insert(market.id, market.clone());
        Ok(())
    }

    async fn find_market_by_key(&self, key: &str) -> IndexerResult<Option<Market>> {
        let inner = self.inner.lock().unwrap();
        if let Ok(id) = key.parse::<Uuid>() {
            return Ok(inner.markets.get(&id).cloned());
        }
        let wanted = key.to_lowercase();
        Ok(inner
            .markets
            .values()
            .find(|m| m.slug.as_deref().is_some_and(|s| s.to_lowercase() == wanted))
            .cloned())
    }

    async fn find_market_by_pool(&self, pool: &str) -> IndexerResult<Option<Market>> {
        let inner = self.inner.lock().unwrap();
        let wanted = pool.to_lowercase();
        Ok(inner
            .markets
            .values()
            .find(|m| m.pool_address_lower().is_some_and(|a| a == wanted))
            .cloned())
    }

    async fn list_markets(&self, limit: i64, offset: i64) -> IndexerResult<Vec<Market>> {
        let inner = self.inner.lock().unwrap();
        let mut markets: Vec<Market> = inner
            .markets
            .values()
            .filter(|m| !m.is_deleted())
            .cloned()
            .collect();
        markets.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(markets
            .into_iter()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .collect())
    }

    async fn list_pool_addresses(&self) -> IndexerResult<Vec<(Uuid, String)>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .markets
            .values()
            .filter(|m| !m.is_deleted())
            .filter_map(|m| m.pool_address_lower().map(|a| (m.id, a)))
            .collect())
    }

    async fn insert_trade(&self, row: &TradeRow) -> IndexerResult<bool> {
        self.write_guard()?;
        Ok(self.inner.lock().unwrap().insert_trade(row))
    }

    async fn insert_liquidity_event(&self, row: &LiquidityEventRow) -> IndexerResult<bool> {
        self.write_guard()?;
        Ok(self.inner.lock().unwrap().insert_liquidity_event(row))
    }

    async fn upsert_candle(&self, row: &CandleRow) -> IndexerResult<()> {
        self.write_guard()?;
        self.inner.lock().unwrap().upsert_candle(row);
        Ok(())
    }

    async fn upsert_spot_point(&self, row: &SpotPointRow) -> IndexerResult<()> {
        self.write_guard()?;
        self.inner.lock().unwrap().upsert_spot_point(row);
        Ok(())
    }

    async fn apply_event(
        &self,
        liquidity: &LiquidityEventRow,
        trade: Option<&TradeRow>,
        candle: Option<&CandleRow>,
        spot: Option<&SpotPointRow>,
    ) -> IndexerResult<bool> {
        self.write_guard()?;
        // One lock scope for the whole row group keeps it all-or-nothing,
        // matching the Postgres transaction.
        let mut inner = self.inner.lock().unwrap();
        if !inner.insert_liquidity_event(liquidity) {
            return Ok(false);
        }
        if let Some(trade) = trade {
            inner.insert_trade(trade);
        }
        if let Some(candle) = candle {
            inner.upsert_candle(candle);
        }
        if let Some(spot) = spot {
            inner.upsert_spot_point(spot);
        }
        Ok(true)
    }

    async fn ensure_market_sync(
        &self,
        market_id: Uuid,
        baseline: u64,
    ) -> IndexerResult<MarketSync> {
        self.write_guard()?;
        let mut inner = self.inner.lock().unwrap();
        let sync = inner.syncs.entry(market_id).or_insert_with(|| MarketSync {
            market_id,
            last_indexed_block: baseline as i64,
            sweeping: false,
            updated_at: Utc::now(),
        });
        Ok(sync.clone())
    }

    async fn get_market_sync(&self, market_id: Uuid) -> IndexerResult<Option<MarketSync>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.syncs.get(&market_id).cloned())
    }

    async fn advance_market_sync(
        &self,
        market_id: Uuid,
        block: u64,
        sweeping: bool,
    ) -> IndexerResult<()> {
        self.write_guard()?;
        let mut inner = self.inner.lock().unwrap();
        let sync = inner.syncs.entry(market_id).or_insert_with(|| MarketSync {
            market_id,
            last_indexed_block: 0,
            sweeping: false,
            updated_at: Utc::now(),
        });
        sync.last_indexed_block = sync.last_indexed_block.max(block as i64);
        sync.sweeping = sweeping;
        sync.updated_at = Utc::now();
        Ok(())
    }

    async fn set_market_sync_block(&self, market_id: Uuid, block: u64) -> IndexerResult<()> {
        self.write_guard()?;
        let mut inner = self.inner.lock().unwrap();
        if let Some(sync) = inner.syncs.get_mut(&market_id) {
            sync.last_indexed_block = block as i64;
            sync.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn load_pool_reserves(&self, market_id: Uuid) -> IndexerResult<(U256, U256)> {
        match self.latest_liquidity_event(market_id).await? {
            Some(event) => Ok((
                decimal_to_fixed18(&event.yes_reserves),
                decimal_to_fixed18(&event.no_reserves),
            )),
            None => Ok((U256::ZERO, U256::ZERO)),
        }
    }

    async fn latest_liquidity_event(
        &self,
        market_id: Uuid,
    ) -> IndexerResult<Option<LiquidityEventRow>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .liquidity
            .values()
            .filter(|e| e.market_id == market_id)
            .max_by_key(|e| (e.block_number, e.log_index))
            .cloned())
    }

    async fn volume_24h(&self, market_id: Uuid, now: DateTime<Utc>) -> IndexerResult<U256> {
        let delay = *self.volume_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let inner = self.inner.lock().unwrap();
        let cutoff = now - Duration::hours(24);
        let mut total = U256::ZERO;
        for trade in inner.trades.values() {
            if trade.market_id == market_id && trade.timestamp > cutoff {
                total = total.saturating_add(decimal_to_fixed18(&trade.amount_in_usdf));
            }
        }
        Ok(total)
    }

    async fn last_trade(&self, market_id: Uuid) -> IndexerResult<Option<TradeRow>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .trades
            .values()
            .filter(|t| t.market_id == market_id)
            .max_by_key(|t| (t.block_number, t.log_index))
            .cloned())
    }

    async fn first_trade_block(&self, market_id: Uuid) -> IndexerResult<Option<u64>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .trades
            .values()
            .filter(|t| t.market_id == market_id)
            .map(|t| t.block_number.max(0) as u64)
            .min())
    }

    async fn trades_page(
        &self,
        market_id: Uuid,
        limit: i64,
        before: Option<DateTime<Utc>>,
    ) -> IndexerResult<Vec<TradeRow>> {
        let inner = self.inner.lock().unwrap();
        let mut trades: Vec<TradeRow> = inner
            .trades
            .values()
            .filter(|t| t.market_id == market_id)
            .filter(|t| before.map_or(true, |b| t.timestamp < b))
            .cloned()
            .collect();
        trades.sort_by(|a, b| {
            (b.timestamp, b.log_index).cmp(&(a.timestamp, a.log_index))
        });
        trades.truncate(limit.max(0) as usize);
        Ok(trades)
    }

    async fn candles_page(&self, market_id: Uuid, limit: i64) -> IndexerResult<Vec<CandleRow>> {
        let inner = self.inner.lock().unwrap();
        let mut candles: Vec<CandleRow> = inner
            .candles
            .values()
            .filter(|c| c.market_id == market_id)
            .cloned()
            .collect();
        candles.sort_by_key(|c| c.bucket_start);
        if candles.len() > limit.max(0) as usize {
            let skip = candles.len() - limit.max(0) as usize;
            candles.drain(..skip);
        }
        Ok(candles)
    }

    async fn spot_series_page(
        &self,
        market_id: Uuid,
        limit: i64,
    ) -> IndexerResult<Vec<SpotPointRow>> {
        let inner = self.inner.lock().unwrap();
        let mut points: Vec<SpotPointRow> = inner
            .spots
            .values()
            .filter(|p| p.market_id == market_id)
            .cloned()
            .collect();
        points.sort_by_key(|p| p.timestamp);
        if points.len() > limit.max(0) as usize {
            let skip = points.len() - limit.max(0) as usize;
            points.drain(..skip);
        }
        Ok(points)
    }

    async fn lagging_markets(&self, head: u64, limit: i64) -> IndexerResult<Vec<LaggingMarket>> {
        let inner = self.inner.lock().unwrap();
        let mut lagging: Vec<LaggingMarket> = inner
            .syncs
            .values()
            .filter_map(|sync| {
                let market = inner.markets.get(&sync.market_id)?;
                if market.is_deleted() {
                    return None;
                }
                Some(LaggingMarket {
                    market_id: sync.market_id,
                    slug: market.slug.clone(),
                    last_indexed_block: sync.last_indexed_block,
                    lag_blocks: head.saturating_sub(sync.last_indexed_block.max(0) as u64),
                })
            })
            .collect();
        lagging.sort_by_key(|m| m.last_indexed_block);
        lagging.truncate(limit.max(0) as usize);
        Ok(lagging)
    }

    async fn health_check(&self) -> IndexerResult<()> {
        self.write_guard()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SCALE;
    use bigdecimal::BigDecimal;
    use chrono::TimeZone;

    fn market(id: Uuid) -> Market {
        Market {
            id,
            slug: Some("test-market".to_string()),
            condition_id: None,
            fpmm_address: Some("0xAA00000000000000000000000000000000000001".to_string()),
            title: "Test market".to_string(),
            outcome_yes: "YES".to_string(),
            outcome_no: "NO".to_string(),
            status: "active".to_string(),
            category: None,
            tags: Vec::new(),
            created_at: Utc::now(),
            expires_at: None,
            resolved_at: None,
            resolution_data: None,
        }
    }

    fn trade(market_id: Uuid, tx: &str, log_index: i64, secs: i64) -> TradeRow {
        TradeRow {
            market_id,
            fpmm_address: "0xaa".to_string(),
            tx_hash: tx.to_string(),
            log_index,
            block_number: 10,
            timestamp: Utc.timestamp_opt(secs, 0).single().unwrap(),
            side: "buy".to_string(),
            outcome: 0,
            amount_in_usdf: BigDecimal::from(SCALE as i64),
            price: BigDecimal::from(1),
            amount_out_shares: BigDecimal::from(1),
            fee_usdf: None,
        }
    }

    fn liquidity(market_id: Uuid, tx: &str, log_index: i64, secs: i64) -> LiquidityEventRow {
        LiquidityEventRow {
            market_id,
            fpmm_address: "0xaa".to_string(),
            tx_hash: tx.to_string(),
            log_index,
            block_number: 10,
            timestamp: Utc.timestamp_opt(secs, 0).single().unwrap(),
            kind: "trade".to_string(),
            yes_reserves: BigDecimal::from(99),
            no_reserves: BigDecimal::from(101),
            tvl_usdf: BigDecimal::from(200),
            source: None,
        }
    }

    fn candle(market_id: Uuid, price: i64, volume: i64) -> CandleRow {
        CandleRow {
            market_id,
            bucket_start: Utc.timestamp_opt(1_700_000_100, 0).single().unwrap(),
            open: BigDecimal::from(price),
            high: BigDecimal::from(price),
            low: BigDecimal::from(price),
            close: BigDecimal::from(price),
            volume_usdf: BigDecimal::from(volume),
        }
    }

    #[tokio::test]
    async fn duplicate_trade_insert_is_dropped() {
        let store = MemoryStore::new();
        let id = Uuid::new_v4();
        let row = trade(id, "0x01", 0, 1_700_000_000);

        assert!(store.insert_trade(&row).await.unwrap());
        assert!(!store.insert_trade(&row).await.unwrap());
        assert_eq!(store.row_counts().0, 1);
    }

    #[tokio::test]
    async fn cursor_never_regresses() {
        let store = MemoryStore::new();
        let id = Uuid::new_v4();

        store.advance_market_sync(id, 100, false).await.unwrap();
        store.advance_market_sync(id, 50, true).await.unwrap();
        store.advance_market_sync(id, 120, false).await.unwrap();

        let sync = store.get_market_sync(id).await.unwrap().unwrap();
        assert_eq!(sync.last_indexed_block, 120);
    }

    #[tokio::test]
    async fn candle_merge_follows_the_law() {
        let store = MemoryStore::new();
        let id = Uuid::new_v4();

        // Two updates into the same bucket, either order: high=max, low=min,
        // volume=sum, close=last arrival, open=first insert.
        store.upsert_candle(&candle(id, 40, 10)).await.unwrap();
        store.upsert_candle(&candle(id, 70, 5)).await.unwrap();

        let merged = store.candles_page(id, 10).await.unwrap().remove(0);
        assert_eq!(merged.open, BigDecimal::from(40));
        assert_eq!(merged.high, BigDecimal::from(70));
        assert_eq!(merged.low, BigDecimal::from(40));
        assert_eq!(merged.close, BigDecimal::from(70));
        assert_eq!(merged.volume_usdf, BigDecimal::from(15));
    }

    #[tokio::test]
    async fn apply_event_commits_the_whole_row_group_once() {
        let store = MemoryStore::new();
        let id = Uuid::new_v4();
        let liq = liquidity(id, "0x01", 1, 1_700_000_000);
        let trade_row = trade(id, "0x01", 1, 1_700_000_000);
        let candle_row = candle(id, 50, 10);

        assert!(store
            .apply_event(&liq, Some(&trade_row), Some(&candle_row), None)
            .await
            .unwrap());
        assert_eq!(store.row_counts(), (1, 1, 1, 0));

        // Re-delivery is a no-op for every row, including the candle merge
        assert!(!store
            .apply_event(&liq, Some(&trade_row), Some(&candle_row), None)
            .await
            .unwrap());
        assert_eq!(store.row_counts(), (1, 1, 1, 0));
        let merged = store.candles_page(id, 10).await.unwrap().remove(0);
        assert_eq!(merged.volume_usdf, BigDecimal::from(10));
    }

    #[tokio::test]
    async fn apply_event_is_all_or_nothing_under_failure() {
        let store = MemoryStore::new();
        let id = Uuid::new_v4();
        store.set_fail_writes(true);

        let liq = liquidity(id, "0x01", 1, 1_700_000_000);
        let trade_row = trade(id, "0x01", 1, 1_700_000_000);
        assert!(store
            .apply_event(&liq, Some(&trade_row), None, None)
            .await
            .is_err());
        // No orphaned liquidity snapshot without its trade
        assert_eq!(store.row_counts(), (0, 0, 0, 0));

        store.set_fail_writes(false);
        assert!(store
            .apply_event(&liq, Some(&trade_row), None, None)
            .await
            .unwrap());
        assert_eq!(store.row_counts(), (1, 1, 0, 0));
    }

    #[tokio::test]
    async fn volume_window_excludes_old_trades() {
        let store = MemoryStore::new();
        let id = Uuid::new_v4();
        let now = Utc.timestamp_opt(1_700_100_000, 0).single().unwrap();

        store
            .insert_trade(&trade(id, "0x01", 0, 1_700_099_000))
            .await
            .unwrap();
        store
            .insert_trade(&trade(id, "0x02", 0, 1_700_000_000))
            .await
            .unwrap();

        let volume = store.volume_24h(id, now).await.unwrap();
        assert_eq!(volume, U256::from(SCALE));
    }

    #[tokio::test]
    async fn slug_resolution_is_case_insensitive() {
        let store = MemoryStore::new();
        let id = Uuid::new_v4();
        store.insert_market(&market(id)).await.unwrap();

        assert!(store
            .find_market_by_key("Test-Market")
            .await
            .unwrap()
            .is_some());
        assert!(store
            .find_market_by_key(&id.to_string())
            .await
            .unwrap()
            .is_some());
        assert!(store.find_market_by_key("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn failed_writes_surface_storage_errors() {
        let store = MemoryStore::new();
        let id = Uuid::new_v4();
        store.set_fail_writes(true);

        let result = store.insert_trade(&trade(id, "0x01", 0, 1_700_000_000)).await;
        assert!(result.is_err());

        store.set_fail_writes(false);
        assert!(store
            .insert_trade(&trade(id, "0x01", 0, 1_700_000_000))
            .await
            .unwrap());
    }
}
