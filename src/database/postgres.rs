//! PostgreSQL store
//!
//! Runtime-checked sqlx queries; every unique constraint is named in its
//! write statement so conflict handling is explicit. The per-event row
//! group commits inside one transaction. Migrations run on startup and are
//! recorded by sqlx's applied-migration bookkeeping.

use super::Store;
use crate::config::DatabaseConfig;
use crate::error::{IndexerError, IndexerResult, StorageError};
use crate::models::{
    decimal_to_fixed18, CandleRow, LaggingMarket, LiquidityEventRow, Market, MarketSync,
    SpotPointRow, TradeRow,
};
use alloy_primitives::U256;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use uuid::Uuid;

const INSERT_TRADE_SQL: &str = r#"
    INSERT INTO trades (
        market_id, fpmm_address, tx_hash, log_index, block_number,
        timestamp, side, outcome, amount_in_usdf, price,
        amount_out_shares, fee_usdf
    ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
    ON CONFLICT ON CONSTRAINT trades_tx_hash_log_index_key DO NOTHING
"#;

const INSERT_LIQUIDITY_SQL: &str = r#"
    INSERT INTO liquidity_events (
        market_id, fpmm_address, tx_hash, log_index, block_number,
        timestamp, kind, yes_reserves, no_reserves, tvl_usdf, source
    ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
    ON CONFLICT ON CONSTRAINT liquidity_events_tx_hash_log_index_key DO NOTHING
"#;

const UPSERT_CANDLE_SQL: &str = r#"
    INSERT INTO candles_5m (
        market_id, bucket_start, open, high, low, close, volume_usdf
    ) VALUES ($1, $2, $3, $4, $5, $6, $7)
    ON CONFLICT (market_id, bucket_start) DO UPDATE SET
        high = GREATEST(candles_5m.high, EXCLUDED.high),
        low = LEAST(candles_5m.low, EXCLUDED.low),
        close = EXCLUDED.close,
        volume_usdf = candles_5m.volume_usdf + EXCLUDED.volume_usdf
"#;

const UPSERT_SPOT_SQL: &str = r#"
    INSERT INTO market_spot_points (market_id, timestamp, yes_price, no_price)
    VALUES ($1, $2, $3, $4)
    ON CONFLICT ON CONSTRAINT market_spot_points_market_id_timestamp_key DO NOTHING
"#;

/// Insert a trade on the given executor; false when the row already existed
async fn insert_trade_on(
    executor: impl sqlx::PgExecutor<'_>,
    row: &TradeRow,
) -> IndexerResult<bool> {
    let result = sqlx::query(INSERT_TRADE_SQL)
        .bind(row.market_id)
        .bind(&row.fpmm_address)
        .bind(&row.tx_hash)
        .bind(row.log_index)
        .bind(row.block_number)
        .bind(row.timestamp)
        .bind(&row.side)
        .bind(row.outcome)
        .bind(&row.amount_in_usdf)
        .bind(&row.price)
        .bind(&row.amount_out_shares)
        .bind(&row.fee_usdf)
        .execute(executor)
        .await?;
    Ok(result.rows_affected() > 0)
}

async fn insert_liquidity_event_on(
    executor: impl sqlx::PgExecutor<'_>,
    row: &LiquidityEventRow,
) -> IndexerResult<bool> {
    let result = sqlx::query(INSERT_LIQUIDITY_SQL)
        .bind(row.market_id)
        .bind(&row.fpmm_address)
        .bind(&row.tx_hash)
        .bind(row.log_index)
        .bind(row.block_number)
        .bind(row.timestamp)
        .bind(&row.kind)
        .bind(&row.yes_reserves)
        .bind(&row.no_reserves)
        .bind(&row.tvl_usdf)
        .bind(&row.source)
        .execute(executor)
        .await?;
    Ok(result.rows_affected() > 0)
}

async fn upsert_candle_on(
    executor: impl sqlx::PgExecutor<'_>,
    row: &CandleRow,
) -> IndexerResult<()> {
    sqlx::query(UPSERT_CANDLE_SQL)
        .bind(row.market_id)
        .bind(row.bucket_start)
        .bind(&row.open)
        .bind(&row.high)
        .bind(&row.low)
        .bind(&row.close)
        .bind(&row.volume_usdf)
        .execute(executor)
        .await?;
    Ok(())
}

async fn upsert_spot_point_on(
    executor: impl sqlx::PgExecutor<'_>,
    row: &SpotPointRow,
) -> IndexerResult<()> {
    sqlx::query(UPSERT_SPOT_SQL)
        .bind(row.market_id)
        .bind(row.timestamp)
        .bind(&row.yes_price)
        .bind(&row.no_price)
        .execute(executor)
        .await?;
    Ok(())
}

#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub async fn new(config: &DatabaseConfig) -> IndexerResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(std::time::Duration::from_secs(config.acquire_timeout_secs))
            .connect(&config.postgres_url)
            .await?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| IndexerError::Storage(StorageError::MigrationFailed(e.to_string())))?;

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl Store for PostgresStore {
    async fn insert_market(&self, market: &Market) -> IndexerResult<()> {
        sqlx::query(
            r#"
            INSERT INTO markets (
                id, slug, condition_id, fpmm_address, title, outcome_yes,
                outcome_no, status, category, tags, created_at, expires_at,
                resolved_at, resolution_data
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            ON CONFLICT (id) DO UPDATE SET
                slug = EXCLUDED.slug,
                condition_id = EXCLUDED.condition_id,
                fpmm_address = EXCLUDED.fpmm_address,
                title = EXCLUDED.title,
                status = EXCLUDED.status,
                category = EXCLUDED.category,
                tags = EXCLUDED.tags,
                expires_at = EXCLUDED.expires_at,
                resolved_at = EXCLUDED.resolved_at,
                resolution_data = EXCLUDED.resolution_data
            "#,
        )
        .bind(market.id)
        .bind(&market.slug)
        .bind(&market.condition_id)
        .bind(&market.fpmm_address)
        .bind(&market.title)
        .bind(&market.outcome_yes)
        .bind(&market.outcome_no)
        .bind(&market.status)
        .bind(&market.category)
        .bind(&market.tags)
        .bind(market.created_at)
        .bind(market.expires_at)
        .bind(market.resolved_at)
        .bind(&market.resolution_data)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find_market_by_key(&self, key: &str) -> IndexerResult<Option<Market>> {
        if let Ok(id) = key.parse::<Uuid>() {
            let market = sqlx::query_as::<_, Market>("SELECT * FROM markets WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
            return Ok(market);
        }
        let market =
            sqlx::query_as::<_, Market>("SELECT * FROM markets WHERE LOWER(slug) = LOWER($1)")
                .bind(key)
                .fetch_optional(&self.pool)
                .await?;
        Ok(market)
    }

    async fn find_market_by_pool(&self, pool: &str) -> IndexerResult<Option<Market>> {
        let market = sqlx::query_as::<_, Market>(
            "SELECT * FROM markets WHERE LOWER(fpmm_address) = LOWER($1)",
        )
        .bind(pool)
        .fetch_optional(&self.pool)
        .await?;
        Ok(market)
    }

    async fn list_markets(&self, limit: i64, offset: i64) -> IndexerResult<Vec<Market>> {
        let markets = sqlx::query_as::<_, Market>(
            r#"
            SELECT * FROM markets
            WHERE status != 'deleted'
            ORDER BY created_at DESC
            LIMIT $1 OFFSET $2
            "#,
        )
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;
        Ok(markets)
    }

    async fn list_pool_addresses(&self) -> IndexerResult<Vec<(Uuid, String)>> {
        let rows = sqlx::query(
            r#"
            SELECT id, LOWER(fpmm_address) AS pool FROM markets
            WHERE fpmm_address IS NOT NULL AND status != 'deleted'
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|row| (row.get("id"), row.get("pool")))
            .collect())
    }

    async fn insert_trade(&self, row: &TradeRow) -> IndexerResult<bool> {
        insert_trade_on(&self.pool, row).await
    }

    async fn insert_liquidity_event(&self, row: &LiquidityEventRow) -> IndexerResult<bool> {
        insert_liquidity_event_on(&self.pool, row).await
    }

    async fn upsert_candle(&self, row: &CandleRow) -> IndexerResult<()> {
        upsert_candle_on(&self.pool, row).await
    }

    async fn upsert_spot_point(&self, row: &SpotPointRow) -> IndexerResult<()> {
        upsert_spot_point_on(&self.pool, row).await
    }

    async fn apply_event(
        &self,
        liquidity: &LiquidityEventRow,
        trade: Option<&TradeRow>,
        candle: Option<&CandleRow>,
        spot: Option<&SpotPointRow>,
    ) -> IndexerResult<bool> {
        let mut tx = self.pool.begin().await?;

        // The liquidity insert doubles as the freshness check: a conflict
        // means another delivery already committed this event's rows.
        if !insert_liquidity_event_on(&mut *tx, liquidity).await? {
            tx.rollback().await?;
            return Ok(false);
        }
        if let Some(trade) = trade {
            insert_trade_on(&mut *tx, trade).await?;
        }
        if let Some(candle) = candle {
            upsert_candle_on(&mut *tx, candle).await?;
        }
        if let Some(spot) = spot {
            upsert_spot_point_on(&mut *tx, spot).await?;
        }
        tx.commit().await?;
        Ok(true)
    }

    async fn ensure_market_sync(
        &self,
        market_id: Uuid,
        baseline: u64,
    ) -> IndexerResult<MarketSync> {
        let sync = sqlx::query_as::<_, MarketSync>(
            r#"
            INSERT INTO market_sync (market_id, last_indexed_block, sweeping, updated_at)
            VALUES ($1, $2, FALSE, NOW())
            ON CONFLICT (market_id) DO UPDATE SET market_id = EXCLUDED.market_id
            RETURNING *
            "#,
        )
        .bind(market_id)
        .bind(baseline as i64)
        .fetch_one(&self.pool)
        .await?;
        Ok(sync)
    }

    async fn get_market_sync(&self, market_id: Uuid) -> IndexerResult<Option<MarketSync>> {
        let sync =
            sqlx::query_as::<_, MarketSync>("SELECT * FROM market_sync WHERE market_id = $1")
                .bind(market_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(sync)
    }

    async fn advance_market_sync(
        &self,
        market_id: Uuid,
        block: u64,
        sweeping: bool,
    ) -> IndexerResult<()> {
        sqlx::query(
            r#"
            INSERT INTO market_sync (market_id, last_indexed_block, sweeping, updated_at)
            VALUES ($1, $2, $3, NOW())
            ON CONFLICT (market_id) DO UPDATE SET
                last_indexed_block = GREATEST(market_sync.last_indexed_block, EXCLUDED.last_indexed_block),
                sweeping = EXCLUDED.sweeping,
                updated_at = NOW()
            "#,
        )
        .bind(market_id)
        .bind(block as i64)
        .bind(sweeping)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn set_market_sync_block(&self, market_id: Uuid, block: u64) -> IndexerResult<()> {
        sqlx::query(
            "UPDATE market_sync SET last_indexed_block = $2, updated_at = NOW() WHERE market_id = $1",
        )
        .bind(market_id)
        .bind(block as i64)
        .execute(&self.pool)
        .await?;
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
        let event = sqlx::query_as::<_, LiquidityEventRow>(
            r#"
            SELECT * FROM liquidity_events
            WHERE market_id = $1
            ORDER BY block_number DESC, log_index DESC
            LIMIT 1
            "#,
        )
        .bind(market_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(event)
    }

    async fn volume_24h(&self, market_id: Uuid, now: DateTime<Utc>) -> IndexerResult<U256> {
        let row = sqlx::query(
            r#"
            SELECT COALESCE(SUM(amount_in_usdf), 0) AS volume FROM trades
            WHERE market_id = $1 AND timestamp > $2
            "#,
        )
        .bind(market_id)
        .bind(now - Duration::hours(24))
        .fetch_one(&self.pool)
        .await?;
        let volume: bigdecimal::BigDecimal = row.get("volume");
        Ok(decimal_to_fixed18(&volume))
    }

    async fn last_trade(&self, market_id: Uuid) -> IndexerResult<Option<TradeRow>> {
        let trade = sqlx::query_as::<_, TradeRow>(
            r#"
            SELECT * FROM trades
            WHERE market_id = $1
            ORDER BY block_number DESC, log_index DESC
            LIMIT 1
            "#,
        )
        .bind(market_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(trade)
    }

    async fn first_trade_block(&self, market_id: Uuid) -> IndexerResult<Option<u64>> {
        let row = sqlx::query(
            "SELECT MIN(block_number) AS first_block FROM trades WHERE market_id = $1",
        )
        .bind(market_id)
        .fetch_one(&self.pool)
        .await?;
        let first: Option<i64> = row.get("first_block");
        Ok(first.map(|b| b.max(0) as u64))
    }

    async fn trades_page(
        &self,
        market_id: Uuid,
        limit: i64,
        before: Option<DateTime<Utc>>,
    ) -> IndexerResult<Vec<TradeRow>> {
        let trades = match before {
            Some(before) => {
                sqlx::query_as::<_, TradeRow>(
                    r#"
                    SELECT * FROM trades
                    WHERE market_id = $1 AND timestamp < $2
                    ORDER BY timestamp DESC, log_index DESC
                    LIMIT $3
                    "#,
                )
                .bind(market_id)
                .bind(before)
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as::<_, TradeRow>(
                    r#"
                    SELECT * FROM trades
                    WHERE market_id = $1
                    ORDER BY timestamp DESC, log_index DESC
                    LIMIT $2
                    "#,
                )
                .bind(market_id)
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
        };
        Ok(trades)
    }

    async fn candles_page(&self, market_id: Uuid, limit: i64) -> IndexerResult<Vec<CandleRow>> {
        let mut candles = sqlx::query_as::<_, CandleRow>(
            r#"
            SELECT * FROM candles_5m
            WHERE market_id = $1
            ORDER BY bucket_start DESC
            LIMIT $2
            "#,
        )
        .bind(market_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        candles.reverse();
        Ok(candles)
    }

    async fn spot_series_page(
        &self,
        market_id: Uuid,
        limit: i64,
    ) -> IndexerResult<Vec<SpotPointRow>> {
        let mut points = sqlx::query_as::<_, SpotPointRow>(
            r#"
            SELECT * FROM market_spot_points
            WHERE market_id = $1
            ORDER BY timestamp DESC
            LIMIT $2
            "#,
        )
        .bind(market_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        points.reverse();
        Ok(points)
    }

    async fn lagging_markets(&self, head: u64, limit: i64) -> IndexerResult<Vec<LaggingMarket>> {
        let rows = sqlx::query(
            r#"
            SELECT m.id, m.slug, s.last_indexed_block
            FROM market_sync s
            JOIN markets m ON m.id = s.market_id
            WHERE m.status != 'deleted'
            ORDER BY s.last_indexed_block ASC
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|row| {
                let last: i64 = row.get("last_indexed_block");
                LaggingMarket {
                    market_id: row.get("id"),
                    slug: row.get("slug"),
                    last_indexed_block: last,
                    lag_blocks: head.saturating_sub(last.max(0) as u64),
                }
            })
            .collect())
    }

    async fn health_check(&self) -> IndexerResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
