//! Market summary assembler
//!
//! Builds the one immutable document the UI reads per market: core fields,
//! metrics, candles, trades, and the spot series, with cache validators.
//! Store reads run concurrently under soft timeouts; a slow or failing read
//! degrades the document (`stale: true`) instead of failing the request.

use crate::amm::{tvl_scaled, yes_price_scaled};
use crate::chain::ChainReader;
use crate::config::SummaryConfig;
use crate::database::Store;
use crate::error::{IndexerError, IndexerResult};
use crate::indexer::Indexer;
use crate::models::{
    decimal_to_fixed18, fixed18_string, CandleRow, LiquidityEventRow, Market, SpotPointRow,
    TradeRow, SCALE,
};
use alloy_primitives::U256;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::future::Future;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{debug, warn};
use uuid::Uuid;

/// Rows embedded in the summary document
const EMBEDDED_CANDLES: i64 = 288;
const EMBEDDED_TRADES: i64 = 50;
const EMBEDDED_SPOTS: i64 = 288;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MarketDoc {
    pub id: Uuid,
    pub slug: Option<String>,
    pub condition_id: Option<String>,
    pub fpmm_address: Option<String>,
    pub title: String,
    pub outcomes: [String; 2],
    pub status: String,
    pub category: Option<String>,
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl From<&Market> for MarketDoc {
    fn from(market: &Market) -> Self {
        Self {
            id: market.id,
            slug: market.slug.clone(),
            condition_id: market.condition_id.clone(),
            fpmm_address: market.fpmm_address.clone(),
            title: market.title.clone(),
            outcomes: [market.outcome_yes.clone(), market.outcome_no.clone()],
            status: market.status.clone(),
            category: market.category.clone(),
            tags: market.tags.clone(),
            created_at: market.created_at,
            expires_at: market.expires_at,
            resolved_at: market.resolved_at,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SpotPrices {
    pub yes_price: String,
    pub no_price: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MarketMetrics {
    pub spot: SpotPrices,
    #[serde(rename = "tvlUSDF")]
    pub tvl_usdf: String,
    #[serde(rename = "volume24hUSDF")]
    pub volume_24h_usdf: String,
    pub last_trade_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CandleDoc {
    pub bucket_start: DateTime<Utc>,
    pub open: String,
    pub high: String,
    pub low: String,
    pub close: String,
    #[serde(rename = "volumeUSDF")]
    pub volume_usdf: String,
}

impl From<&CandleRow> for CandleDoc {
    fn from(row: &CandleRow) -> Self {
        Self {
            bucket_start: row.bucket_start,
            open: fixed18_string(&row.open),
            high: fixed18_string(&row.high),
            low: fixed18_string(&row.low),
            close: fixed18_string(&row.close),
            volume_usdf: fixed18_string(&row.volume_usdf),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TradeDoc {
    pub tx_hash: String,
    pub log_index: i64,
    pub block_number: i64,
    pub timestamp: DateTime<Utc>,
    pub side: String,
    pub outcome: i32,
    #[serde(rename = "amountInUSDF")]
    pub amount_in_usdf: String,
    pub price: String,
    pub amount_out_shares: String,
    #[serde(rename = "feeUSDF")]
    pub fee_usdf: Option<String>,
}

impl From<&TradeRow> for TradeDoc {
    fn from(row: &TradeRow) -> Self {
        Self {
            tx_hash: row.tx_hash.clone(),
            log_index: row.log_index,
            block_number: row.block_number,
            timestamp: row.timestamp,
            side: row.side.clone(),
            outcome: row.outcome,
            amount_in_usdf: fixed18_string(&row.amount_in_usdf),
            price: fixed18_string(&row.price),
            amount_out_shares: fixed18_string(&row.amount_out_shares),
            fee_usdf: row.fee_usdf.as_ref().map(fixed18_string),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SpotDoc {
    pub timestamp: DateTime<Utc>,
    pub yes_price: String,
    pub no_price: String,
}

impl From<&SpotPointRow> for SpotDoc {
    fn from(row: &SpotPointRow) -> Self {
        Self {
            timestamp: row.timestamp,
            yes_price: fixed18_string(&row.yes_price),
            no_price: fixed18_string(&row.no_price),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheInfo {
    pub last_indexed_block: u64,
    pub lag_blocks: u64,
    pub generated_at: DateTime<Utc>,
    pub stale: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MarketSummary {
    pub market: MarketDoc,
    pub metrics: MarketMetrics,
    pub candles: Vec<CandleDoc>,
    pub trades: Vec<TradeDoc>,
    pub spot_series: Vec<SpotDoc>,
    pub cache: CacheInfo,
}

/// Assembled document plus its HTTP validators
pub struct SummaryOutcome {
    pub document: MarketSummary,
    pub etag: String,
    pub last_modified: Option<DateTime<Utc>>,
}

pub struct SummaryAssembler {
    store: std::sync::Arc<dyn Store>,
    chain: std::sync::Arc<dyn ChainReader>,
    indexer: std::sync::Arc<Indexer>,
    cfg: SummaryConfig,
    /// Per-market throttle for the on-chain reserve probe
    probes: Mutex<HashMap<Uuid, Instant>>,
}

impl SummaryAssembler {
    pub fn new(
        store: std::sync::Arc<dyn Store>,
        chain: std::sync::Arc<dyn ChainReader>,
        indexer: std::sync::Arc<Indexer>,
        cfg: SummaryConfig,
    ) -> Self {
        Self {
            store,
            chain,
            indexer,
            cfg,
            probes: Mutex::new(HashMap::new()),
        }
    }

    /// Resolve a market by slug or id, excluding soft-deleted ones
    pub async fn resolve_market(&self, key: &str) -> IndexerResult<Market> {
        match self.store.find_market_by_key(key).await? {
            Some(market) if !market.is_deleted() => Ok(market),
            _ => Err(IndexerError::MarketUnknown {
                key: key.to_string(),
            }),
        }
    }

    /// Build the summary document. Read availability is preserved at all
    /// costs: partial data ships with `stale: true`, and an assembler-level
    /// failure ships a degraded document instead of an error.
    pub async fn summary(&self, key: &str) -> IndexerResult<SummaryOutcome> {
        let market = self.resolve_market(key).await?;
        match self.assemble_full(&market).await {
            Ok(outcome) => Ok(outcome),
            Err(err) => {
                warn!(market_id = %market.id, error = %err, "summary degraded");
                Ok(self.assemble_degraded(&market).await)
            }
        }
    }

    async fn assemble_full(&self, market: &Market) -> IndexerResult<SummaryOutcome> {
        let stale = AtomicBool::new(false);
        let now = Utc::now();

        let (sync, latest_liquidity, volume, last_trade, candles, trades, spots) = tokio::join!(
            self.soft(&stale, self.store.get_market_sync(market.id), None),
            self.soft(&stale, self.store.latest_liquidity_event(market.id), None),
            self.soft(&stale, self.store.volume_24h(market.id, now), U256::ZERO),
            self.soft(&stale, self.store.last_trade(market.id), None),
            self.soft(
                &stale,
                self.store.candles_page(market.id, EMBEDDED_CANDLES),
                Vec::new()
            ),
            self.soft(
                &stale,
                self.store.trades_page(market.id, EMBEDDED_TRADES, None),
                Vec::new()
            ),
            self.soft(
                &stale,
                self.store.spot_series_page(market.id, EMBEDDED_SPOTS),
                Vec::new()
            ),
        );

        let (yes, no) = self
            .resolve_reserves(market, latest_liquidity.as_ref(), last_trade.as_ref())
            .await;

        let last_indexed_block = sync
            .as_ref()
            .map(|s| s.last_indexed_block.max(0) as u64)
            .unwrap_or(0);
        let head = self.indexer.latest_head().await.unwrap_or(last_indexed_block);
        let lag_blocks = head.saturating_sub(last_indexed_block);

        // Fire-and-forget: losing this hint is safe, the periodic sweeper
        // or the next read re-triggers it.
        {
            let indexer = self.indexer.clone();
            let market_id = market.id;
            tokio::spawn(async move {
                let _ = indexer.maybe_enqueue_sweep(market_id).await;
            });
        }

        let last_candle_at = candles.last().map(|c| c.bucket_start);
        let last_liquidity_at = latest_liquidity.as_ref().map(|l| l.timestamp);
        let last_trade_at = last_trade.as_ref().map(|t| t.timestamp);

        let etag = weak_etag(
            "summary",
            market.id,
            last_indexed_block,
            &[last_trade_at, last_candle_at, last_liquidity_at],
        );
        let last_modified = [last_trade_at, last_candle_at, last_liquidity_at]
            .into_iter()
            .flatten()
            .max();

        let document = MarketSummary {
            market: MarketDoc::from(market),
            metrics: metrics_from_reserves(yes, no, volume, last_trade_at),
            candles: candles.iter().map(CandleDoc::from).collect(),
            trades: trades.iter().map(TradeDoc::from).collect(),
            spot_series: spots.iter().map(SpotDoc::from).collect(),
            cache: CacheInfo {
                last_indexed_block,
                lag_blocks,
                generated_at: now,
                stale: stale.load(Ordering::Relaxed),
            },
        };
        Ok(SummaryOutcome {
            document,
            etag,
            last_modified,
        })
    }

    /// Minimal document when the full read path is down: on-chain spot when
    /// possible, empty series, `stale: true`.
    async fn assemble_degraded(&self, market: &Market) -> SummaryOutcome {
        let (yes, no) = match self.store.load_pool_reserves(market.id).await {
            Ok(reserves) => reserves,
            Err(_) => self
                .probe_reserves(market)
                .await
                .unwrap_or((U256::ZERO, U256::ZERO)),
        };
        let now = Utc::now();
        let document = MarketSummary {
            market: MarketDoc::from(market),
            metrics: metrics_from_reserves(yes, no, U256::ZERO, None),
            candles: Vec::new(),
            trades: Vec::new(),
            spot_series: Vec::new(),
            cache: CacheInfo {
                last_indexed_block: 0,
                lag_blocks: 0,
                generated_at: now,
                stale: true,
            },
        };
        SummaryOutcome {
            etag: weak_etag("summary-degraded", market.id, 0, &[]),
            last_modified: None,
            document,
        }
    }

    /// Reserves for the spot metric: stored snapshot, refreshed by a direct
    /// on-chain probe when trades have outrun the liquidity history and the
    /// per-market probe cooldown has elapsed.
    async fn resolve_reserves(
        &self,
        market: &Market,
        latest_liquidity: Option<&LiquidityEventRow>,
        last_trade: Option<&TradeRow>,
    ) -> (U256, U256) {
        let stored = latest_liquidity.map(|l| {
            (
                decimal_to_fixed18(&l.yes_reserves),
                decimal_to_fixed18(&l.no_reserves),
            )
        });

        let needs_probe = match (latest_liquidity, last_trade) {
            (None, _) => true, // new pool, nothing indexed yet
            (Some(liquidity), Some(trade)) => trade.timestamp > liquidity.timestamp,
            (Some(_), None) => false,
        };

        if needs_probe {
            if let Some(probed) = self.probe_reserves(market).await {
                return probed;
            }
        }
        stored.unwrap_or((U256::ZERO, U256::ZERO))
    }

    /// Rate-limited on-chain reserve read; `None` when throttled or failing
    async fn probe_reserves(&self, market: &Market) -> Option<(U256, U256)> {
        let pool: alloy_primitives::Address =
            market.fpmm_address.as_deref()?.parse().ok()?;
        {
            let mut probes = self.probes.lock().unwrap();
            let cooldown = Duration::from_millis(self.cfg.onchain_probe_cooldown_ms);
            if let Some(last) = probes.get(&market.id) {
                if last.elapsed() < cooldown {
                    return None;
                }
            }
            probes.insert(market.id, Instant::now());
        }
        match self.chain.pool_reserves(pool).await {
            Ok(reserves) => Some(reserves),
            Err(err) => {
                debug!(market_id = %market.id, error = %err, "reserve probe failed");
                None
            }
        }
    }

    /// Clamp a read to the soft timeout, marking the document stale on
    /// timeout or error.
    async fn soft<T, F>(&self, stale: &AtomicBool, fut: F, default: T) -> T
    where
        F: Future<Output = IndexerResult<T>>,
    {
        let budget = Duration::from_millis(self.cfg.timeout_ms);
        match tokio::time::timeout(budget, fut).await {
            Ok(Ok(value)) => value,
            Ok(Err(err)) => {
                warn!(error = %err, "summary read failed");
                stale.store(true, Ordering::Relaxed);
                default
            }
            Err(_) => {
                stale.store(true, Ordering::Relaxed);
                default
            }
        }
    }
}

fn metrics_from_reserves(
    yes: U256,
    no: U256,
    volume: U256,
    last_trade_at: Option<DateTime<Utc>>,
) -> MarketMetrics {
    let yes_price = yes_price_scaled(yes, no);
    let no_price = U256::from(SCALE).saturating_sub(yes_price);
    MarketMetrics {
        spot: SpotPrices {
            yes_price: yes_price.to_string(),
            no_price: if yes_price.is_zero() && no.is_zero() && yes.is_zero() {
                U256::ZERO.to_string()
            } else {
                no_price.to_string()
            },
        },
        tvl_usdf: tvl_scaled(yes, no).to_string(),
        volume_24h_usdf: volume.to_string(),
        last_trade_at,
    }
}

/// Weak validator over the document's change-relevant inputs
fn weak_etag(
    label: &str,
    market_id: Uuid,
    last_indexed_block: u64,
    timestamps: &[Option<DateTime<Utc>>],
) -> String {
    let mut hasher = DefaultHasher::new();
    label.hash(&mut hasher);
    market_id.hash(&mut hasher);
    last_indexed_block.hash(&mut hasher);
    for ts in timestamps {
        ts.map(|t| t.timestamp_millis()).hash(&mut hasher);
    }
    format!("W/\"{:016x}\"", hasher.finish())
}
