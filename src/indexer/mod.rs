//! On-demand indexer
//!
//! Drives the whole pipeline: consumes transaction-hash and market hints,
//! resolves logs through the rate-limited gateway, applies them in strict
//! `(block, log_index)` order, commits idempotent rows, advances the
//! per-market cursor, and publishes trade and progress notifications.
//! Failures never stall the pipeline: a failed market is skipped and a
//! recovery sweep is scheduled.

use crate::amm::{self, EventPosition, PoolState};
use crate::bus::{trades_topic, BusMessage, EventBus};
use crate::chain::events::decode_amm_event;
use crate::chain::types::{LogEntry, LogFilter};
use crate::chain::ChainReader;
use crate::config::ReconConfig;
use crate::database::Store;
use crate::error::{IndexerError, IndexerResult};
use crate::models::{decimal_to_fixed18, fixed18_string, Market, SweepJob, TradeRow, TxJob};
use crate::queue::JobQueues;
use alloy_primitives::{Address, B256};
use chrono::{DateTime, TimeZone, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Block-timestamp cache capacity
const TIMESTAMP_CACHE_CAP: usize = 512;

/// Memoized head TTL
const HEAD_TTL: Duration = Duration::from_secs(60);

/// Pause between sweep windows
const SWEEP_WINDOW_PAUSE: Duration = Duration::from_millis(150);

/// Bounded insertion-order cache for block timestamps
struct TimestampCache {
    map: HashMap<B256, DateTime<Utc>>,
    order: VecDeque<B256>,
}

impl TimestampCache {
    fn new() -> Self {
        Self {
            map: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    fn get(&self, hash: &B256) -> Option<DateTime<Utc>> {
        self.map.get(hash).copied()
    }

    fn put(&mut self, hash: B256, timestamp: DateTime<Utc>) {
        if self.map.insert(hash, timestamp).is_none() {
            self.order.push_back(hash);
            if self.order.len() > TIMESTAMP_CACHE_CAP {
                if let Some(evicted) = self.order.pop_front() {
                    self.map.remove(&evicted);
                }
            }
        }
    }
}

#[derive(Default)]
struct MarketMetaCache {
    by_pool: HashMap<String, Market>,
    by_id: HashMap<Uuid, Market>,
}

impl MarketMetaCache {
    fn put(&mut self, market: &Market) {
        if let Some(pool) = market.pool_address_lower() {
            self.by_pool.insert(pool, market.clone());
        }
        self.by_id.insert(market.id, market.clone());
    }
}

pub struct Indexer {
    store: Arc<dyn Store>,
    chain: Arc<dyn ChainReader>,
    queues: Arc<JobQueues>,
    bus: Arc<dyn EventBus>,
    cfg: ReconConfig,
    timestamps: Mutex<TimestampCache>,
    markets: Mutex<MarketMetaCache>,
    head: Mutex<Option<(Instant, u64)>>,
    tx_inflight: AtomicU64,
    sweep_inflight: AtomicU64,
}

impl Indexer {
    pub fn new(
        store: Arc<dyn Store>,
        chain: Arc<dyn ChainReader>,
        queues: Arc<JobQueues>,
        bus: Arc<dyn EventBus>,
        cfg: ReconConfig,
    ) -> Self {
        Self {
            store,
            chain,
            queues,
            bus,
            cfg,
            timestamps: Mutex::new(TimestampCache::new()),
            markets: Mutex::new(MarketMetaCache::default()),
            head: Mutex::new(None),
            tx_inflight: AtomicU64::new(0),
            sweep_inflight: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &ReconConfig {
        &self.cfg
    }

    /// In-flight (tx, sweep) job counts
    pub fn inflight(&self) -> (u64, u64) {
        (
            self.tx_inflight.load(Ordering::Relaxed),
            self.sweep_inflight.load(Ordering::Relaxed),
        )
    }

    /// Memoized chain head, refreshed when older than its TTL
    pub async fn latest_head(&self) -> IndexerResult<u64> {
        {
            let head = self.head.lock().unwrap();
            if let Some((at, block)) = *head {
                if at.elapsed() < HEAD_TTL {
                    return Ok(block);
                }
            }
        }
        self.refresh_head().await
    }

    /// Force a head read through the gateway
    pub async fn refresh_head(&self) -> IndexerResult<u64> {
        let block = self.chain.block_number().await?;
        let mut head = self.head.lock().unwrap();
        *head = Some((Instant::now(), block));
        Ok(block)
    }

    /// Last cached head without touching the chain
    pub fn cached_head(&self) -> Option<u64> {
        (*self.head.lock().unwrap()).map(|(_, block)| block)
    }

    /// Make a freshly registered market visible without a store round-trip
    pub fn cache_market(&self, market: &Market) {
        self.markets.lock().unwrap().put(market);
    }

    async fn market_for_pool(&self, pool_lower: &str) -> IndexerResult<Option<Market>> {
        if let Some(market) = self.markets.lock().unwrap().by_pool.get(pool_lower) {
            return Ok(Some(market.clone()));
        }
        let market = self.store.find_market_by_pool(pool_lower).await?;
        if let Some(market) = &market {
            self.cache_market(market);
        }
        Ok(market)
    }

    async fn market_by_id(&self, market_id: Uuid) -> IndexerResult<Option<Market>> {
        if let Some(market) = self.markets.lock().unwrap().by_id.get(&market_id) {
            return Ok(Some(market.clone()));
        }
        let market = self.store.find_market_by_key(&market_id.to_string()).await?;
        if let Some(market) = &market {
            self.cache_market(market);
        }
        Ok(market)
    }

    async fn block_timestamp(&self, block_hash: B256) -> IndexerResult<DateTime<Utc>> {
        if let Some(ts) = self.timestamps.lock().unwrap().get(&block_hash) {
            return Ok(ts);
        }
        let header = self
            .chain
            .block_header_by_hash(block_hash)
            .await?
            .ok_or_else(|| IndexerError::Decode(format!("unknown block {block_hash:#x}")))?;
        let ts = Utc
            .timestamp_opt(header.timestamp as i64, 0)
            .single()
            .ok_or_else(|| {
                IndexerError::Decode(format!("bad block timestamp {}", header.timestamp))
            })?;
        self.timestamps.lock().unwrap().put(block_hash, ts);
        Ok(ts)
    }

    // ---- TxJob path ----

    /// Resolve a transaction hint: fetch its receipt (polling through chain
    /// lag), pull the containing block's logs, and apply them per market.
    pub async fn handle_tx_job(&self, job: &TxJob) -> IndexerResult<()> {
        let receipt = match self.poll_receipt(&job.tx_hash).await? {
            Some(receipt) => receipt,
            None => {
                // Never lose a hint: hand it back to the queue
                warn!(tx_hash = %job.tx_hash, "receipt still missing, re-enqueueing hint");
                self.queues.enqueue_tx(job).await?;
                return Ok(());
            }
        };

        let block_logs = self
            .chain
            .logs(&LogFilter::block(receipt.block_hash))
            .await?;
        debug!(
            tx_hash = %job.tx_hash,
            block = receipt.block_number,
            logs = block_logs.len(),
            "resolved hint block"
        );

        // Partition by pool address, preserving first-appearance order
        let mut order: Vec<String> = Vec::new();
        let mut groups: HashMap<String, Vec<LogEntry>> = HashMap::new();
        for log in block_logs {
            let key = format!("{:#x}", log.address);
            if !groups.contains_key(&key) {
                order.push(key.clone());
            }
            groups.entry(key).or_default().push(log);
        }

        for pool in order {
            let Some(market) = self.market_for_pool(&pool).await? else {
                // Log belongs to no registered market
                continue;
            };
            if market.is_deleted() {
                continue;
            }
            let mut market_logs = groups.remove(&pool).unwrap_or_default();
            market_logs.sort_by_key(|l| l.log_index);

            match self.process_market_logs(&market, market_logs).await {
                Ok(_) => {
                    self.store
                        .advance_market_sync(market.id, receipt.block_number, false)
                        .await?;
                    self.publish_indexed(market.id, receipt.block_number).await;
                }
                Err(err) => {
                    // No cursor advance for this market; schedule recovery
                    error!(
                        market_id = %market.id,
                        error = %err,
                        "apply failed, scheduling recovery sweep"
                    );
                    match self.queues.enqueue_sweep(market.id).await {
                        Ok(queued) => {
                            debug!(market_id = %market.id, queued, "recovery sweep requested")
                        }
                        Err(err) => {
                            warn!(market_id = %market.id, error = %err, "could not schedule recovery sweep")
                        }
                    }
                }
            }
        }
        Ok(())
    }

    async fn poll_receipt(
        &self,
        tx_hash: &str,
    ) -> IndexerResult<Option<crate::chain::types::TransactionReceipt>> {
        for attempt in 1..=self.cfg.max_receipt_attempts {
            if let Some(receipt) = self.chain.transaction_receipt(tx_hash).await? {
                return Ok(Some(receipt));
            }
            debug!(tx_hash, attempt, "receipt not found yet");
            if attempt < self.cfg.max_receipt_attempts {
                tokio::time::sleep(Duration::from_millis(self.cfg.receipt_poll_ms)).await;
            }
        }
        Ok(None)
    }

    /// Apply one market's logs in canonical order and persist the derived
    /// rows. Events at or below the market's stored watermark are skipped,
    /// which makes duplicate and partially re-delivered batches safe.
    pub(crate) async fn process_market_logs(
        &self,
        market: &Market,
        logs: Vec<LogEntry>,
    ) -> IndexerResult<usize> {
        let Some(pool) = market.pool_address_lower() else {
            return Ok(0);
        };

        let mut state = self.hydrate_state(market, &pool).await?;
        let mut applied = 0usize;

        for log in logs {
            if log.removed {
                continue;
            }
            if format!("{:#x}", log.address) != state.fpmm_address {
                continue;
            }
            let Some(event) = decode_amm_event(&log) else {
                continue; // unknown topic, inert
            };
            if state.already_applied(log.block_number, log.log_index) {
                continue;
            }

            let timestamp = self.block_timestamp(log.block_hash).await?;
            let position = EventPosition {
                tx_hash: format!("{:#x}", log.transaction_hash),
                log_index: log.log_index,
                block_number: log.block_number,
                timestamp,
            };
            let outcome = amm::apply(&mut state, &event, &position);

            // One atomic write per event: the trade can never go missing
            // behind a committed liquidity snapshot. A false return means
            // another delivery already committed this event's rows.
            if !self
                .store
                .apply_event(
                    &outcome.liquidity,
                    outcome.trade.as_ref(),
                    outcome.candle.as_ref(),
                    outcome.spot.as_ref(),
                )
                .await?
            {
                continue;
            }
            if let Some(trade) = &outcome.trade {
                self.publish_trade(trade).await;
            }
            applied += 1;
        }
        Ok(applied)
    }

    async fn hydrate_state(&self, market: &Market, pool: &str) -> IndexerResult<PoolState> {
        let mut state = PoolState::new(market.id, pool);
        if let Some(latest) = self.store.latest_liquidity_event(market.id).await? {
            state.yes_reserve = decimal_to_fixed18(&latest.yes_reserves);
            state.no_reserve = decimal_to_fixed18(&latest.no_reserves);
            state.last_block = latest.block_number.max(0) as u64;
            state.last_log_index = latest.log_index.max(0) as u64;
            state.has_liquidity =
                !state.yes_reserve.is_zero() || !state.no_reserve.is_zero();
        }
        Ok(state)
    }

    // ---- SweepJob path ----

    /// Run one bounded sweep for a market. The dedupe lock is released on
    /// every exit path, success or failure.
    pub async fn handle_sweep_job(&self, job: &SweepJob) -> IndexerResult<()> {
        let result = self.run_sweep(job.market_id).await;
        if let Err(err) = self.queues.release_sweep_lock(job.market_id).await {
            warn!(market_id = %job.market_id, error = %err, "sweep lock release failed");
        }
        result
    }

    async fn run_sweep(&self, market_id: Uuid) -> IndexerResult<()> {
        let Some(market) = self.market_by_id(market_id).await? else {
            debug!(%market_id, "sweep for unknown market dropped");
            return Ok(());
        };
        if market.is_deleted() {
            return Ok(());
        }
        let Some(pool) = market.pool_address_lower() else {
            return Ok(());
        };
        let address: Address = pool
            .parse()
            .map_err(|_| IndexerError::Decode(format!("bad pool address {pool}")))?;

        let sync = self
            .store
            .ensure_market_sync(market_id, self.cfg.baseline_block)
            .await?;
        let mut last = sync.last_indexed_block.max(0) as u64;

        // The tx-hint path treats the head itself as safe: hints only arrive
        // for mined transactions. The periodic reconciliation loop applies
        // its own confirmation margin.
        let safe_head = self.refresh_head().await?;

        // Bootstrap a fresh cursor: a migrated market starts near its first
        // trade instead of genesis, a brand-new one just behind the head.
        // The baseline stays a hard floor either way.
        if last == 0 {
            let start = match self.store.first_trade_block(market_id).await? {
                Some(first_block) => {
                    let safety = (self.cfg.scan_blocks_per_batch
                        * self.cfg.sweep_max_batches_per_sweep)
                        .max(50_000);
                    first_block.saturating_sub(safety).max(self.cfg.baseline_block)
                }
                None => safe_head
                    .saturating_sub(self.cfg.init_lag_blocks)
                    .max(self.cfg.baseline_block),
            };
            if start > 0 {
                info!(%market_id, start, "bootstrapping sync cursor");
                self.store.set_market_sync_block(market_id, start).await?;
                last = start;
            }
        }
        if safe_head.saturating_sub(last) <= self.cfg.sweep_window_blocks {
            return Ok(());
        }

        for _ in 0..self.cfg.sweep_max_batches_per_sweep {
            let from = last + 1;
            if from > safe_head {
                break;
            }
            let to = (from + self.cfg.scan_blocks_per_batch - 1).min(safe_head);

            let mut logs = self
                .chain
                .logs(&LogFilter::range(from, to, vec![address]))
                .await?;
            logs.sort_by_key(|l| (l.block_number, l.log_index));
            let applied = self.process_market_logs(&market, logs).await?;
            self.store.advance_market_sync(market_id, to, true).await?;
            debug!(%market_id, from, to, applied, "sweep window committed");

            last = to;
            if to >= safe_head {
                break;
            }
            tokio::time::sleep(SWEEP_WINDOW_PAUSE).await;
        }

        self.store.advance_market_sync(market_id, last, false).await?;
        self.publish_indexed(market_id, last).await;
        Ok(())
    }

    /// Reactive sweep scheduling used by read endpoints: only when the lag
    /// is worth a sweep, and either very large or past the cooldown.
    pub async fn maybe_enqueue_sweep(&self, market_id: Uuid) -> IndexerResult<bool> {
        let head = self.latest_head().await?;
        let sync = self
            .store
            .ensure_market_sync(market_id, self.cfg.baseline_block)
            .await?;
        let lag = head.saturating_sub(sync.last_indexed_block.max(0) as u64);
        if lag <= self.cfg.sweep_window_blocks {
            return Ok(false);
        }

        let very_large = lag > 4 * self.cfg.sweep_window_blocks;
        let cooled = Utc::now()
            .signed_duration_since(sync.updated_at)
            .num_milliseconds()
            >= self.cfg.sweep_cooldown_ms as i64;
        if !(very_large || cooled) {
            return Ok(false);
        }
        self.queues.enqueue_sweep(market_id).await
    }

    // ---- Publishing ----

    async fn publish_trade(&self, trade: &TradeRow) {
        let message = BusMessage::Trade {
            market_id: trade.market_id,
            tx_hash: trade.tx_hash.clone(),
            log_index: trade.log_index.max(0) as u64,
            block_number: trade.block_number.max(0) as u64,
            timestamp: trade.timestamp,
            side: trade.side.clone(),
            outcome: trade.outcome,
            amount_in_usdf: fixed18_string(&trade.amount_in_usdf),
            price: fixed18_string(&trade.price),
            amount_out_shares: fixed18_string(&trade.amount_out_shares),
        };
        if let Err(err) = self
            .bus
            .publish(&trades_topic(trade.market_id), &message)
            .await
        {
            // Correctness never depends on the bus
            warn!(market_id = %trade.market_id, error = %err, "trade publish failed");
        }
    }

    async fn publish_indexed(&self, market_id: Uuid, last_indexed_block: u64) {
        let head_block = match self.latest_head().await {
            Ok(head) => head.max(last_indexed_block),
            Err(_) => last_indexed_block,
        };
        let message = BusMessage::Indexed {
            last_indexed_block,
            head_block,
            lag_blocks: head_block.saturating_sub(last_indexed_block),
            emitted_at: Utc::now(),
        };
        if let Err(err) = self.bus.publish(&trades_topic(market_id), &message).await {
            warn!(%market_id, error = %err, "indexed publish failed");
        }
    }

    // ---- Workers ----

    /// Long-running transaction-hint worker. Jobs run sequentially within
    /// this stream; per-market state is private to the running job.
    pub async fn run_tx_worker(self: Arc<Self>, shutdown: watch::Receiver<bool>) {
        info!("tx worker started");
        while !*shutdown.borrow() {
            match self.queues.pop_tx().await {
                Ok(Some(job)) => {
                    self.tx_inflight.fetch_add(1, Ordering::Relaxed);
                    if let Err(err) = self.handle_tx_job(&job).await {
                        error!(tx_hash = %job.tx_hash, error = %err, "tx job failed, re-enqueueing");
                        if let Err(err) = self.queues.enqueue_tx(&job).await {
                            error!(tx_hash = %job.tx_hash, error = %err, "tx hint dropped");
                        }
                        if let Some(market_id) = job.market_id {
                            let _ = self.queues.enqueue_sweep(market_id).await;
                        }
                        tokio::time::sleep(Duration::from_millis(500)).await;
                    }
                    self.tx_inflight.fetch_sub(1, Ordering::Relaxed);
                }
                Ok(None) => {} // pop timeout, loop to re-check shutdown
                Err(err) => {
                    error!(error = %err, "tx queue unavailable");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
        info!("tx worker stopped");
    }

    /// Long-running sweep worker, parallel to the tx worker
    pub async fn run_sweep_worker(self: Arc<Self>, shutdown: watch::Receiver<bool>) {
        info!("sweep worker started");
        while !*shutdown.borrow() {
            match self.queues.pop_sweep().await {
                Ok(Some(job)) => {
                    self.sweep_inflight.fetch_add(1, Ordering::Relaxed);
                    if let Err(err) = self.handle_sweep_job(&job).await {
                        error!(market_id = %job.market_id, error = %err, "sweep failed");
                        tokio::time::sleep(Duration::from_millis(500)).await;
                    }
                    self.sweep_inflight.fetch_sub(1, Ordering::Relaxed);
                }
                Ok(None) => {}
                Err(err) => {
                    error!(error = %err, "sweep queue unavailable");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
        info!("sweep worker stopped");
    }
}
