//! Reconciliation sweeper
//!
//! Periodic catch-all ingest path for when push subscriptions are missing
//! or lossy. Each cycle scans every known pool from its cursor to the safe
//! head (head minus confirmations), in windows chunked across at most 40
//! addresses per log request. A cursor that has fallen absurdly far behind
//! is warped forward to the safe head instead of replaying history.

use crate::chain::types::LogEntry;
use crate::chain::{types::LogFilter, ChainReader};
use crate::config::ReconConfig;
use crate::database::Store;
use crate::error::IndexerResult;
use crate::indexer::Indexer;
use crate::models::Market;
use alloy_primitives::Address;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Address-chunk bound per getLogs request
const MAX_ADDRESSES_PER_REQUEST: usize = 40;

pub struct ReconSweeper {
    store: Arc<dyn Store>,
    chain: Arc<dyn ChainReader>,
    indexer: Arc<Indexer>,
    cfg: ReconConfig,
}

impl ReconSweeper {
    pub fn new(
        store: Arc<dyn Store>,
        chain: Arc<dyn ChainReader>,
        indexer: Arc<Indexer>,
        cfg: ReconConfig,
    ) -> Self {
        Self {
            store,
            chain,
            indexer,
            cfg,
        }
    }

    /// Run cycles until shutdown. A failed cycle is logged and retried on
    /// the next tick.
    pub async fn run(self: Arc<Self>, shutdown: watch::Receiver<bool>) {
        info!(
            interval_ms = self.cfg.interval_ms,
            confirmations = self.cfg.confirmations,
            "reconciliation sweeper started"
        );
        let mut ticker = tokio::time::interval(Duration::from_millis(self.cfg.interval_ms));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        while !*shutdown.borrow() {
            ticker.tick().await;
            if *shutdown.borrow() {
                break;
            }
            if let Err(err) = self.run_cycle().await {
                error!(error = %err, "reconciliation cycle failed");
            }
        }
        info!("reconciliation sweeper stopped");
    }

    pub async fn run_cycle(&self) -> IndexerResult<()> {
        let head = self.chain.block_number().await?;
        let safe_head = head.saturating_sub(self.cfg.confirmations);
        if safe_head == 0 {
            return Ok(());
        }

        let pools = self.store.list_pool_addresses().await?;
        if pools.is_empty() {
            return Ok(());
        }

        // Load cursors and apply jump-to-head protection before grouping
        let mut pending: Vec<(Uuid, Market, Address, u64)> = Vec::new();
        for (market_id, pool) in pools {
            let Ok(address) = pool.parse::<Address>() else {
                warn!(%market_id, pool = %pool, "skipping unparseable pool address");
                continue;
            };
            let Some(market) = self.store.find_market_by_key(&market_id.to_string()).await? else {
                continue;
            };
            let sync = self
                .store
                .ensure_market_sync(market_id, self.cfg.baseline_block)
                .await?;
            let mut last = sync.last_indexed_block.max(0) as u64;

            if safe_head.saturating_sub(last) > self.cfg.jump_threshold {
                // Operator is recovering from a long outage; replaying the
                // whole gap is undesirable. Land exactly on the safe head so
                // no confirmed block is skipped past.
                let warped = safe_head;
                warn!(
                    %market_id,
                    from = last,
                    to = warped,
                    "cursor far behind, jumping to head"
                );
                self.store.advance_market_sync(market_id, warped, false).await?;
                last = warped;
            }
            if last < safe_head {
                pending.push((market_id, market, address, last));
            }
        }
        if pending.is_empty() {
            return Ok(());
        }

        for chunk in pending.chunks(MAX_ADDRESSES_PER_REQUEST) {
            if let Err(err) = self.sweep_chunk(chunk, safe_head).await {
                error!(error = %err, "address chunk sweep failed");
            }
        }
        Ok(())
    }

    /// One getLogs window shared by up to 40 pools, applied per market
    async fn sweep_chunk(
        &self,
        chunk: &[(Uuid, Market, Address, u64)],
        safe_head: u64,
    ) -> IndexerResult<()> {
        let window_start = chunk.iter().map(|(_, _, _, last)| *last).min().unwrap_or(0) + 1;
        let window_end =
            (window_start + self.cfg.scan_blocks_per_batch - 1).min(safe_head);
        let addresses: Vec<Address> = chunk.iter().map(|(_, _, address, _)| *address).collect();

        let mut logs = self
            .chain
            .logs(&LogFilter::range(window_start, window_end, addresses))
            .await?;
        logs.sort_by_key(|l| (l.block_number, l.log_index));

        let mut by_pool: HashMap<String, Vec<LogEntry>> = HashMap::new();
        for log in logs {
            by_pool
                .entry(format!("{:#x}", log.address))
                .or_default()
                .push(log);
        }

        for (market_id, market, address, _) in chunk {
            let market_logs = by_pool
                .remove(&format!("{address:#x}"))
                .unwrap_or_default();
            match self.indexer.process_market_logs(market, market_logs).await {
                Ok(applied) => {
                    self.store
                        .advance_market_sync(*market_id, window_end, false)
                        .await?;
                    if applied > 0 {
                        debug!(%market_id, applied, window_end, "reconciled window");
                    }
                }
                Err(err) => {
                    // Cursor stays put; the next cycle retries this window
                    error!(%market_id, error = %err, "reconcile apply failed");
                }
            }
        }
        Ok(())
    }
}
