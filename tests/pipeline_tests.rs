//! End-to-end pipeline tests over the in-process backends
//!
//! The scenarios drive the real indexer against the mock chain, in-memory
//! store, in-memory queues, and local bus, and assert the persisted state.

use alloy_primitives::{Address, B256, U256};
use caifu_indexer::amm::{tvl_scaled, yes_price_scaled};
use caifu_indexer::bus::{trades_topic, EventBus, LocalEventBus};
use caifu_indexer::chain::events::test_support::{buy_log, funding_added_log, relocate};
use caifu_indexer::chain::mock::MockChain;
use caifu_indexer::chain::types::LogEntry;
use caifu_indexer::config::{ReconConfig, SummaryConfig};
use caifu_indexer::database::{MemoryStore, Store};
use caifu_indexer::indexer::Indexer;
use caifu_indexer::models::{decimal_to_fixed18, Market, TxJob, SCALE};
use caifu_indexer::queue::{JobQueues, MemoryQueueBackend};
use caifu_indexer::recon::ReconSweeper;
use caifu_indexer::summary::SummaryAssembler;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

const ONE: u64 = 1_000_000_000_000_000_000;
const BUY_SHARES: u64 = 990_099_009_900_990_099;

fn one() -> U256 {
    U256::from(ONE)
}

fn tokens(n: u64) -> U256 {
    U256::from(n) * one()
}

struct Harness {
    store: Arc<MemoryStore>,
    chain: Arc<MockChain>,
    queues: Arc<JobQueues>,
    bus: Arc<LocalEventBus>,
    indexer: Arc<Indexer>,
    market: Market,
    pool: Address,
}

fn test_market(pool: Address) -> Market {
    Market {
        id: Uuid::new_v4(),
        slug: Some("will-it-rain".to_string()),
        condition_id: Some("0x01".to_string()),
        fpmm_address: Some(format!("{pool:#x}")),
        title: "Will it rain tomorrow?".to_string(),
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

fn fast_config() -> ReconConfig {
    ReconConfig {
        receipt_poll_ms: 10,
        max_receipt_attempts: 5,
        ..ReconConfig::default()
    }
}

async fn harness(head: u64) -> Harness {
    let pool = Address::repeat_byte(0xaa);
    let store = Arc::new(MemoryStore::new());
    let market = test_market(pool);
    store.insert_market(&market).await.unwrap();

    let chain = Arc::new(MockChain::new(head));
    let queues = Arc::new(JobQueues::new(
        Arc::new(MemoryQueueBackend::new()),
        Duration::from_secs(120),
    ));
    let bus = Arc::new(LocalEventBus::new());
    let indexer = Arc::new(Indexer::new(
        store.clone(),
        chain.clone(),
        queues.clone(),
        bus.clone(),
        fast_config(),
    ));
    Harness {
        store,
        chain,
        queues,
        bus,
        indexer,
        market,
        pool,
    }
}

/// Funding(100, 100) then Buy(1, fee 0, YES, 0.990099...) in block 10
fn s1_logs(pool: Address) -> Vec<LogEntry> {
    vec![
        funding_added_log(pool, tokens(100), tokens(100), 10, 0),
        buy_log(pool, one(), U256::ZERO, 0, U256::from(BUY_SHARES), 10, 1),
    ]
}

fn s1_tx_hash() -> String {
    format!("{:#x}", B256::repeat_byte(0xcc))
}

fn seed_s1(harness: &Harness) {
    let block_hash = B256::repeat_byte(0xbb);
    harness.chain.add_block(block_hash, 10, 1_700_000_010);
    harness
        .chain
        .add_transaction(&s1_tx_hash(), block_hash, 10, s1_logs(harness.pool));
}

async fn run_s1(harness: &Harness) {
    seed_s1(harness);
    harness
        .indexer
        .handle_tx_job(&TxJob {
            tx_hash: s1_tx_hash(),
            market_id: None,
        })
        .await
        .unwrap();
}

fn expected_s1_reserves() -> (U256, U256) {
    (tokens(100) - U256::from(BUY_SHARES), tokens(101))
}

#[tokio::test]
async fn s1_init_and_buy_produce_expected_state() {
    let harness = harness(12).await;
    let mut subscription = harness
        .bus
        .subscribe(&[trades_topic(harness.market.id)])
        .await
        .unwrap();

    run_s1(&harness).await;

    // Two liquidity events (init then trade), one trade, one candle, one spot
    assert_eq!(harness.store.row_counts(), (1, 2, 1, 1));

    let (yes, no) = harness
        .store
        .load_pool_reserves(harness.market.id)
        .await
        .unwrap();
    assert_eq!((yes, no), expected_s1_reserves());

    let latest = harness
        .store
        .latest_liquidity_event(harness.market.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(latest.kind, "trade");
    assert_eq!(decimal_to_fixed18(&latest.tvl_usdf), tvl_scaled(yes, no));

    // Candle closes at the post-trade spot
    let candle = harness
        .store
        .candles_page(harness.market.id, 10)
        .await
        .unwrap()
        .remove(0);
    assert_eq!(candle.bucket_start.timestamp(), 1_699_999_800);
    assert_eq!(
        decimal_to_fixed18(&candle.close),
        yes_price_scaled(yes, no)
    );
    assert_eq!(decimal_to_fixed18(&candle.volume_usdf), one());

    // Cursor advanced to the hint block
    let sync = harness
        .store
        .get_market_sync(harness.market.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(sync.last_indexed_block, 10);

    // One trade message then one indexed notification on the bus
    let (_, first) = tokio::time::timeout(Duration::from_secs(1), subscription.receiver.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(first.contains("\"type\":\"trade\""));
    assert!(first.contains("\"side\":\"buy\""));
    let (_, second) = tokio::time::timeout(Duration::from_secs(1), subscription.receiver.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(second.contains("\"type\":\"indexed\""));
    assert!(second.contains("\"lastIndexedBlock\":10"));
}

#[tokio::test]
async fn s2_duplicate_delivery_changes_nothing() {
    let harness = harness(12).await;
    run_s1(&harness).await;

    let before_counts = harness.store.row_counts();
    let before_reserves = harness
        .store
        .load_pool_reserves(harness.market.id)
        .await
        .unwrap();

    // Same hint delivered again in a second tx job
    harness
        .indexer
        .handle_tx_job(&TxJob {
            tx_hash: s1_tx_hash(),
            market_id: Some(harness.market.id),
        })
        .await
        .unwrap();

    assert_eq!(harness.store.row_counts(), before_counts);
    assert_eq!(
        harness
            .store
            .load_pool_reserves(harness.market.id)
            .await
            .unwrap(),
        before_reserves
    );
    let sync = harness
        .store
        .get_market_sync(harness.market.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(sync.last_indexed_block, 10);
}

#[tokio::test]
async fn s3_out_of_order_raw_logs_are_canonicalized() {
    let harness = harness(12).await;
    let block_hash = B256::repeat_byte(0xbb);
    harness.chain.add_block(block_hash, 10, 1_700_000_010);

    // Raw response delivers logIndex 1 before logIndex 0
    let mut logs = s1_logs(harness.pool);
    logs.reverse();
    harness
        .chain
        .add_transaction(&s1_tx_hash(), block_hash, 10, logs);

    harness
        .indexer
        .handle_tx_job(&TxJob {
            tx_hash: s1_tx_hash(),
            market_id: None,
        })
        .await
        .unwrap();

    assert_eq!(harness.store.row_counts(), (1, 2, 1, 1));
    assert_eq!(
        harness
            .store
            .load_pool_reserves(harness.market.id)
            .await
            .unwrap(),
        expected_s1_reserves()
    );
}

#[tokio::test]
async fn s4_storage_failure_recovers_through_sweep() {
    let harness = harness(400).await;

    // Funding lands in block 9 via its own transaction
    let funding_block = B256::repeat_byte(0xb9);
    let funding_tx = B256::repeat_byte(0xc9);
    let mut funding = funding_added_log(harness.pool, tokens(100), tokens(100), 9, 0);
    relocate(&mut funding, funding_block, funding_tx, 9);
    harness.chain.add_block(funding_block, 9, 1_699_999_700);
    harness.chain.add_transaction(
        &format!("{funding_tx:#x}"),
        funding_block,
        9,
        vec![funding],
    );
    harness
        .indexer
        .handle_tx_job(&TxJob {
            tx_hash: format!("{funding_tx:#x}"),
            market_id: None,
        })
        .await
        .unwrap();
    assert_eq!(harness.store.row_counts(), (0, 1, 0, 0));

    // The buy in block 10 hits a dead database
    let block_hash = B256::repeat_byte(0xbb);
    harness.chain.add_block(block_hash, 10, 1_700_000_010);
    harness.chain.add_transaction(
        &s1_tx_hash(),
        block_hash,
        10,
        vec![buy_log(
            harness.pool,
            one(),
            U256::ZERO,
            0,
            U256::from(BUY_SHARES),
            10,
            1,
        )],
    );
    harness.store.set_fail_writes(true);
    harness
        .indexer
        .handle_tx_job(&TxJob {
            tx_hash: s1_tx_hash(),
            market_id: None,
        })
        .await
        .unwrap();

    // Nothing for the buy persisted, cursor still at 9, recovery scheduled
    assert_eq!(harness.store.row_counts(), (0, 1, 0, 0));
    let sync = harness
        .store
        .get_market_sync(harness.market.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(sync.last_indexed_block, 9);
    assert_eq!(harness.queues.pending_counts().await.unwrap(), (0, 1));

    // Database comes back; the queued sweep drains the gap
    harness.store.set_fail_writes(false);
    let sweep = harness.queues.pop_sweep().await.unwrap().unwrap();
    harness.indexer.handle_sweep_job(&sweep).await.unwrap();

    assert_eq!(harness.store.row_counts(), (1, 2, 1, 1));
    assert_eq!(
        harness
            .store
            .load_pool_reserves(harness.market.id)
            .await
            .unwrap(),
        expected_s1_reserves()
    );
    let sync = harness
        .store
        .get_market_sync(harness.market.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(sync.last_indexed_block, 400);

    // Completed sweep released its dedupe lock
    assert!(harness.queues.enqueue_sweep(harness.market.id).await.unwrap());
}

#[tokio::test]
async fn receipt_lag_is_polled_through() {
    let harness = harness(12).await;
    seed_s1(&harness);
    harness.chain.delay_receipt(&s1_tx_hash(), 3);

    harness
        .indexer
        .handle_tx_job(&TxJob {
            tx_hash: s1_tx_hash(),
            market_id: None,
        })
        .await
        .unwrap();
    assert_eq!(harness.store.row_counts(), (1, 2, 1, 1));
}

#[tokio::test]
async fn exhausted_receipt_polls_requeue_the_hint() {
    let harness = harness(12).await;
    seed_s1(&harness);
    // More misses than the configured attempt budget
    harness.chain.delay_receipt(&s1_tx_hash(), 50);

    harness
        .indexer
        .handle_tx_job(&TxJob {
            tx_hash: s1_tx_hash(),
            market_id: None,
        })
        .await
        .unwrap();

    // Nothing applied, but the hint is back on the queue
    assert_eq!(harness.store.row_counts(), (0, 0, 0, 0));
    assert_eq!(harness.queues.pending_counts().await.unwrap(), (1, 0));
}

#[tokio::test]
async fn unknown_pool_logs_are_dropped() {
    let harness = harness(12).await;
    let block_hash = B256::repeat_byte(0xbb);
    harness.chain.add_block(block_hash, 10, 1_700_000_010);
    let stranger = Address::repeat_byte(0x99);
    harness
        .chain
        .add_transaction(&s1_tx_hash(), block_hash, 10, s1_logs(stranger));

    harness
        .indexer
        .handle_tx_job(&TxJob {
            tx_hash: s1_tx_hash(),
            market_id: None,
        })
        .await
        .unwrap();
    assert_eq!(harness.store.row_counts(), (0, 0, 0, 0));
}

#[tokio::test]
async fn maybe_enqueue_sweep_respects_throttle() {
    let harness = harness(0).await;
    harness
        .store
        .advance_market_sync(harness.market.id, 10, false)
        .await
        .unwrap();

    // Lag within the window: nothing to do
    harness.chain.set_head(200);
    assert!(!harness
        .indexer
        .maybe_enqueue_sweep(harness.market.id)
        .await
        .unwrap());

    // Large lag but cursor freshly updated and below 4x window: throttled.
    // The head memo is refreshed explicitly because it is cached for reads.
    harness.chain.set_head(1000);
    harness.indexer.refresh_head().await.unwrap();
    assert!(!harness
        .indexer
        .maybe_enqueue_sweep(harness.market.id)
        .await
        .unwrap());

    // Very large lag bypasses the cooldown
    harness.chain.set_head(5000);
    harness.indexer.refresh_head().await.unwrap();
    assert!(harness
        .indexer
        .maybe_enqueue_sweep(harness.market.id)
        .await
        .unwrap());
    assert_eq!(harness.queues.pending_counts().await.unwrap(), (0, 1));
}

#[tokio::test]
async fn recon_jump_warp_lands_on_safe_head() {
    let harness = harness(5000).await;
    let sweeper = ReconSweeper::new(
        harness.store.clone(),
        harness.chain.clone(),
        harness.indexer.clone(),
        ReconConfig {
            confirmations: 10,
            jump_threshold: 1000,
            ..fast_config()
        },
    );

    // Fresh market, cursor at 0: lag far past the threshold warps the
    // cursor to head - confirmations, never beyond it.
    sweeper.run_cycle().await.unwrap();
    let sync = harness
        .store
        .get_market_sync(harness.market.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(sync.last_indexed_block, 4990);

    // Events landing just past the warp point are swept on the next cycle
    let block_hash = B256::repeat_byte(0xb5);
    let tx_hash = B256::repeat_byte(0xc5);
    harness.chain.add_block(block_hash, 4995, 1_700_000_310);
    let mut funding = funding_added_log(harness.pool, tokens(100), tokens(100), 4995, 0);
    relocate(&mut funding, block_hash, tx_hash, 4995);
    let mut buy = buy_log(
        harness.pool,
        one(),
        U256::ZERO,
        0,
        U256::from(BUY_SHARES),
        4995,
        1,
    );
    relocate(&mut buy, block_hash, tx_hash, 4995);
    harness
        .chain
        .add_transaction(&format!("{tx_hash:#x}"), block_hash, 4995, vec![funding, buy]);
    harness.chain.set_head(5010);

    sweeper.run_cycle().await.unwrap();

    assert_eq!(harness.store.row_counts(), (1, 2, 1, 1));
    let sync = harness
        .store
        .get_market_sync(harness.market.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(sync.last_indexed_block, 5000);
}

#[tokio::test]
async fn s6_summary_survives_a_slow_volume_query() {
    let harness = harness(12).await;
    run_s1(&harness).await;

    let assembler = SummaryAssembler::new(
        harness.store.clone(),
        harness.chain.clone(),
        harness.indexer.clone(),
        SummaryConfig {
            timeout_ms: 50,
            onchain_probe_cooldown_ms: 60_000,
        },
    );
    harness
        .store
        .set_volume_delay(Some(Duration::from_millis(300)));

    let outcome = assembler.summary("will-it-rain").await.unwrap();
    let doc = outcome.document;

    assert!(doc.cache.stale);
    assert_eq!(doc.metrics.volume_24h_usdf, "0");
    // Everything else still populated
    assert_eq!(doc.trades.len(), 1);
    assert_eq!(doc.candles.len(), 1);
    let (yes, no) = expected_s1_reserves();
    assert_eq!(
        doc.metrics.spot.yes_price,
        yes_price_scaled(yes, no).to_string()
    );
    assert_eq!(doc.cache.last_indexed_block, 10);
}

#[tokio::test]
async fn summary_resolves_case_insensitive_slug_and_excludes_deleted() {
    let harness = harness(12).await;
    run_s1(&harness).await;

    let assembler = SummaryAssembler::new(
        harness.store.clone(),
        harness.chain.clone(),
        harness.indexer.clone(),
        SummaryConfig::default(),
    );
    assert!(assembler.summary("WILL-IT-RAIN").await.is_ok());
    assert!(assembler.summary("nope").await.is_err());

    let mut deleted = harness.market.clone();
    deleted.status = "deleted".to_string();
    harness.store.insert_market(&deleted).await.unwrap();
    assert!(assembler.summary("will-it-rain").await.is_err());
}

#[tokio::test]
async fn idempotence_across_tx_and_sweep_paths() {
    // Applying the same events through the hint path and then a sweep
    // window yields the same store contents as one application.
    let harness = harness(400).await;
    run_s1(&harness).await;
    let counts = harness.store.row_counts();
    let reserves = harness
        .store
        .load_pool_reserves(harness.market.id)
        .await
        .unwrap();

    // Force a sweep over the same range
    harness
        .store
        .set_market_sync_block(harness.market.id, 9)
        .await
        .unwrap();
    assert!(harness.queues.enqueue_sweep(harness.market.id).await.unwrap());
    let sweep = harness.queues.pop_sweep().await.unwrap().unwrap();
    harness.indexer.handle_sweep_job(&sweep).await.unwrap();

    assert_eq!(harness.store.row_counts(), counts);
    assert_eq!(
        harness
            .store
            .load_pool_reserves(harness.market.id)
            .await
            .unwrap(),
        reserves
    );
}

#[tokio::test]
async fn candle_volume_accumulates_within_a_bucket() {
    let harness = harness(12).await;
    let block_hash = B256::repeat_byte(0xbb);
    harness.chain.add_block(block_hash, 10, 1_700_000_010);

    // Two buys in the same 5-minute bucket
    let logs = vec![
        funding_added_log(harness.pool, tokens(100), tokens(100), 10, 0),
        buy_log(harness.pool, one(), U256::ZERO, 0, U256::from(BUY_SHARES), 10, 1),
        buy_log(harness.pool, tokens(2), U256::ZERO, 1, one(), 10, 2),
    ];
    harness
        .chain
        .add_transaction(&s1_tx_hash(), block_hash, 10, logs);
    harness
        .indexer
        .handle_tx_job(&TxJob {
            tx_hash: s1_tx_hash(),
            market_id: None,
        })
        .await
        .unwrap();

    let candle = harness
        .store
        .candles_page(harness.market.id, 10)
        .await
        .unwrap()
        .remove(0);
    // volume = 1 + 2, close = spot after the second buy
    assert_eq!(decimal_to_fixed18(&candle.volume_usdf), tokens(3));
    let (yes, no) = harness
        .store
        .load_pool_reserves(harness.market.id)
        .await
        .unwrap();
    assert_eq!(decimal_to_fixed18(&candle.close), yes_price_scaled(yes, no));
    assert!(decimal_to_fixed18(&candle.high) <= U256::from(SCALE));
}
