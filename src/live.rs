//! Live ingestor
//!
//! Maintains push subscriptions (`eth_subscribe` over WebSocket) for every
//! known pool plus the pool factory. Received logs are only turned into
//! transaction hints for the on-demand indexer; nothing is decoded or
//! persisted here. The watch-list refreshes periodically by reconnecting
//! with a fresh address set; subscription errors are logged and the
//! reconciliation sweeper covers any gap.

use crate::chain::events::decode_created_pool;
use crate::chain::types::LogEntry;
use crate::config::ContractsConfig;
use crate::database::Store;
use crate::error::{IndexerError, IndexerResult, NetworkError};
use crate::models::TxJob;
use crate::queue::JobQueues;
use alloy_primitives::Address;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Watch-list refresh cadence
const REFRESH_INTERVAL: Duration = Duration::from_secs(60);

/// Delay before reconnecting after a stream error
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

pub struct LiveIngestor {
    store: Arc<dyn Store>,
    queues: Arc<JobQueues>,
    ws_url: String,
    factory: Option<Address>,
    /// Pools seen via factory creation events but not yet registered
    extra_pools: Mutex<HashSet<Address>>,
}

impl LiveIngestor {
    pub fn new(
        store: Arc<dyn Store>,
        queues: Arc<JobQueues>,
        ws_url: String,
        contracts: &ContractsConfig,
    ) -> Self {
        let factory = contracts
            .market_factory_address
            .as_deref()
            .and_then(|a| a.parse().ok());
        Self {
            store,
            queues,
            ws_url,
            factory,
            extra_pools: Mutex::new(HashSet::new()),
        }
    }

    pub async fn run(self: Arc<Self>, shutdown: watch::Receiver<bool>) {
        info!(url = %self.ws_url, "live ingestor started");
        while !*shutdown.borrow() {
            let watch_list = match self.build_watch_list().await {
                Ok(list) => list,
                Err(err) => {
                    warn!(error = %err, "watch-list load failed");
                    tokio::time::sleep(RECONNECT_DELAY).await;
                    continue;
                }
            };
            if watch_list.is_empty() && self.factory.is_none() {
                tokio::time::sleep(REFRESH_INTERVAL).await;
                continue;
            }

            match self.run_connection(&watch_list, shutdown.clone()).await {
                Ok(()) => debug!("subscription cycle ended, refreshing watch list"),
                Err(err) => {
                    warn!(error = %err, "subscription error, sweeper covers the gap");
                    tokio::time::sleep(RECONNECT_DELAY).await;
                }
            }
        }
        info!("live ingestor stopped");
    }

    /// Registered pools plus factory-created pools awaiting registration
    async fn build_watch_list(&self) -> IndexerResult<HashMap<Address, Option<Uuid>>> {
        let mut watch: HashMap<Address, Option<Uuid>> = HashMap::new();
        for (market_id, pool) in self.store.list_pool_addresses().await? {
            if let Ok(address) = pool.parse::<Address>() {
                watch.insert(address, Some(market_id));
            }
        }
        for address in self.extra_pools.lock().unwrap().iter() {
            watch.entry(*address).or_insert(None);
        }
        Ok(watch)
    }

    /// One subscription lifetime: subscribe, forward hints, return on the
    /// refresh tick so the caller reconnects with a fresh address set.
    async fn run_connection(
        &self,
        watch_list: &HashMap<Address, Option<Uuid>>,
        mut shutdown: watch::Receiver<bool>,
    ) -> IndexerResult<()> {
        let (stream, _) = connect_async(&self.ws_url).await.map_err(|e| {
            IndexerError::Network(NetworkError::ConnectionFailed(e.to_string()))
        })?;
        let (mut sink, mut source) = stream.split();

        let addresses: Vec<String> = watch_list
            .keys()
            .map(|a| format!("{a:#x}"))
            .collect();
        if !addresses.is_empty() {
            let subscribe = json!({
                "jsonrpc": "2.0",
                "id": 1,
                "method": "eth_subscribe",
                "params": ["logs", { "address": addresses }],
            });
            sink.send(Message::Text(subscribe.to_string()))
                .await
                .map_err(|e| {
                    IndexerError::Network(NetworkError::Subscription(e.to_string()))
                })?;
        }
        if let Some(factory) = self.factory {
            let subscribe = json!({
                "jsonrpc": "2.0",
                "id": 2,
                "method": "eth_subscribe",
                "params": ["logs", { "address": format!("{factory:#x}") }],
            });
            sink.send(Message::Text(subscribe.to_string()))
                .await
                .map_err(|e| {
                    IndexerError::Network(NetworkError::Subscription(e.to_string()))
                })?;
        }
        info!(pools = watch_list.len(), "push subscriptions established");

        let mut refresh = tokio::time::interval(REFRESH_INTERVAL);
        refresh.tick().await; // first tick completes immediately

        loop {
            tokio::select! {
                _ = refresh.tick() => return Ok(()),
                _ = shutdown.changed() => return Ok(()),
                message = source.next() => {
                    match message {
                        Some(Ok(Message::Text(text))) => {
                            self.handle_frame(&text, watch_list).await;
                        }
                        Some(Ok(Message::Ping(payload))) => {
                            let _ = sink.send(Message::Pong(payload)).await;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(err)) => {
                            return Err(IndexerError::Network(NetworkError::Subscription(
                                err.to_string(),
                            )));
                        }
                        None => {
                            return Err(IndexerError::Network(NetworkError::Subscription(
                                "stream closed".to_string(),
                            )));
                        }
                    }
                }
            }
        }
    }

    async fn handle_frame(&self, text: &str, watch_list: &HashMap<Address, Option<Uuid>>) {
        let Ok(frame) = serde_json::from_str::<Value>(text) else {
            return;
        };
        if frame.get("method").and_then(Value::as_str) != Some("eth_subscription") {
            return; // subscription confirmations and keepalives
        }
        let Some(raw_log) = frame.pointer("/params/result") else {
            return;
        };
        let Ok(log) = serde_json::from_value::<LogEntry>(raw_log.clone()) else {
            debug!("unparseable subscription log dropped");
            return;
        };
        if log.removed {
            return;
        }

        // Factory creation extends the watch set before the market exists
        if Some(log.address) == self.factory {
            if let Some(pool) = decode_created_pool(&log) {
                info!(pool = %format!("{pool:#x}"), "factory created pool, watching");
                self.extra_pools.lock().unwrap().insert(pool);
            }
        }

        let market_id = watch_list.get(&log.address).copied().flatten();
        let job = TxJob {
            tx_hash: format!("{:#x}", log.transaction_hash),
            market_id,
        };
        if let Err(err) = self.queues.enqueue_tx(&job).await {
            warn!(tx_hash = %job.tx_hash, error = %err, "tx hint enqueue failed");
        }
    }
}
