//! HTTP surface for the indexed market data

mod handlers;
mod responses;
mod routes;
mod sse;

pub use routes::*;

use crate::bus::EventBus;
use crate::chain::RpcGateway;
use crate::config::{ApiConfig, ContractsConfig};
use crate::database::Store;
use crate::indexer::Indexer;
use crate::queue::JobQueues;
use crate::summary::SummaryAssembler;
use anyhow::Result;
use axum::Router;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;

/// Startup deployment check result for a known contract
#[derive(Debug, Clone)]
pub struct ContractStatus {
    pub name: &'static str,
    pub address: Option<String>,
    /// None when unconfigured or unchecked
    pub deployed: Option<bool>,
}

impl ContractStatus {
    pub fn unchecked(name: &'static str, contracts: &ContractsConfig) -> Self {
        let address = match name {
            "marketFactory" => contracts.market_factory_address.clone(),
            "ctf" => contracts.ctf_address.clone(),
            _ => contracts.usdf_address.clone(),
        };
        Self {
            name,
            address,
            deployed: None,
        }
    }
}

/// Shared API state
#[derive(Clone)]
pub struct ApiState {
    pub store: Arc<dyn Store>,
    pub assembler: Arc<SummaryAssembler>,
    pub indexer: Arc<Indexer>,
    pub queues: Arc<JobQueues>,
    pub bus: Arc<dyn EventBus>,
    pub gateway: Arc<RpcGateway>,
    pub contracts: Arc<Vec<ContractStatus>>,
    pub recon_mode: String,
    pub tx_notify_token: Option<String>,
    pub max_qps: u32,
    pub healthz_cache_ms: u64,
    pub health_cache: Arc<Mutex<Option<(Instant, serde_json::Value)>>>,
}

/// Create the application router
pub fn create_app(state: ApiState, enable_cors: bool) -> Router {
    let mut app = Router::new()
        .merge(create_market_routes())
        .merge(create_ingest_routes())
        .merge(create_ops_routes())
        .with_state(state);

    if enable_cors {
        app = app.layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        );
    } else {
        app = app.layer(TraceLayer::new_for_http());
    }
    app
}

/// Start the API server
pub async fn start_server(state: ApiState, config: &ApiConfig) -> Result<tokio::task::JoinHandle<()>> {
    let app = create_app(state, config.enable_cors);

    let listener = TcpListener::bind(&config.bind_address).await?;
    info!("API server listening on {}", config.bind_address);

    let handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!("API server error: {}", e);
        }
    });

    Ok(handle)
}
