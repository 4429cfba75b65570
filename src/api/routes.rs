//! API route definitions

use super::{handlers, sse, ApiState};
use axum::routing::{get, patch, post};
use axum::Router;

/// Market read routes
pub fn create_market_routes() -> Router<ApiState> {
    Router::new()
        .route("/api/markets", get(handlers::list_markets))
        .route("/api/markets/:key/summary", get(handlers::market_summary))
        .route("/api/markets/:key/metrics", get(handlers::market_metrics))
        .route("/api/markets/:key/candles", get(handlers::market_candles))
        .route("/api/markets/:key/trades", get(handlers::market_trades))
        .route(
            "/api/markets/:key/spot-series",
            get(handlers::market_spot_series),
        )
        .route("/api/markets/:key/live", get(sse::market_live))
}

/// Ingest routes (webhook + reactive sweep)
pub fn create_ingest_routes() -> Router<ApiState> {
    Router::new()
        .route("/api/tx-notify", post(handlers::tx_notify))
        .route("/api/markets/:key/sweep", patch(handlers::market_sweep))
}

/// Operational routes
pub fn create_ops_routes() -> Router<ApiState> {
    Router::new().route("/healthz", get(handlers::healthz))
}
