//! API response types

use crate::summary::{CandleDoc, MarketDoc, SpotDoc, TradeDoc};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;

/// Response for the markets list
#[derive(Debug, Serialize)]
pub struct MarketsResponse {
    pub markets: Vec<MarketDoc>,
    pub limit: usize,
    pub offset: usize,
}

/// Response for candle pages
#[derive(Debug, Serialize)]
pub struct CandlesResponse {
    pub candles: Vec<CandleDoc>,
    pub tf: String,
}

/// Response for trade pages
#[derive(Debug, Serialize)]
pub struct TradesResponse {
    pub trades: Vec<TradeDoc>,
}

/// Response for spot-series pages
#[derive(Debug, Serialize)]
pub struct SpotSeriesResponse {
    #[serde(rename = "spotSeries")]
    pub spot_series: Vec<SpotDoc>,
}

/// Response for webhook-style enqueue endpoints
#[derive(Debug, Serialize)]
pub struct QueuedResponse {
    pub queued: bool,
}

/// Webhook body enqueuing a transaction hint
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TxNotifyBody {
    pub tx_hash: String,
    #[serde(default)]
    pub market_id: Option<uuid::Uuid>,
}

/// Structured error body: `{ error: { code, message, timestamp } }`
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

pub fn error_response(status: StatusCode, code: &str, message: &str) -> Response {
    (
        status,
        Json(json!({
            "error": ErrorBody {
                code: code.to_string(),
                message: message.to_string(),
                timestamp: Utc::now(),
            }
        })),
    )
        .into_response()
}

pub fn market_not_found() -> Response {
    error_response(
        StatusCode::NOT_FOUND,
        "MARKET_NOT_FOUND",
        "no market for the given key",
    )
}
