//! API request handlers

use super::responses::*;
use super::ApiState;
use crate::error::IndexerError;
use crate::models::Market;
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Deserialize;
use serde_json::json;
use std::time::Instant;
use tracing::error;

const SUMMARY_CACHE_CONTROL: &str = "public, max-age=15, stale-while-revalidate=60";
const SUMMARY_VARY: &str = "Accept,Accept-Encoding,If-None-Match";

/// Query parameters for paged reads
#[derive(Deserialize)]
pub struct PageQuery {
    pub limit: Option<i64>,
    pub offset: Option<i64>,
    pub before: Option<String>,
    pub tf: Option<String>,
}

fn clamp_limit(limit: Option<i64>, default: i64) -> i64 {
    limit.unwrap_or(default).clamp(1, 500)
}

fn http_date(ts: DateTime<Utc>) -> String {
    ts.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

/// Resolve a market or produce the structured 404/503 response
pub(super) async fn resolve_or_404(state: &ApiState, key: &str) -> Result<Market, Response> {
    match state.assembler.resolve_market(key).await {
        Ok(market) => Ok(market),
        Err(IndexerError::MarketUnknown { .. }) => Err(market_not_found()),
        Err(err) => {
            error!(key = %key, error = %err, "market resolution failed");
            Err(error_response(
                StatusCode::SERVICE_UNAVAILABLE,
                "STORAGE_UNAVAILABLE",
                "market lookup failed",
            ))
        }
    }
}

/// Bearer-token guard for the mutation endpoints
fn authorized(state: &ApiState, headers: &HeaderMap) -> bool {
    let Some(expected) = &state.tx_notify_token else {
        return true;
    };
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .is_some_and(|token| token == expected)
}

/// `GET /api/markets`
pub async fn list_markets(
    State(state): State<ApiState>,
    Query(page): Query<PageQuery>,
) -> Response {
    let limit = clamp_limit(page.limit, 50);
    let offset = page.offset.unwrap_or(0).max(0);
    match state.store.list_markets(limit, offset).await {
        Ok(markets) => Json(MarketsResponse {
            markets: markets.iter().map(crate::summary::MarketDoc::from).collect(),
            limit: limit as usize,
            offset: offset as usize,
        })
        .into_response(),
        Err(err) => {
            error!(error = %err, "market list failed");
            error_response(
                StatusCode::SERVICE_UNAVAILABLE,
                "STORAGE_UNAVAILABLE",
                "market list failed",
            )
        }
    }
}

/// `GET /api/markets/:key/summary`
pub async fn market_summary(
    State(state): State<ApiState>,
    Path(key): Path<String>,
    headers: HeaderMap,
) -> Response {
    let outcome = match state.assembler.summary(&key).await {
        Ok(outcome) => outcome,
        Err(IndexerError::MarketUnknown { .. }) => return market_not_found(),
        Err(err) => {
            error!(key = %key, error = %err, "summary failed");
            return error_response(
                StatusCode::SERVICE_UNAVAILABLE,
                "STORAGE_UNAVAILABLE",
                "summary unavailable",
            );
        }
    };

    let mut response_headers = HeaderMap::new();
    if let Ok(value) = HeaderValue::from_str(&outcome.etag) {
        response_headers.insert(header::ETAG, value);
    }
    response_headers.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static(SUMMARY_CACHE_CONTROL),
    );
    response_headers.insert(header::VARY, HeaderValue::from_static(SUMMARY_VARY));
    if let Some(last_modified) = outcome.last_modified {
        if let Ok(value) = HeaderValue::from_str(&http_date(last_modified)) {
            response_headers.insert(header::LAST_MODIFIED, value);
        }
    }

    let matched = headers
        .get(header::IF_NONE_MATCH)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v == outcome.etag);
    if matched {
        return (StatusCode::NOT_MODIFIED, response_headers).into_response();
    }
    (response_headers, Json(outcome.document)).into_response()
}

/// `GET /api/markets/:key/metrics`
pub async fn market_metrics(State(state): State<ApiState>, Path(key): Path<String>) -> Response {
    match state.assembler.summary(&key).await {
        Ok(outcome) => Json(outcome.document.metrics).into_response(),
        Err(IndexerError::MarketUnknown { .. }) => market_not_found(),
        Err(err) => {
            error!(key = %key, error = %err, "metrics failed");
            error_response(
                StatusCode::SERVICE_UNAVAILABLE,
                "STORAGE_UNAVAILABLE",
                "metrics unavailable",
            )
        }
    }
}

/// `GET /api/markets/:key/candles?tf=5m&limit=`
pub async fn market_candles(
    State(state): State<ApiState>,
    Path(key): Path<String>,
    Query(page): Query<PageQuery>,
) -> Response {
    let tf = page.tf.clone().unwrap_or_else(|| "5m".to_string());
    if tf != "5m" {
        return error_response(
            StatusCode::BAD_REQUEST,
            "UNSUPPORTED_TIMEFRAME",
            "only the 5m timeframe is available",
        );
    }
    let market = match resolve_or_404(&state, &key).await {
        Ok(market) => market,
        Err(response) => return response,
    };
    match state
        .store
        .candles_page(market.id, clamp_limit(page.limit, 288))
        .await
    {
        Ok(candles) => Json(CandlesResponse {
            candles: candles.iter().map(crate::summary::CandleDoc::from).collect(),
            tf,
        })
        .into_response(),
        Err(err) => {
            error!(key = %key, error = %err, "candles read failed");
            error_response(
                StatusCode::SERVICE_UNAVAILABLE,
                "STORAGE_UNAVAILABLE",
                "candles unavailable",
            )
        }
    }
}

/// `GET /api/markets/:key/trades?limit=&before=`
pub async fn market_trades(
    State(state): State<ApiState>,
    Path(key): Path<String>,
    Query(page): Query<PageQuery>,
) -> Response {
    let before = match &page.before {
        None => None,
        Some(raw) => match DateTime::parse_from_rfc3339(raw) {
            Ok(ts) => Some(ts.with_timezone(&Utc)),
            Err(_) => {
                return error_response(
                    StatusCode::BAD_REQUEST,
                    "INVALID_CURSOR",
                    "before must be an ISO-8601 timestamp",
                )
            }
        },
    };
    let market = match resolve_or_404(&state, &key).await {
        Ok(market) => market,
        Err(response) => return response,
    };
    match state
        .store
        .trades_page(market.id, clamp_limit(page.limit, 50), before)
        .await
    {
        Ok(trades) => Json(TradesResponse {
            trades: trades.iter().map(crate::summary::TradeDoc::from).collect(),
        })
        .into_response(),
        Err(err) => {
            error!(key = %key, error = %err, "trades read failed");
            error_response(
                StatusCode::SERVICE_UNAVAILABLE,
                "STORAGE_UNAVAILABLE",
                "trades unavailable",
            )
        }
    }
}

/// `GET /api/markets/:key/spot-series?limit=`
pub async fn market_spot_series(
    State(state): State<ApiState>,
    Path(key): Path<String>,
    Query(page): Query<PageQuery>,
) -> Response {
    let market = match resolve_or_404(&state, &key).await {
        Ok(market) => market,
        Err(response) => return response,
    };
    match state
        .store
        .spot_series_page(market.id, clamp_limit(page.limit, 288))
        .await
    {
        Ok(points) => Json(SpotSeriesResponse {
            spot_series: points.iter().map(crate::summary::SpotDoc::from).collect(),
        })
        .into_response(),
        Err(err) => {
            error!(key = %key, error = %err, "spot series read failed");
            error_response(
                StatusCode::SERVICE_UNAVAILABLE,
                "STORAGE_UNAVAILABLE",
                "spot series unavailable",
            )
        }
    }
}

/// `POST /api/tx-notify` — webhook feeding the tx queue
pub async fn tx_notify(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Json(body): Json<TxNotifyBody>,
) -> Response {
    if !authorized(&state, &headers) {
        return error_response(StatusCode::UNAUTHORIZED, "UNAUTHORIZED", "bad bearer token");
    }
    let hash = body.tx_hash.trim();
    let valid = hash.len() == 66
        && hash.starts_with("0x")
        && hash[2..].chars().all(|c| c.is_ascii_hexdigit());
    if !valid {
        return error_response(
            StatusCode::BAD_REQUEST,
            "INVALID_TX_HASH",
            "txHash must be 32 bytes of 0x-prefixed hex",
        );
    }

    let job = crate::models::TxJob {
        tx_hash: hash.to_lowercase(),
        market_id: body.market_id,
    };
    match state.queues.enqueue_tx(&job).await {
        Ok(()) => Json(QueuedResponse { queued: true }).into_response(),
        Err(err) => {
            error!(error = %err, "tx-notify enqueue failed");
            error_response(
                StatusCode::SERVICE_UNAVAILABLE,
                "QUEUE_UNAVAILABLE",
                "could not enqueue transaction hint",
            )
        }
    }
}

/// `PATCH /api/markets/:key/sweep`
pub async fn market_sweep(
    State(state): State<ApiState>,
    Path(key): Path<String>,
    headers: HeaderMap,
) -> Response {
    if !authorized(&state, &headers) {
        return error_response(StatusCode::UNAUTHORIZED, "UNAUTHORIZED", "bad bearer token");
    }
    let market = match resolve_or_404(&state, &key).await {
        Ok(market) => market,
        Err(response) => return response,
    };
    match state.queues.enqueue_sweep(market.id).await {
        Ok(queued) => Json(QueuedResponse { queued }).into_response(),
        Err(err) => {
            error!(error = %err, "sweep enqueue failed");
            error_response(
                StatusCode::SERVICE_UNAVAILABLE,
                "QUEUE_UNAVAILABLE",
                "could not enqueue sweep",
            )
        }
    }
}

/// `GET /healthz`
pub async fn healthz(State(state): State<ApiState>) -> Response {
    if state.healthz_cache_ms > 0 {
        let cache = state.health_cache.lock().unwrap();
        if let Some((at, body)) = cache.as_ref() {
            if at.elapsed().as_millis() < state.healthz_cache_ms as u128 {
                return Json(body.clone()).into_response();
            }
        }
    }

    let db_ok = state.store.health_check().await.is_ok();
    let telemetry = state.gateway.telemetry().await;
    let (tx_pending, sweep_pending) = state.queues.pending_counts().await.unwrap_or((0, 0));
    let (tx_inflight, sweep_inflight) = state.indexer.inflight();
    let head = state.indexer.latest_head().await.ok();
    let lag_top = match head {
        Some(head) => state
            .store
            .lagging_markets(head, 5)
            .await
            .unwrap_or_default(),
        None => Vec::new(),
    };

    let qps_over_budget = telemetry.qps_1m > u64::from(state.max_qps) * 60;
    let contract_missing = state
        .contracts
        .iter()
        .any(|c| c.deployed == Some(false));
    let status = if !db_ok || head.is_none() {
        "alert"
    } else if qps_over_budget || contract_missing {
        "warn"
    } else {
        "ok"
    };

    let last_429 = telemetry
        .last_429_at
        .and_then(|ms| DateTime::<Utc>::from_timestamp_millis(ms))
        .map(|ts| ts.to_rfc3339_opts(SecondsFormat::Millis, true));
    let body = json!({
        "status": status,
        "recon": {
            "mode": state.recon_mode,
            "qps1m": telemetry.qps_1m,
            "backoffMs": telemetry.backoff_ms,
            "last429At": last_429,
            "jobs": {
                "txPending": tx_pending,
                "sweepPending": sweep_pending,
                "inflight": tx_inflight + sweep_inflight,
            },
            "head": { "block": head },
            "marketsLagTop": lag_top.iter().map(|m| json!({
                "marketId": m.market_id,
                "slug": m.slug,
                "lagBlocks": m.lag_blocks,
                "lastIndexedBlock": m.last_indexed_block,
            })).collect::<Vec<_>>(),
        },
        "rpc": {
            "qps1m": telemetry.qps_1m,
            "backoffMs": telemetry.backoff_ms,
            "last429At": last_429,
            "maxQps": state.max_qps,
        },
        "contracts": state.contracts.iter().map(|c| json!({
            "name": c.name,
            "address": c.address,
            "deployed": c.deployed,
        })).collect::<Vec<_>>(),
    });

    if state.healthz_cache_ms > 0 {
        let mut cache = state.health_cache.lock().unwrap();
        *cache = Some((Instant::now(), body.clone()));
    }
    Json(body).into_response()
}
