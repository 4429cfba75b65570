//! Server-sent-event broadcaster
//!
//! One long-lived stream per client, fed by exactly one bus subscription
//! covering the market's trade and comment topics. A heartbeat comment
//! every 15 seconds keeps intermediaries from closing the connection.
//! Dropping the response tears down the subscription.

use super::handlers::resolve_or_404;
use super::ApiState;
use crate::bus::{comments_topic, trades_topic};
use axum::extract::{Path, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use futures_util::Stream;
use std::convert::Infallible;
use std::time::Duration;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tracing::{debug, error};

const HEARTBEAT: Duration = Duration::from_secs(15);

/// `GET /api/markets/:key/live`
pub async fn market_live(
    State(state): State<ApiState>,
    Path(key): Path<String>,
) -> Response {
    let market = match resolve_or_404(&state, &key).await {
        Ok(market) => market,
        Err(response) => return response,
    };

    let topics = vec![trades_topic(market.id), comments_topic(market.id)];
    let subscription = match state.bus.subscribe(&topics).await {
        Ok(subscription) => subscription,
        Err(err) => {
            error!(market_id = %market.id, error = %err, "bus subscribe failed");
            return super::responses::error_response(
                axum::http::StatusCode::SERVICE_UNAVAILABLE,
                "BUS_UNAVAILABLE",
                "live stream temporarily unavailable",
            );
        }
    };
    debug!(market_id = %market.id, "sse stream opened");

    let stream: std::pin::Pin<
        Box<dyn Stream<Item = Result<Event, Infallible>> + Send>,
    > = Box::pin(
        ReceiverStream::new(subscription.receiver)
            .map(|(_topic, payload)| Ok(Event::default().data(payload))),
    );

    Sse::new(stream)
        .keep_alive(KeepAlive::new().interval(HEARTBEAT).text("ping"))
        .into_response()
}
