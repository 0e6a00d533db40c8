//! HTTP handlers for the live-update API.

use std::convert::Infallible;

use axum::{
    Json,
    extract::State,
    http::{HeaderName, HeaderValue, StatusCode, header},
    response::{
        IntoResponse, Response,
        sse::{Event, KeepAlive, Sse},
    },
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio_stream::StreamExt;
use tracing::{info, instrument, warn};

use vestry_protocol::HEARTBEAT_TEXT;

use super::error::ApiResult;
use super::state::AppState;

/// Health check with the current channel count.
pub async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "channels": state.hub.channel_count(),
    }))
}

/// Open the live event stream.
///
/// The response is a continuous `text/event-stream`: the `connected`
/// handshake first, one `data:` frame per published event afterwards, and
/// `: heartbeat` comment frames at the configured interval so intermediary
/// proxies do not reap the idle connection. The channel deregisters itself
/// when the client goes away.
#[instrument(skip(state))]
pub async fn events_stream(State(state): State<AppState>) -> Response {
    let channel = state.hub.open();
    info!(channel_id = %channel.id(), "Attached to event stream");

    let stream = channel.map(|event| {
        let data = serde_json::to_string(&event).unwrap_or_else(|err| {
            warn!("Failed to serialize update event: {err}");
            "{\"error\":\"event_serialization_failed\"}".to_string()
        });
        Ok::<_, Infallible>(Event::default().data(data))
    });

    let mut response = Sse::new(stream)
        .keep_alive(
            KeepAlive::new()
                .interval(state.hub.heartbeat())
                .text(HEARTBEAT_TEXT),
        )
        .into_response();

    // Sse sets Content-Type; intermediaries additionally need response
    // buffering and caching off for frames to flow through unstalled.
    let headers = response.headers_mut();
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
    headers.insert(
        HeaderName::from_static("x-accel-buffering"),
        HeaderValue::from_static("no"),
    );
    response
}

/// Publish request body.
#[derive(Debug, Deserialize)]
pub struct PublishRequest {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: Value,
}

/// Publish response body.
#[derive(Debug, Serialize)]
pub struct PublishResponse {
    pub delivered: usize,
}

/// Broadcast a change notification to every open channel.
///
/// Mutation handlers call this after their persistence write has
/// committed. Fan-out is fire-and-forget: subscriber-side failures are
/// invisible to the caller.
#[instrument(skip_all)]
pub async fn publish_event(
    State(state): State<AppState>,
    Json(request): Json<PublishRequest>,
) -> ApiResult<(StatusCode, Json<PublishResponse>)> {
    let delivered = state.hub.publish(&request.kind, request.data);
    info!(kind = %request.kind, delivered, "Published update event");
    Ok((StatusCode::ACCEPTED, Json(PublishResponse { delivered })))
}
