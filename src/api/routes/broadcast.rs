//! Broadcast Routes
//!
//! Lets HTTP callers push a message to every connected WebSocket client.
//!
//! - POST /api/v1/broadcast - Broadcast the request body
//! - GET /api/v1/stats - Hub statistics

use axum::{
    body::Bytes,
    extract::State,
    http::{header, HeaderMap, StatusCode},
    Json,
};
use std::sync::Arc;

use crate::api::dto::{BroadcastResponse, StatsResponse};
use crate::api::error::{ApiError, ApiResult};
use crate::api::state::AppState;
use crate::websocket::Packet;

/// POST /api/v1/broadcast
///
/// `application/octet-stream` bodies go out as binary frames, everything
/// else as text (which must be valid UTF-8).
pub async fn broadcast(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<(StatusCode, Json<BroadcastResponse>)> {
    let packet = packet_from_body(&headers, body)?;
    let frame = packet.frame_type();
    let bytes = packet.len();

    state.hub.broadcast(packet).await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(BroadcastResponse {
            status: "queued".to_string(),
            frame,
            bytes,
            connections: state.hub.live_count(),
        }),
    ))
}

/// GET /api/v1/stats
pub async fn stats(State(state): State<Arc<AppState>>) -> ApiResult<Json<StatsResponse>> {
    let hub = state.hub.stats().await?;
    Ok(Json(StatsResponse {
        hub,
        full: state.hub.is_full(),
    }))
}

fn packet_from_body(headers: &HeaderMap, body: Bytes) -> ApiResult<Packet> {
    if body.is_empty() {
        return Err(ApiError::Validation("broadcast body is empty".to_string()));
    }

    let binary = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.starts_with("application/octet-stream"))
        .unwrap_or(false);

    if binary {
        return Ok(Packet::binary(body.to_vec()));
    }

    let text = String::from_utf8(body.to_vec())
        .map_err(|_| ApiError::Validation("text broadcast must be valid UTF-8".to_string()))?;
    Ok(Packet::text(text))
}
