use axum::{extract::State, http::StatusCode, Json};
use serde::Deserialize;

use crate::media::{StreamCommand, StreamState};
use crate::models::StreamRole;
use crate::state::ServiceContext;

#[derive(Deserialize)]
pub struct JoinStreamRequest {
    pub session_id: String,
    pub role: StreamRole,
}

pub async fn join_stream(
    State(ctx): State<ServiceContext>,
    Json(body): Json<JoinStreamRequest>,
) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
    ctx.media_tx
        .send(StreamCommand::JoinStream {
            session_id: body.session_id,
            role: body.role,
        })
        .await
        .map(|_| Json(serde_json::json!({"ok": true})))
        .map_err(|e| {
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to join stream: {}", e),
            )
        })
}

pub async fn leave_stream(
    State(ctx): State<ServiceContext>,
) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
    ctx.media_tx
        .send(StreamCommand::LeaveStream)
        .await
        .map(|_| Json(serde_json::json!({"ok": true})))
        .map_err(|e| {
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to leave stream: {}", e),
            )
        })
}

pub async fn get_state(
    State(ctx): State<ServiceContext>,
) -> Result<Json<StreamState>, (StatusCode, String)> {
    Ok(Json(ctx.stream_state_rx.borrow().clone()))
}

/// Latest quality snapshot; null while disconnected.
pub async fn get_quality(
    State(ctx): State<ServiceContext>,
) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
    let quality = ctx.quality_rx.borrow().clone();
    Ok(Json(serde_json::json!({ "quality": quality })))
}
