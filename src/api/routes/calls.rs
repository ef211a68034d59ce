use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};

use crate::state::ServiceContext;

pub async fn incoming(
    State(ctx): State<ServiceContext>,
) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
    Ok(Json(serde_json::json!({ "call": ctx.calls.current_prompt() })))
}

pub async fn accept(
    State(ctx): State<ServiceContext>,
    Path(call_id): Path<String>,
) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
    ctx.calls
        .accept(&call_id)
        .await
        .map(|_| Json(serde_json::json!({"ok": true})))
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e))
}

pub async fn reject(
    State(ctx): State<ServiceContext>,
    Path(call_id): Path<String>,
) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
    ctx.calls
        .reject(&call_id)
        .await
        .map(|_| Json(serde_json::json!({"ok": true})))
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e))
}
