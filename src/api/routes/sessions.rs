use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};

use crate::state::ServiceContext;

pub async fn list_viewers(
    State(ctx): State<ServiceContext>,
    Path(session_id): Path<String>,
) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
    let viewers = ctx.viewers.viewers(&session_id).await;
    Ok(Json(serde_json::json!({
        "watching": viewers.is_some(),
        "viewers": viewers.unwrap_or_default(),
    })))
}

pub async fn watch_viewers(
    State(ctx): State<ServiceContext>,
    Path(session_id): Path<String>,
) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
    ctx.viewers.watch(&session_id).await;
    Ok(Json(serde_json::json!({"ok": true})))
}

pub async fn unwatch_viewers(
    State(ctx): State<ServiceContext>,
    Path(session_id): Path<String>,
) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
    ctx.viewers.unwatch(&session_id).await;
    Ok(Json(serde_json::json!({"ok": true})))
}
