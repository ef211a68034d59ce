use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};

use crate::state::ServiceContext;

pub async fn snapshot(
    State(ctx): State<ServiceContext>,
) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
    let mut online: Vec<String> = ctx.presence.online_users().into_iter().collect();
    online.sort();
    Ok(Json(serde_json::json!({ "online": online })))
}

pub async fn check_user(
    State(ctx): State<ServiceContext>,
    Path(user_id): Path<String>,
) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
    Ok(Json(serde_json::json!({
        "user_id": user_id,
        "online": ctx.presence.is_user_online(&user_id),
    })))
}

/// Activity ping from the frontend's interaction listeners.
pub async fn activity(
    State(ctx): State<ServiceContext>,
) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
    ctx.presence.update_activity();
    Ok(Json(serde_json::json!({"ok": true})))
}
