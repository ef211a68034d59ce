use axum::{extract::State, http::StatusCode, Json};
use serde::Deserialize;

use crate::models::Session;
use crate::services;
use crate::state::ServiceContext;

#[derive(Deserialize)]
pub struct SignInRequest {
    pub email: String,
    pub password: String,
}

pub async fn sign_in(
    State(ctx): State<ServiceContext>,
    Json(body): Json<SignInRequest>,
) -> Result<Json<Session>, (StatusCode, String)> {
    services::auth::sign_in(&ctx, &body.email, &body.password)
        .await
        .map(Json)
        .map_err(|e| (StatusCode::UNAUTHORIZED, e))
}

pub async fn sign_out(
    State(ctx): State<ServiceContext>,
) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
    services::auth::sign_out(&ctx)
        .await
        .map(|_| Json(serde_json::json!({"ok": true})))
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e))
}

pub async fn get_session(
    State(ctx): State<ServiceContext>,
) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
    let session = services::auth::current_session(&ctx);
    Ok(Json(serde_json::json!({ "session": session })))
}
