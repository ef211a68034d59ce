use axum::{extract::State, http::StatusCode, Json};
use serde::Deserialize;

use crate::services;
use crate::state::ServiceContext;

#[derive(Deserialize)]
pub struct GiftRequest {
    pub recipient_id: String,
    pub gift_id: String,
    pub session_id: Option<String>,
}

pub async fn send_gift(
    State(ctx): State<ServiceContext>,
    Json(body): Json<GiftRequest>,
) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
    services::shop::send_gift(
        &ctx,
        &body.recipient_id,
        &body.gift_id,
        body.session_id.as_deref(),
    )
    .await
    .map(Json)
    .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e))
}

#[derive(Deserialize)]
pub struct PurchaseRequest {
    pub package_id: String,
}

pub async fn purchase_coins(
    State(ctx): State<ServiceContext>,
    Json(body): Json<PurchaseRequest>,
) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
    services::shop::purchase_coins(&ctx, &body.package_id)
        .await
        .map(Json)
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e))
}
