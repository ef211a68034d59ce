use axum::{extract::State, http::StatusCode, Json};

use crate::models::NotificationPrefs;
use crate::services;
use crate::state::ServiceContext;

pub async fn get_prefs(
    State(ctx): State<ServiceContext>,
) -> Result<Json<NotificationPrefs>, (StatusCode, String)> {
    Ok(Json(services::notifications::get_prefs(&ctx).await))
}

pub async fn set_prefs(
    State(ctx): State<ServiceContext>,
    Json(body): Json<NotificationPrefs>,
) -> Result<Json<NotificationPrefs>, (StatusCode, String)> {
    services::notifications::set_prefs(&ctx, body)
        .await
        .map(Json)
        .map_err(|e| (StatusCode::BAD_REQUEST, e))
}
