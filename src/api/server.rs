use axum::{routing::{get, post}, Json, Router};
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::api::{routes, websocket};
use crate::state::ServiceContext;

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({"status": "ok"}))
}

pub fn build_router(ctx: ServiceContext) -> Router {
    Router::new()
        // Health
        .route("/api/v1/health", get(health))
        // Auth
        .route("/api/v1/auth/sign-in", post(routes::auth::sign_in))
        .route("/api/v1/auth/sign-out", post(routes::auth::sign_out))
        .route("/api/v1/auth/session", get(routes::auth::get_session))
        // Presence
        .route("/api/v1/presence", get(routes::presence::snapshot))
        .route("/api/v1/presence/activity", post(routes::presence::activity))
        .route("/api/v1/presence/:user_id", get(routes::presence::check_user))
        // Viewer registry
        .route("/api/v1/sessions/:session_id/viewers", get(routes::sessions::list_viewers))
        .route("/api/v1/sessions/:session_id/viewers/watch", post(routes::sessions::watch_viewers))
        .route("/api/v1/sessions/:session_id/viewers/unwatch", post(routes::sessions::unwatch_viewers))
        // Stream (media engine)
        .route("/api/v1/stream/join", post(routes::stream::join_stream))
        .route("/api/v1/stream/leave", post(routes::stream::leave_stream))
        .route("/api/v1/stream/state", get(routes::stream::get_state))
        .route("/api/v1/stream/quality", get(routes::stream::get_quality))
        // Calls
        .route("/api/v1/calls/incoming", get(routes::calls::incoming))
        .route("/api/v1/calls/:call_id/accept", post(routes::calls::accept))
        .route("/api/v1/calls/:call_id/reject", post(routes::calls::reject))
        // Notifications
        .route(
            "/api/v1/notifications",
            get(routes::notifications::get_prefs).put(routes::notifications::set_prefs),
        )
        // Shop
        .route("/api/v1/shop/gift", post(routes::shop::send_gift))
        .route("/api/v1/shop/purchase", post(routes::shop::purchase_coins))
        // WebSocket
        .route("/ws", get(websocket::ws_handler))
        // Middleware
        .layer(CorsLayer::permissive())
        .with_state(ctx)
}

pub async fn start_api_server(ctx: ServiceContext, port: u16) {
    let router = build_router(ctx);
    let addr = format!("127.0.0.1:{}", port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("Failed to bind API server");
    info!("API server listening on http://{}", addr);
    axum::serve(listener, router)
        .await
        .expect("API server error");
}
