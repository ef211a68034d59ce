pub mod api;
pub mod backend;
pub mod config;
pub mod events;
pub mod media;
pub mod models;
pub mod services;
pub mod state;

use std::sync::Arc;

use tokio::sync::{mpsc, watch, Mutex as TokioMutex};
use tracing::{info, warn};

use crate::backend::realtime::RealtimeClient;
use crate::backend::Backend;
use crate::config::AppConfig;
use crate::events::create_event_bus;
use crate::media::{StreamCommand, StreamState};
use crate::models::NotificationPrefs;
use crate::services::viewers::ViewerRegistry;
use crate::services::{calls, presence};
use crate::state::ServiceContext;

/// Build the shared context and spawn every long-running task: the
/// realtime socket, the stream engine and the session observers.
pub async fn create_service_context(config: AppConfig) -> ServiceContext {
    let config = Arc::new(config);
    let backend = Backend::new(&config);

    let realtime =
        match RealtimeClient::connect(&config.realtime_url(), backend.session_watch()).await {
            Ok(client) => client,
            Err(e) => {
                warn!("Realtime socket unavailable ({e}), live updates are disabled");
                RealtimeClient::disconnected()
            }
        };

    let (event_tx, _event_rx) = create_event_bus();
    let (media_tx, media_rx) = mpsc::channel::<StreamCommand>(64);
    let (stream_state_tx, stream_state_rx) = watch::channel(StreamState::default());
    let (quality_tx, quality_rx) = watch::channel(None);

    tokio::spawn(media::engine::run_stream_engine(
        config.clone(),
        realtime.clone(),
        media_rx,
        event_tx.clone(),
        stream_state_tx,
        quality_tx,
    ));

    let presence =
        presence::spawn_presence_tracker(backend.clone(), realtime.clone(), event_tx.clone());
    let viewers = ViewerRegistry::new(backend.clone(), realtime.clone(), event_tx.clone());
    let notification_prefs = Arc::new(TokioMutex::new(NotificationPrefs::default()));
    let calls = calls::spawn_call_watcher(
        backend.clone(),
        realtime.clone(),
        event_tx.clone(),
        notification_prefs.clone(),
    );

    ServiceContext {
        backend,
        presence,
        viewers,
        calls,
        notification_prefs,
        event_tx,
        media_tx,
        stream_state_rx,
        quality_rx,
    }
}

/// Run the application: spawn the services, then serve the local API
/// until shutdown.
pub async fn run(port_override: Option<u16>) {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = AppConfig::from_env();
    let port = port_override.unwrap_or(config.api_port);

    let ctx = create_service_context(config).await;
    info!("Session observers running");

    api::server::start_api_server(ctx, port).await;
}
