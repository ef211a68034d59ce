//! Stream viewer registry. Each watched session gets its own task that
//! holds the authoritative viewer list: one fetch on watch, a wholesale
//! re-fetch on every membership change event, and a 30 second fallback
//! re-fetch that recovers rows which went stale without a leave event.
//! The list is never patched incrementally.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::{watch, Mutex as TokioMutex};
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, info, warn};

use crate::backend::realtime::{ChannelEvent, PostgresChangeFilter, RealtimeClient};
use crate::backend::{rpc, Backend, BackendError};
use crate::events::{AppEvent, EventSender};
use crate::models::ViewerSession;

const VIEWER_TABLE: &str = "stream_viewers";
const VIEWERS_RPC: &str = "get_stream_viewers";
const FALLBACK_INTERVAL: Duration = Duration::from_secs(30);

struct SessionWatch {
    list_rx: watch::Receiver<Vec<ViewerSession>>,
    task: JoinHandle<()>,
}

/// Registry of per-session viewer watchers. Watchers are scoped
/// resources: unwatching aborts the task and drops its channel, and a
/// re-fetch already in flight lands nowhere.
#[derive(Clone)]
pub struct ViewerRegistry {
    backend: Backend,
    realtime: RealtimeClient,
    event_tx: EventSender,
    watchers: Arc<TokioMutex<HashMap<String, SessionWatch>>>,
}

impl ViewerRegistry {
    pub fn new(backend: Backend, realtime: RealtimeClient, event_tx: EventSender) -> Self {
        Self {
            backend,
            realtime,
            event_tx,
            watchers: Arc::new(TokioMutex::new(HashMap::new())),
        }
    }

    /// Start watching a session. Idempotent; an existing watcher is
    /// left running.
    pub async fn watch(&self, session_id: &str) {
        let mut watchers = self.watchers.lock().await;
        if watchers.contains_key(session_id) {
            debug!("Already watching session {}", session_id);
            return;
        }
        info!("Watching viewers of session {}", session_id);
        let (list_tx, list_rx) = watch::channel(Vec::new());
        let task = tokio::spawn(run_viewer_watch(
            self.backend.clone(),
            self.realtime.clone(),
            self.event_tx.clone(),
            session_id.to_string(),
            list_tx,
        ));
        watchers.insert(session_id.to_string(), SessionWatch { list_rx, task });
    }

    /// Stop watching a session. Returns whether a watcher existed.
    pub async fn unwatch(&self, session_id: &str) -> bool {
        let removed = self.watchers.lock().await.remove(session_id);
        match removed {
            Some(entry) => {
                info!("Unwatching viewers of session {}", session_id);
                entry.task.abort();
                true
            }
            None => false,
        }
    }

    pub async fn is_watching(&self, session_id: &str) -> bool {
        self.watchers.lock().await.contains_key(session_id)
    }

    /// Current list for a watched session, `None` if not watching.
    pub async fn viewers(&self, session_id: &str) -> Option<Vec<ViewerSession>> {
        self.watchers
            .lock()
            .await
            .get(session_id)
            .map(|entry| entry.list_rx.borrow().clone())
    }
}

async fn run_viewer_watch(
    backend: Backend,
    realtime: RealtimeClient,
    event_tx: EventSender,
    session_id: String,
    list_tx: watch::Sender<Vec<ViewerSession>>,
) {
    refetch(&backend, &event_tx, &session_id, &list_tx).await;

    let mut channel = match realtime
        .channel(&format!("viewers:{}", session_id))
        .on_postgres_changes(PostgresChangeFilter::all(
            VIEWER_TABLE,
            Some(format!("session_id=eq.{}", session_id)),
        ))
        .subscribe()
        .await
    {
        Ok(ch) => Some(ch),
        Err(e) => {
            // The fallback timer still keeps the list fresh.
            warn!("Failed to subscribe to viewer changes for {}: {}", session_id, e);
            None
        }
    };

    let mut ticker = interval(FALLBACK_INTERVAL);
    // Immediate first tick; the initial fetch already happened.
    ticker.tick().await;

    loop {
        tokio::select! {
            maybe_event = async {
                if let Some(ref mut ch) = channel {
                    ch.recv().await
                } else {
                    std::future::pending().await
                }
            } => {
                match maybe_event {
                    Some(ChannelEvent::PostgresChange(change)) => {
                        debug!(
                            "Viewer membership {} on session {}, re-fetching",
                            change.kind, session_id
                        );
                        refetch(&backend, &event_tx, &session_id, &list_tx).await;
                    }
                    Some(ChannelEvent::Closed) | None => {
                        warn!("Viewer change feed closed for session {}", session_id);
                        channel = None;
                    }
                    Some(other) => {
                        debug!("Ignoring event on viewer topic: {:?}", other);
                    }
                }
            }

            _ = ticker.tick() => {
                refetch(&backend, &event_tx, &session_id, &list_tx).await;
            }
        }
    }
}

/// Wholesale re-fetch. On failure the previous list stays.
async fn refetch(
    backend: &Backend,
    event_tx: &EventSender,
    session_id: &str,
    list_tx: &watch::Sender<Vec<ViewerSession>>,
) {
    match fetch_viewers(backend, session_id).await {
        Ok(viewers) => {
            let _ = event_tx.send(AppEvent::ViewerListChanged {
                session_id: session_id.to_string(),
                viewers: viewers.clone(),
            });
            let _ = list_tx.send(viewers);
        }
        Err(e) => {
            warn!("Failed to fetch viewers for {}: {}", session_id, e);
        }
    }
}

pub async fn fetch_viewers(
    backend: &Backend,
    session_id: &str,
) -> Result<Vec<ViewerSession>, BackendError> {
    let value = rpc::call(backend, VIEWERS_RPC, json!({ "session_id": session_id })).await?;
    let rows = value.as_array().cloned().unwrap_or_default();
    Ok(normalize_viewers(session_id, rows))
}

/// Map raw RPC rows onto the viewer model. Anonymous rows have a null
/// viewer id and default to guest display fields instead of erroring.
fn normalize_viewers(session_id: &str, rows: Vec<Value>) -> Vec<ViewerSession> {
    rows.into_iter()
        .map(|row| {
            let viewer_id = row
                .get("viewer_id")
                .and_then(Value::as_str)
                .map(str::to_string);
            let is_guest = row
                .get("is_guest")
                .and_then(Value::as_bool)
                .unwrap_or(viewer_id.is_none());
            ViewerSession {
                session_id: session_id.to_string(),
                display_name: row
                    .get("display_name")
                    .and_then(Value::as_str)
                    .unwrap_or("Guest")
                    .to_string(),
                viewer_id,
                is_guest,
                joined_at: row
                    .get("joined_at")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                avatar_url: row
                    .get("avatar_url")
                    .and_then(Value::as_str)
                    .map(str::to_string),
            }
        })
        .collect()
}
