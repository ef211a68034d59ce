//! Presence tracker. Joins the shared online-users topic once a
//! session exists, keeps a flattened membership set, and re-publishes
//! our own entry on a 30 second interval and on activity pings.

use std::collections::HashSet;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, watch};
use tokio::time::interval;
use tracing::{debug, info, warn};

use crate::backend::realtime::{Channel, ChannelEvent, PresenceState, RealtimeClient};
use crate::backend::Backend;
use crate::events::{AppEvent, EventSender};
use crate::models::{PresenceEntry, Session};

const PRESENCE_TOPIC: &str = "online-users";
const TRACK_INTERVAL: Duration = Duration::from_secs(30);

/// Read handle over the tracker task. Cheap to clone; all getters are
/// snapshots of the most recent sync.
#[derive(Clone)]
pub struct PresenceHandle {
    online_rx: watch::Receiver<HashSet<String>>,
    activity_tx: mpsc::Sender<()>,
}

impl PresenceHandle {
    pub fn is_user_online(&self, user_id: &str) -> bool {
        self.online_rx.borrow().contains(user_id)
    }

    pub fn online_users(&self) -> HashSet<String> {
        self.online_rx.borrow().clone()
    }

    /// Fire-and-forget activity ping; triggers a presence re-publish.
    pub fn update_activity(&self) {
        let _ = self.activity_tx.try_send(());
    }
}

pub fn spawn_presence_tracker(
    backend: Backend,
    realtime: RealtimeClient,
    event_tx: EventSender,
) -> PresenceHandle {
    let (online_tx, online_rx) = watch::channel(HashSet::new());
    let (activity_tx, activity_rx) = mpsc::channel(16);
    tokio::spawn(run_presence_tracker(
        backend,
        realtime,
        event_tx,
        online_tx,
        activity_rx,
    ));
    PresenceHandle {
        online_rx,
        activity_tx,
    }
}

async fn run_presence_tracker(
    backend: Backend,
    realtime: RealtimeClient,
    event_tx: EventSender,
    online_tx: watch::Sender<HashSet<String>>,
    mut activity_rx: mpsc::Receiver<()>,
) {
    let mut session_rx = backend.session_watch();

    loop {
        // Park until signed in.
        let session = loop {
            if let Some(session) = session_rx.borrow_and_update().clone() {
                break session;
            }
            if session_rx.changed().await.is_err() {
                return;
            }
        };

        let channel = match realtime
            .channel(PRESENCE_TOPIC)
            .presence_key(&session.user.id)
            .subscribe()
            .await
        {
            Ok(ch) => ch,
            Err(e) => {
                warn!("Failed to join presence topic: {}", e);
                // No retries. The next sign-in gets a fresh attempt.
                if session_rx.changed().await.is_err() {
                    return;
                }
                continue;
            }
        };
        info!("Joined presence topic as {}", session.user.id);

        // Publish our entry now that the join is acknowledged.
        track_self(&channel, &session).await;

        run_channel(
            channel,
            &session,
            &event_tx,
            &online_tx,
            &mut activity_rx,
            &mut session_rx,
        )
        .await;

        // Signed out or topic gone: membership is unknown again.
        let _ = online_tx.send(HashSet::new());
    }
}

/// Inner loop while joined. Returns when the session ends or the topic
/// closes; the dropped channel handle leaves the topic.
async fn run_channel(
    mut channel: Channel,
    session: &Session,
    event_tx: &EventSender,
    online_tx: &watch::Sender<HashSet<String>>,
    activity_rx: &mut mpsc::Receiver<()>,
    session_rx: &mut watch::Receiver<Option<Session>>,
) {
    let mut state = PresenceState::default();
    let mut ticker = interval(TRACK_INTERVAL);
    // First tick fires immediately and we already tracked on join.
    ticker.tick().await;

    loop {
        tokio::select! {
            maybe_event = channel.recv() => {
                match maybe_event {
                    Some(ChannelEvent::PresenceState(new_state)) => {
                        state = new_state;
                        let online = state.user_ids();
                        debug!("Presence sync: {} users online", online.len());
                        let _ = event_tx.send(AppEvent::PresenceSynced {
                            online: online.iter().cloned().collect(),
                        });
                        let _ = online_tx.send(online);
                    }
                    Some(ChannelEvent::PresenceDiff(diff)) => {
                        let before = state.user_ids();
                        state.apply_diff(&diff);
                        let after = state.user_ids();
                        for user_id in after.difference(&before) {
                            let _ = event_tx.send(AppEvent::PresenceJoined {
                                user_id: user_id.clone(),
                            });
                        }
                        for user_id in before.difference(&after) {
                            let _ = event_tx.send(AppEvent::PresenceLeft {
                                user_id: user_id.clone(),
                            });
                        }
                        if after != before {
                            let _ = online_tx.send(after);
                        }
                    }
                    Some(ChannelEvent::Closed) | None => {
                        warn!("Presence topic closed");
                        return;
                    }
                    Some(other) => {
                        debug!("Ignoring event on presence topic: {:?}", other);
                    }
                }
            }

            _ = ticker.tick() => {
                track_self(&channel, session).await;
            }

            Some(()) = activity_rx.recv() => {
                debug!("Activity ping, re-publishing presence entry");
                track_self(&channel, session).await;
            }

            changed = session_rx.changed() => {
                if changed.is_err() {
                    return;
                }
                if session_rx.borrow().is_none() {
                    info!("Signed out, leaving presence topic");
                    return;
                }
                // Token refresh for the same user, keep tracking.
            }
        }
    }
}

async fn track_self(channel: &Channel, session: &Session) {
    let entry = PresenceEntry {
        user_id: session.user.id.clone(),
        display_name: session.user.display_name.clone(),
        avatar_url: session.user.avatar_url.clone(),
        online_at: Utc::now().to_rfc3339(),
    };
    match serde_json::to_value(&entry) {
        Ok(payload) => {
            if let Err(e) = channel.track(payload).await {
                warn!("Failed to publish presence entry: {}", e);
            }
        }
        Err(e) => warn!("Failed to encode presence entry: {}", e),
    }
}
