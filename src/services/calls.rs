//! Incoming call watcher. Listens for "ringing" inserts on the calls
//! table addressed to the signed-in user, materializes a prompt with
//! the caller's profile, and resolves it through exactly one of
//! accept, reject, or the 30 second expiry.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot, watch, Mutex as TokioMutex};
use tracing::{debug, info, warn};

use crate::backend::realtime::{Channel, ChannelEvent, PostgresChangeFilter, RealtimeClient};
use crate::backend::{rpc, Backend};
use crate::events::{AppEvent, EventSender};
use crate::models::{CallRecord, IncomingCallPrompt, NotificationPrefs, Profile};

const RING_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug)]
enum CallCommand {
    Accept {
        call_id: String,
        reply: oneshot::Sender<Result<(), String>>,
    },
    Reject {
        call_id: String,
        reply: oneshot::Sender<Result<(), String>>,
    },
}

/// Handle over the watcher task.
#[derive(Clone)]
pub struct CallWatcherHandle {
    prompt_rx: watch::Receiver<Option<IncomingCallPrompt>>,
    cmd_tx: mpsc::Sender<CallCommand>,
}

impl CallWatcherHandle {
    pub fn current_prompt(&self) -> Option<IncomingCallPrompt> {
        self.prompt_rx.borrow().clone()
    }

    /// Accept the ringing call. On failure the prompt stays ringing
    /// and the error is returned for the frontend to surface.
    pub async fn accept(&self, call_id: &str) -> Result<(), String> {
        self.send_command(|reply| CallCommand::Accept {
            call_id: call_id.to_string(),
            reply,
        })
        .await
    }

    pub async fn reject(&self, call_id: &str) -> Result<(), String> {
        self.send_command(|reply| CallCommand::Reject {
            call_id: call_id.to_string(),
            reply,
        })
        .await
    }

    async fn send_command(
        &self,
        make: impl FnOnce(oneshot::Sender<Result<(), String>>) -> CallCommand,
    ) -> Result<(), String> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(make(reply_tx))
            .await
            .map_err(|_| "Call watcher is not running".to_string())?;
        reply_rx
            .await
            .map_err(|_| "Call watcher dropped the request".to_string())?
    }
}

/// Local ring slot. All transitions run on the watcher task, so each
/// prompt leaves the slot exactly once; a late expiry or duplicate
/// command finds it already empty.
#[derive(Default)]
struct RingState {
    current: Option<IncomingCallPrompt>,
}

impl RingState {
    /// Returns false if a call is already ringing.
    fn begin(&mut self, prompt: IncomingCallPrompt) -> bool {
        if self.current.is_some() {
            return false;
        }
        self.current = Some(prompt);
        true
    }

    fn peek(&self) -> Option<&IncomingCallPrompt> {
        self.current.as_ref()
    }

    /// Take the prompt if it matches the given call id.
    fn resolve(&mut self, call_id: &str) -> Option<IncomingCallPrompt> {
        if self.current.as_ref().is_some_and(|p| p.call_id == call_id) {
            self.current.take()
        } else {
            None
        }
    }

    /// Take whatever is ringing, for the expiry path.
    fn expire(&mut self) -> Option<IncomingCallPrompt> {
        self.current.take()
    }
}

pub fn spawn_call_watcher(
    backend: Backend,
    realtime: RealtimeClient,
    event_tx: EventSender,
    prefs: Arc<TokioMutex<NotificationPrefs>>,
) -> CallWatcherHandle {
    let (prompt_tx, prompt_rx) = watch::channel(None);
    let (cmd_tx, cmd_rx) = mpsc::channel(16);
    tokio::spawn(run_call_watcher(
        backend, realtime, event_tx, prefs, prompt_tx, cmd_rx,
    ));
    CallWatcherHandle { prompt_rx, cmd_tx }
}

async fn run_call_watcher(
    backend: Backend,
    realtime: RealtimeClient,
    event_tx: EventSender,
    prefs: Arc<TokioMutex<NotificationPrefs>>,
    prompt_tx: watch::Sender<Option<IncomingCallPrompt>>,
    mut cmd_rx: mpsc::Receiver<CallCommand>,
) {
    let mut session_rx = backend.session_watch();

    loop {
        // Park until someone signs in. Commands arriving here cannot
        // match a ringing call, so refuse them instead of queueing.
        let session = loop {
            if let Some(session) = session_rx.borrow_and_update().clone() {
                break session;
            }
            tokio::select! {
                changed = session_rx.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
                Some(cmd) = cmd_rx.recv() => refuse(cmd),
            }
        };
        let user_id = session.user.id.clone();

        let channel = match realtime
            .channel(&format!("calls:{}", user_id))
            .on_postgres_changes(PostgresChangeFilter::inserts(
                "calls",
                Some(format!("callee_id=eq.{}", user_id)),
            ))
            .subscribe()
            .await
        {
            Ok(ch) => ch,
            Err(e) => {
                warn!("Failed to subscribe to incoming calls: {}", e);
                tokio::select! {
                    changed = session_rx.changed() => {
                        if changed.is_err() {
                            return;
                        }
                    }
                    Some(cmd) = cmd_rx.recv() => refuse(cmd),
                }
                continue;
            }
        };
        info!("Watching incoming calls for {}", user_id);

        run_channel(
            channel,
            &user_id,
            &backend,
            &event_tx,
            &prefs,
            &prompt_tx,
            &mut cmd_rx,
            &mut session_rx,
        )
        .await;

        // Whatever was ringing is gone with the subscription.
        let _ = prompt_tx.send(None);
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_channel(
    mut channel: Channel,
    user_id: &str,
    backend: &Backend,
    event_tx: &EventSender,
    prefs: &Arc<TokioMutex<NotificationPrefs>>,
    prompt_tx: &watch::Sender<Option<IncomingCallPrompt>>,
    cmd_rx: &mut mpsc::Receiver<CallCommand>,
    session_rx: &mut watch::Receiver<Option<crate::models::Session>>,
) {
    let mut ring = RingState::default();
    let expiry = tokio::time::sleep(RING_TIMEOUT);
    tokio::pin!(expiry);

    loop {
        tokio::select! {
            maybe_event = channel.recv() => {
                match maybe_event {
                    Some(ChannelEvent::PostgresChange(change)) => {
                        if change.kind != "INSERT" {
                            continue;
                        }
                        let Some(record) = change.record.as_ref().and_then(parse_call_insert) else {
                            warn!("Ignoring malformed calls insert");
                            continue;
                        };
                        if record.status != "ringing" || record.callee_id != user_id {
                            continue;
                        }
                        if ring.peek().is_some() {
                            debug!("Already ringing, ignoring call {}", record.id);
                            continue;
                        }

                        let caller = fetch_caller_profile(backend, &record.caller_id).await;
                        let prompt = IncomingCallPrompt {
                            call_id: record.id.clone(),
                            caller_id: record.caller_id.clone(),
                            call_type: record.call_type.clone(),
                            caller_name: caller.display_name,
                            caller_avatar: caller.avatar_url,
                        };
                        info!("Incoming {} call {} from {}", prompt.call_type, prompt.call_id, prompt.caller_id);

                        ring.begin(prompt.clone());
                        expiry.as_mut().reset(tokio::time::Instant::now() + RING_TIMEOUT);
                        let _ = prompt_tx.send(Some(prompt.clone()));
                        let _ = event_tx.send(AppEvent::IncomingCall(prompt.clone()));

                        if prefs.lock().await.calls == "all" {
                            let _ = event_tx.send(AppEvent::DesktopNotification {
                                title: prompt.caller_name.clone(),
                                body: format!("Incoming {} call", prompt.call_type),
                                tag: format!("call:{}", prompt.call_id),
                            });
                        }
                    }
                    Some(ChannelEvent::Closed) | None => {
                        warn!("Incoming call feed closed");
                        return;
                    }
                    Some(other) => {
                        debug!("Ignoring event on calls topic: {:?}", other);
                    }
                }
            }

            // Ring timeout, armed only while a prompt is up.
            () = &mut expiry, if ring.peek().is_some() => {
                if let Some(prompt) = ring.expire() {
                    info!("Call {} unanswered for 30s, rejecting", prompt.call_id);
                    if let Err(e) = mark_rejected(backend, &prompt.call_id).await {
                        warn!("Failed to reject expired call {}: {}", prompt.call_id, e);
                    }
                    let _ = prompt_tx.send(None);
                    let _ = event_tx.send(AppEvent::CallRejected {
                        call_id: prompt.call_id,
                        reason: "timeout".to_string(),
                    });
                }
            }

            Some(cmd) = cmd_rx.recv() => {
                match cmd {
                    CallCommand::Accept { call_id, reply } => {
                        if ring.peek().map(|p| p.call_id.as_str()) != Some(call_id.as_str()) {
                            let _ = reply.send(Err("No ringing call with that id".to_string()));
                            continue;
                        }
                        let result = rpc::update(
                            backend,
                            "calls",
                            &call_id,
                            json!({ "status": "active", "answered_at": Utc::now().to_rfc3339() }),
                        )
                        .await
                        .map_err(|e| e.to_string());
                        match result {
                            Ok(()) => {
                                ring.resolve(&call_id);
                                let _ = prompt_tx.send(None);
                                let _ = event_tx.send(AppEvent::CallAccepted {
                                    call_id: call_id.clone(),
                                });
                                let _ = reply.send(Ok(()));
                            }
                            Err(e) => {
                                // Still ringing; the expiry timer stays armed.
                                warn!("Failed to accept call {}: {}", call_id, e);
                                let _ = reply.send(Err(e));
                            }
                        }
                    }

                    CallCommand::Reject { call_id, reply } => {
                        match ring.resolve(&call_id) {
                            Some(prompt) => {
                                if let Err(e) = mark_rejected(backend, &prompt.call_id).await {
                                    warn!("Failed to reject call {}: {}", prompt.call_id, e);
                                }
                                let _ = prompt_tx.send(None);
                                let _ = event_tx.send(AppEvent::CallRejected {
                                    call_id: prompt.call_id,
                                    reason: "declined".to_string(),
                                });
                                let _ = reply.send(Ok(()));
                            }
                            None => {
                                let _ = reply.send(Err("No ringing call with that id".to_string()));
                            }
                        }
                    }
                }
            }

            changed = session_rx.changed() => {
                if changed.is_err() {
                    return;
                }
                if session_rx.borrow().is_none() {
                    info!("Signed out, stopping call watcher");
                    return;
                }
            }
        }
    }
}

/// Answer a command that arrived while no call subscription is up.
fn refuse(cmd: CallCommand) {
    let reply = match cmd {
        CallCommand::Accept { reply, .. } | CallCommand::Reject { reply, .. } => reply,
    };
    let _ = reply.send(Err("No ringing call with that id".to_string()));
}

async fn mark_rejected(backend: &Backend, call_id: &str) -> Result<(), String> {
    rpc::update(
        backend,
        "calls",
        call_id,
        json!({ "status": "rejected", "ended_at": Utc::now().to_rfc3339() }),
    )
    .await
    .map_err(|e| e.to_string())
}

/// Lenient parse of a calls-table insert. Only the fields needed to
/// ring are required; a missing call type defaults to video.
fn parse_call_insert(record: &Value) -> Option<CallRecord> {
    Some(CallRecord {
        id: record.get("id").and_then(Value::as_str)?.to_string(),
        caller_id: record.get("caller_id").and_then(Value::as_str)?.to_string(),
        callee_id: record.get("callee_id").and_then(Value::as_str)?.to_string(),
        call_type: record
            .get("call_type")
            .and_then(Value::as_str)
            .unwrap_or("video")
            .to_string(),
        status: record
            .get("status")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        answered_at: None,
        ended_at: None,
    })
}

async fn fetch_caller_profile(backend: &Backend, caller_id: &str) -> Profile {
    let fetched = match rpc::select(backend, "profiles", &[("id", &format!("eq.{}", caller_id))]).await
    {
        Ok(rows) => rows
            .into_iter()
            .next()
            .and_then(|row| serde_json::from_value::<Profile>(row).ok()),
        Err(e) => {
            warn!("Failed to fetch caller profile {}: {}", caller_id, e);
            None
        }
    };
    fetched.unwrap_or_else(|| Profile {
        id: caller_id.to_string(),
        display_name: "Unknown".to_string(),
        avatar_url: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::realtime::{ChangeData, SocketCommand};
    use crate::config::AppConfig;
    use crate::events::{create_event_bus, EventReceiver};
    use crate::models::{AuthUser, Session};

    fn prompt(call_id: &str) -> IncomingCallPrompt {
        IncomingCallPrompt {
            call_id: call_id.to_string(),
            caller_id: "caller-1".to_string(),
            call_type: "video".to_string(),
            caller_name: "Ana".to_string(),
            caller_avatar: None,
        }
    }

    #[test]
    fn ring_slot_resolves_exactly_once() {
        let mut ring = RingState::default();
        assert!(ring.begin(prompt("c1")));
        assert!(ring.resolve("c1").is_some());
        assert!(ring.resolve("c1").is_none());
        assert!(ring.expire().is_none());
    }

    #[test]
    fn expiry_after_manual_resolution_is_a_no_op() {
        let mut ring = RingState::default();
        ring.begin(prompt("c1"));
        assert!(ring.resolve("c1").is_some());
        // The 30s timer firing later finds the slot empty.
        assert!(ring.expire().is_none());
    }

    #[test]
    fn manual_resolution_after_expiry_is_a_no_op() {
        let mut ring = RingState::default();
        ring.begin(prompt("c1"));
        assert!(ring.expire().is_some());
        assert!(ring.resolve("c1").is_none());
    }

    #[test]
    fn resolve_ignores_other_call_ids() {
        let mut ring = RingState::default();
        ring.begin(prompt("c1"));
        assert!(ring.resolve("c2").is_none());
        assert_eq!(ring.peek().unwrap().call_id, "c1");
    }

    #[test]
    fn second_ring_is_refused_while_busy() {
        let mut ring = RingState::default();
        assert!(ring.begin(prompt("c1")));
        assert!(!ring.begin(prompt("c2")));
        assert_eq!(ring.peek().unwrap().call_id, "c1");
    }

    #[test]
    fn call_insert_parses_with_defaults() {
        let record = serde_json::json!({
            "id": "c1",
            "caller_id": "u1",
            "callee_id": "u2",
            "status": "ringing",
            "created_at": "2024-05-01T10:00:00Z"
        });
        let call = parse_call_insert(&record).unwrap();
        assert_eq!(call.call_type, "video");
        assert_eq!(call.status, "ringing");

        let missing_id = serde_json::json!({ "caller_id": "u1", "callee_id": "u2" });
        assert!(parse_call_insert(&missing_id).is_none());
    }

    // --- joined-loop tests, driven through a detached channel ---

    struct WatcherRig {
        events_tx: mpsc::Sender<ChannelEvent>,
        cmd_tx: mpsc::Sender<CallCommand>,
        prompt_rx: watch::Receiver<Option<IncomingCallPrompt>>,
        event_rx: EventReceiver,
        _session_tx: watch::Sender<Option<Session>>,
        _socket_rx: mpsc::Receiver<SocketCommand>,
    }

    /// Runs `run_channel` for user u2 against an unreachable backend, so
    /// every RPC in the loop fails and the state machine is all that acts.
    fn spawn_rig() -> WatcherRig {
        let (channel, events_tx, socket_rx) = Channel::test_rig("calls:u2");
        let backend = Backend::new(&AppConfig::from_vars(|_| None));
        let (event_tx, event_rx) = create_event_bus();
        let prefs = Arc::new(TokioMutex::new(NotificationPrefs::default()));
        let (prompt_tx, prompt_rx) = watch::channel(None);
        let (cmd_tx, mut cmd_rx) = mpsc::channel(16);
        let session = Session {
            access_token: "jwt".to_string(),
            expires_at: "2030-01-01T00:00:00Z".to_string(),
            user: AuthUser {
                id: "u2".to_string(),
                email: None,
                display_name: "U2".to_string(),
                avatar_url: None,
            },
        };
        let (session_tx, mut session_rx) = watch::channel(Some(session));
        tokio::spawn(async move {
            run_channel(
                channel,
                "u2",
                &backend,
                &event_tx,
                &prefs,
                &prompt_tx,
                &mut cmd_rx,
                &mut session_rx,
            )
            .await;
        });
        WatcherRig {
            events_tx,
            cmd_tx,
            prompt_rx,
            event_rx,
            _session_tx: session_tx,
            _socket_rx: socket_rx,
        }
    }

    fn ringing_insert(call_id: &str) -> ChannelEvent {
        ChannelEvent::PostgresChange(ChangeData {
            kind: "INSERT".to_string(),
            table: "calls".to_string(),
            schema: "public".to_string(),
            record: Some(json!({
                "id": call_id,
                "caller_id": "u9",
                "callee_id": "u2",
                "call_type": "audio",
                "status": "ringing",
            })),
            old_record: None,
        })
    }

    #[tokio::test(start_paused = true)]
    async fn unanswered_ring_expires_exactly_once() {
        let mut rig = spawn_rig();

        rig.events_tx.send(ringing_insert("c1")).await.unwrap();
        rig.prompt_rx.changed().await.unwrap();
        {
            let ringing = rig.prompt_rx.borrow();
            let prompt = ringing.as_ref().expect("prompt up while ringing");
            assert_eq!(prompt.call_id, "c1");
            assert_eq!(prompt.call_type, "audio");
            // Profile lookup fails, so the prompt falls back.
            assert_eq!(prompt.caller_name, "Unknown");
        }

        // Nobody answers; the 30 second timer clears it.
        rig.prompt_rx.changed().await.unwrap();
        assert!(rig.prompt_rx.borrow().is_none());

        let mut rejected = 0;
        while let Ok(event) = rig.event_rx.try_recv() {
            if let AppEvent::CallRejected { call_id, reason } = event {
                assert_eq!(call_id, "c1");
                assert_eq!(reason, "timeout");
                rejected += 1;
            }
        }
        assert_eq!(rejected, 1);

        // Long after, the disarmed timer stays quiet.
        tokio::time::advance(RING_TIMEOUT * 3).await;
        assert!(rig.event_rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_accept_keeps_the_ring_until_expiry() {
        let mut rig = spawn_rig();

        rig.events_tx.send(ringing_insert("c1")).await.unwrap();
        rig.prompt_rx.changed().await.unwrap();
        assert!(rig.prompt_rx.borrow().is_some());

        // Accept cannot reach the backend and must not clear the slot.
        let (reply_tx, reply_rx) = oneshot::channel();
        rig.cmd_tx
            .send(CallCommand::Accept {
                call_id: "c1".to_string(),
                reply: reply_tx,
            })
            .await
            .unwrap();
        assert!(reply_rx.await.unwrap().is_err());

        // The slot stayed occupied, so the timeout still resolves it.
        while rig.prompt_rx.borrow().is_some() {
            rig.prompt_rx.changed().await.unwrap();
        }
        let mut accepted = 0;
        let mut rejected = 0;
        while let Ok(event) = rig.event_rx.try_recv() {
            match event {
                AppEvent::CallAccepted { .. } => accepted += 1,
                AppEvent::CallRejected { reason, .. } => {
                    assert_eq!(reason, "timeout");
                    rejected += 1;
                }
                _ => {}
            }
        }
        assert_eq!(accepted, 0);
        assert_eq!(rejected, 1);
    }
}
