use std::sync::Arc;

use serde_json::{json, Value};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;

use crate::backend::realtime::{Channel, ChannelEvent, RealtimeClient};
use crate::config::AppConfig;
use crate::events::{AppEvent, EventSender};
use crate::models::{ConnectionQuality, StreamRole};

use super::peer::{PeerEvent, PeerSession};
use super::quality;
use super::{StreamCommand, StreamState};

// Broadcast events exchanged on a session topic for signaling.
const SIGNAL_LIVE: &str = "live";
const SIGNAL_READY: &str = "ready";
const SIGNAL_OFFER: &str = "offer";
const SIGNAL_ANSWER: &str = "answer";
const SIGNAL_ICE: &str = "ice";

/// Run the stream engine event loop.
/// This owns the WebRTC peer session for the current stream, the
/// signaling channel on the session's realtime topic, and the quality
/// sampler lifecycle.
pub async fn run_stream_engine(
    config: Arc<AppConfig>,
    realtime: RealtimeClient,
    mut cmd_rx: mpsc::Receiver<StreamCommand>,
    event_tx: EventSender,
    state_tx: watch::Sender<StreamState>,
    quality_tx: watch::Sender<Option<ConnectionQuality>>,
) {
    info!("Stream engine started");

    // Current stream session state
    let mut session_id: Option<String> = None;
    let mut role: Option<StreamRole> = None;
    let mut connected = false;

    // Live resources (kept alive while in a stream)
    let mut peer: Option<PeerSession> = None;
    let mut signaling: Option<Channel> = None;
    let mut sampler: Option<JoinHandle<()>> = None;

    let (peer_event_tx, mut peer_event_rx) = mpsc::channel::<PeerEvent>(64);

    let update_state = |tx: &watch::Sender<StreamState>,
                        session_id: &Option<String>,
                        role: &Option<StreamRole>,
                        connected: bool| {
        let _ = tx.send(StreamState {
            in_stream: session_id.is_some(),
            session_id: session_id.clone(),
            role: *role,
            connected,
        });
    };

    // Helper to tear down the current stream's resources
    macro_rules! teardown_stream {
        () => {
            if let Some(handle) = sampler.take() {
                handle.abort();
            }
            if let Some(p) = peer.take() {
                p.close().await;
            }
            // Dropping the channel handle leaves the topic
            signaling.take();
            connected = false;
            let _ = quality_tx.send(None);
        };
    }

    loop {
        tokio::select! {
            // Commands from API routes
            Some(cmd) = cmd_rx.recv() => {
                match cmd {
                    StreamCommand::JoinStream { session_id: new_session, role: new_role } => {
                        info!("Joining stream session {} as {:?}", new_session, new_role);

                        // Leave current stream if any
                        if let Some(old) = session_id.take() {
                            teardown_stream!();
                            role = None;
                            let _ = event_tx.send(AppEvent::StreamLeft { session_id: old });
                        }

                        let peer_session = match PeerSession::new(&config, new_role, peer_event_tx.clone()).await {
                            Ok(p) => p,
                            Err(e) => {
                                error!("Failed to create peer session: {}", e);
                                update_state(&state_tx, &session_id, &role, connected);
                                continue;
                            }
                        };

                        let channel = match realtime
                            .channel(&format!("session:{}", new_session))
                            .subscribe()
                            .await
                        {
                            Ok(ch) => ch,
                            Err(e) => {
                                error!("Failed to join session topic: {}", e);
                                peer_session.close().await;
                                update_state(&state_tx, &session_id, &role, connected);
                                continue;
                            }
                        };

                        // Announce ourselves so whichever side is already
                        // on the topic can start the offer exchange.
                        let announce = match new_role {
                            StreamRole::Broadcaster => SIGNAL_LIVE,
                            StreamRole::Viewer => SIGNAL_READY,
                        };
                        if let Err(e) = channel.broadcast(announce, json!({})).await {
                            warn!("Failed to announce on session topic: {}", e);
                        }

                        peer = Some(peer_session);
                        signaling = Some(channel);
                        session_id = Some(new_session.clone());
                        role = Some(new_role);
                        connected = false;

                        update_state(&state_tx, &session_id, &role, connected);
                        let _ = event_tx.send(AppEvent::StreamJoined {
                            session_id: new_session,
                            role: new_role,
                        });
                    }

                    StreamCommand::LeaveStream => {
                        info!("Leaving stream");
                        teardown_stream!();
                        role = None;
                        if let Some(old) = session_id.take() {
                            let _ = event_tx.send(AppEvent::StreamLeft { session_id: old });
                        }
                        update_state(&state_tx, &session_id, &role, connected);
                    }
                }
            }

            // Events from the WebRTC peer session
            Some(peer_event) = peer_event_rx.recv() => {
                match peer_event {
                    PeerEvent::ConnectionStateChanged { state } => {
                        match state {
                            RTCPeerConnectionState::Connected => {
                                info!("Stream connected");
                                connected = true;
                                if sampler.is_none() {
                                    if let Some(ref p) = peer {
                                        sampler = Some(quality::spawn_sampler(
                                            p.downgrade(),
                                            quality_tx.clone(),
                                            event_tx.clone(),
                                        ));
                                    }
                                }
                                let _ = event_tx.send(AppEvent::StreamConnectionChanged { connected: true });
                                update_state(&state_tx, &session_id, &role, connected);
                            }
                            RTCPeerConnectionState::Disconnected
                            | RTCPeerConnectionState::Failed
                            | RTCPeerConnectionState::Closed => {
                                info!("Stream disconnected: {:?}", state);
                                connected = false;
                                if let Some(handle) = sampler.take() {
                                    handle.abort();
                                }
                                let _ = quality_tx.send(None);
                                let _ = event_tx.send(AppEvent::StreamConnectionChanged { connected: false });
                                update_state(&state_tx, &session_id, &role, connected);
                            }
                            _ => {}
                        }
                    }

                    PeerEvent::RemoteTrack { kind } => {
                        let _ = event_tx.send(AppEvent::RemoteTrackAdded { kind });
                    }

                    PeerEvent::IceCandidate { candidate } => {
                        if let Some(ref ch) = signaling {
                            if let Err(e) = ch.broadcast(SIGNAL_ICE, json!({ "candidate": candidate })).await {
                                warn!("Failed to send ICE candidate: {}", e);
                            }
                        }
                    }
                }
            }

            // Signaling broadcasts on the session topic
            maybe_event = async {
                if let Some(ref mut ch) = signaling {
                    ch.recv().await
                } else {
                    std::future::pending().await
                }
            } => {
                match maybe_event {
                    Some(ChannelEvent::Broadcast { event, payload }) => {
                        handle_signal(
                            &event,
                            &payload,
                            role,
                            connected,
                            &peer,
                            &signaling,
                        )
                        .await;
                    }
                    Some(ChannelEvent::Closed) | None => {
                        warn!("Session topic closed, leaving stream");
                        teardown_stream!();
                        role = None;
                        if let Some(old) = session_id.take() {
                            let _ = event_tx.send(AppEvent::StreamLeft { session_id: old });
                        }
                        update_state(&state_tx, &session_id, &role, connected);
                    }
                    Some(other) => {
                        debug!("Ignoring non-broadcast event on session topic: {:?}", other);
                    }
                }
            }
        }
    }
}

/// React to one signaling broadcast. The broadcaster answers "ready"
/// announcements with an offer; viewers answer offers; both sides feed
/// trickled ICE candidates into the peer.
async fn handle_signal(
    event: &str,
    payload: &Value,
    role: Option<StreamRole>,
    connected: bool,
    peer: &Option<PeerSession>,
    signaling: &Option<Channel>,
) {
    let (Some(peer), Some(channel)) = (peer.as_ref(), signaling.as_ref()) else {
        return;
    };

    match event {
        SIGNAL_READY if role == Some(StreamRole::Broadcaster) => {
            if connected {
                debug!("Viewer announced while already connected, ignoring");
                return;
            }
            match peer.create_offer().await {
                Ok(sdp) => {
                    if let Err(e) = channel.broadcast(SIGNAL_OFFER, json!({ "sdp": sdp })).await {
                        warn!("Failed to send offer: {}", e);
                    }
                }
                Err(e) => error!("Failed to create offer: {}", e),
            }
        }

        SIGNAL_LIVE if role == Some(StreamRole::Viewer) => {
            // Broadcaster (re)joined after us; announce again so it offers.
            if let Err(e) = channel.broadcast(SIGNAL_READY, json!({})).await {
                warn!("Failed to re-announce: {}", e);
            }
        }

        SIGNAL_OFFER if role == Some(StreamRole::Viewer) => {
            let Some(sdp) = payload.get("sdp").and_then(Value::as_str) else {
                warn!("Offer broadcast without sdp field");
                return;
            };
            match peer.handle_offer(sdp).await {
                Ok(answer) => {
                    if let Err(e) = channel.broadcast(SIGNAL_ANSWER, json!({ "sdp": answer })).await {
                        warn!("Failed to send answer: {}", e);
                    }
                }
                Err(e) => error!("Failed to handle offer: {}", e),
            }
        }

        SIGNAL_ANSWER if role == Some(StreamRole::Broadcaster) => {
            let Some(sdp) = payload.get("sdp").and_then(Value::as_str) else {
                warn!("Answer broadcast without sdp field");
                return;
            };
            if let Err(e) = peer.handle_answer(sdp).await {
                error!("Failed to handle answer: {}", e);
            }
        }

        SIGNAL_ICE => {
            let Some(candidate) = payload.get("candidate").and_then(Value::as_str) else {
                warn!("ICE broadcast without candidate field");
                return;
            };
            if let Err(e) = peer.add_ice_candidate(candidate).await {
                debug!("Failed to add ICE candidate: {}", e);
            }
        }

        other => {
            debug!("Ignoring signaling event {:?} for role {:?}", other, role);
        }
    }
}
