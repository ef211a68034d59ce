//! Socket task owning the realtime WebSocket. Channels multiplex over
//! one connection; there is no reconnect, a dead socket just reports
//! `Closed` to every subscriber.

use std::collections::HashMap;

use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{interval, Duration};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use super::channel::{ChannelBuilder, ChannelEvent};
use super::protocol::{
    ChangePayload, Envelope, JoinConfig, JoinPayload, ReplyPayload, EVENT_BROADCAST, EVENT_CLOSE,
    EVENT_HEARTBEAT, EVENT_JOIN, EVENT_LEAVE, EVENT_POSTGRES_CHANGES, EVENT_PRESENCE_DIFF,
    EVENT_PRESENCE_STATE, EVENT_REPLY, EVENT_SYSTEM, HEARTBEAT_TOPIC,
};
use crate::backend::BackendError;
use crate::models::Session;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const COMMAND_BUFFER: usize = 64;
const EVENT_BUFFER: usize = 64;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug)]
pub(crate) enum SocketCommand {
    Join {
        topic: String,
        config: JoinConfig,
        events: mpsc::Sender<ChannelEvent>,
        done: oneshot::Sender<Result<(), BackendError>>,
    },
    Push {
        topic: String,
        event: String,
        payload: Value,
    },
    Leave {
        topic: String,
    },
}

#[derive(Clone)]
pub struct RealtimeClient {
    cmd_tx: mpsc::Sender<SocketCommand>,
}

impl RealtimeClient {
    /// Connect the realtime socket and spawn its task. The session
    /// watch supplies the access token used in channel joins.
    pub async fn connect(
        url: &str,
        session_rx: watch::Receiver<Option<Session>>,
    ) -> Result<Self, BackendError> {
        let (stream, _) = connect_async(url)
            .await
            .map_err(|e| BackendError::Socket(e.to_string()))?;
        info!("Realtime socket connected");
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_BUFFER);
        tokio::spawn(run_socket(stream, cmd_rx, session_rx));
        Ok(Self { cmd_tx })
    }

    /// Client whose joins all fail with `SocketClosed`. Stands in when
    /// the socket could not be established at startup.
    pub fn disconnected() -> Self {
        let (cmd_tx, _) = mpsc::channel(1);
        Self { cmd_tx }
    }

    pub fn channel(&self, name: &str) -> ChannelBuilder {
        ChannelBuilder::new(self.cmd_tx.clone(), format!("realtime:{name}"), EVENT_BUFFER)
    }
}

struct Subscription {
    events: mpsc::Sender<ChannelEvent>,
}

type PendingJoins = HashMap<String, (String, oneshot::Sender<Result<(), BackendError>>)>;

async fn run_socket(
    mut stream: WsStream,
    mut cmd_rx: mpsc::Receiver<SocketCommand>,
    session_rx: watch::Receiver<Option<Session>>,
) {
    let mut topics: HashMap<String, Subscription> = HashMap::new();
    let mut pending: PendingJoins = HashMap::new();
    let mut next_ref: u64 = 0;
    let mut heartbeat = interval(HEARTBEAT_INTERVAL);

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => match cmd {
                Some(SocketCommand::Join { topic, config, events, done }) => {
                    next_ref += 1;
                    let reference = next_ref.to_string();
                    let payload = JoinPayload {
                        config,
                        access_token: session_rx.borrow().as_ref().map(|s| s.access_token.clone()),
                    };
                    let env = Envelope::new(
                        &topic,
                        EVENT_JOIN,
                        serde_json::to_value(payload).unwrap_or_default(),
                        Some(reference.clone()),
                    );
                    topics.insert(topic.clone(), Subscription { events });
                    pending.insert(reference, (topic, done));
                    if !send_envelope(&mut stream, &env).await {
                        notify_closed(&mut topics, &mut pending).await;
                        break;
                    }
                }
                Some(SocketCommand::Push { topic, event, payload }) => {
                    next_ref += 1;
                    let env = Envelope::new(&topic, &event, payload, Some(next_ref.to_string()));
                    if !send_envelope(&mut stream, &env).await {
                        notify_closed(&mut topics, &mut pending).await;
                        break;
                    }
                }
                Some(SocketCommand::Leave { topic }) => {
                    topics.remove(&topic);
                    next_ref += 1;
                    let env = Envelope::new(&topic, EVENT_LEAVE, json!({}), Some(next_ref.to_string()));
                    if !send_envelope(&mut stream, &env).await {
                        notify_closed(&mut topics, &mut pending).await;
                        break;
                    }
                }
                // Every handle is gone, close politely.
                None => {
                    let _ = stream.close(None).await;
                    break;
                }
            },
            _ = heartbeat.tick() => {
                next_ref += 1;
                let env = Envelope::new(
                    HEARTBEAT_TOPIC,
                    EVENT_HEARTBEAT,
                    json!({}),
                    Some(next_ref.to_string()),
                );
                if !send_envelope(&mut stream, &env).await {
                    warn!("Realtime heartbeat failed, closing socket");
                    notify_closed(&mut topics, &mut pending).await;
                    break;
                }
            }
            msg = stream.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    handle_frame(&text, &mut topics, &mut pending).await;
                }
                Some(Ok(Message::Ping(data))) => {
                    let _ = stream.send(Message::Pong(data)).await;
                }
                Some(Ok(Message::Close(_))) | None => {
                    info!("Realtime socket closed by server");
                    notify_closed(&mut topics, &mut pending).await;
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!("Realtime socket error: {e}");
                    notify_closed(&mut topics, &mut pending).await;
                    break;
                }
            },
        }
    }
    debug!("Realtime socket task ended");
}

async fn handle_frame(text: &str, topics: &mut HashMap<String, Subscription>, pending: &mut PendingJoins) {
    let env: Envelope = match serde_json::from_str(text) {
        Ok(env) => env,
        Err(e) => {
            warn!("Ignoring unparseable realtime frame: {e}");
            return;
        }
    };
    if env.topic == HEARTBEAT_TOPIC {
        return;
    }
    if env.event == EVENT_REPLY {
        let Some(reference) = env.reference.as_deref() else {
            return;
        };
        // Push acknowledgements carry refs too; only joins are pending.
        if let Some((topic, done)) = pending.remove(reference) {
            let reply = serde_json::from_value::<ReplyPayload>(env.payload).unwrap_or(ReplyPayload {
                status: "error".to_string(),
                response: Value::Null,
            });
            if reply.status == "ok" {
                let _ = done.send(Ok(()));
            } else {
                topics.remove(&topic);
                let _ = done.send(Err(BackendError::ChannelRejected(reply.response.to_string())));
            }
        }
        return;
    }

    let Some(event) = parse_event(&env.event, env.payload) else {
        return;
    };
    if let Some(sub) = topics.get(&env.topic) {
        if sub.events.send(event).await.is_err() {
            topics.remove(&env.topic);
        }
    }
}

#[derive(Deserialize)]
struct BroadcastFrame {
    event: String,
    #[serde(default)]
    payload: Value,
}

fn parse_event(event: &str, payload: Value) -> Option<ChannelEvent> {
    let parsed = match event {
        EVENT_PRESENCE_STATE => {
            serde_json::from_value(payload).map(ChannelEvent::PresenceState)
        }
        EVENT_PRESENCE_DIFF => serde_json::from_value(payload).map(ChannelEvent::PresenceDiff),
        EVENT_POSTGRES_CHANGES => serde_json::from_value::<ChangePayload>(payload)
            .map(|p| ChannelEvent::PostgresChange(p.data)),
        EVENT_BROADCAST => serde_json::from_value::<BroadcastFrame>(payload).map(|b| {
            ChannelEvent::Broadcast {
                event: b.event,
                payload: b.payload,
            }
        }),
        EVENT_CLOSE => return Some(ChannelEvent::Closed),
        EVENT_SYSTEM => {
            debug!("Realtime system message: {payload}");
            return None;
        }
        other => {
            debug!("Unhandled realtime event {other}");
            return None;
        }
    };
    match parsed {
        Ok(ev) => Some(ev),
        Err(e) => {
            warn!("Malformed {event} payload ignored: {e}");
            None
        }
    }
}

async fn send_envelope(stream: &mut WsStream, env: &Envelope) -> bool {
    let text = match serde_json::to_string(env) {
        Ok(t) => t,
        Err(e) => {
            warn!("Failed to encode realtime frame: {e}");
            return true;
        }
    };
    match stream.send(Message::Text(text)).await {
        Ok(()) => true,
        Err(e) => {
            warn!("Realtime send failed: {e}");
            false
        }
    }
}

async fn notify_closed(topics: &mut HashMap<String, Subscription>, pending: &mut PendingJoins) {
    for (_, (_, done)) in pending.drain() {
        let _ = done.send(Err(BackendError::SocketClosed));
    }
    for (_, sub) in topics.drain() {
        let _ = sub.events.send(ChannelEvent::Closed).await;
    }
}
