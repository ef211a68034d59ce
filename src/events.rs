use serde::Serialize;
use tokio::sync::broadcast;

use crate::models::{ConnectionQuality, IncomingCallPrompt, StreamRole, ViewerSession};

/// Transport-agnostic application events.
/// Emitted by the observers and the stream engine, consumed by the
/// local WebSocket bridge.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data")]
pub enum AppEvent {
    // Auth
    SignedIn { user_id: String, display_name: String },
    SignedOut,
    // Presence
    PresenceSynced { online: Vec<String> },
    PresenceJoined { user_id: String },
    PresenceLeft { user_id: String },
    // Stream sessions
    StreamJoined { session_id: String, role: StreamRole },
    StreamLeft { session_id: String },
    StreamConnectionChanged { connected: bool },
    RemoteTrackAdded { kind: String },
    QualityUpdated(ConnectionQuality),
    // Viewer registry
    ViewerListChanged { session_id: String, viewers: Vec<ViewerSession> },
    // Calls
    IncomingCall(IncomingCallPrompt),
    CallAccepted { call_id: String },
    CallRejected { call_id: String, reason: String }, // "declined" or "timeout"
    // Desktop notifications (rendered by the frontend)
    DesktopNotification { title: String, body: String, tag: String },
}

pub type EventSender = broadcast::Sender<AppEvent>;
pub type EventReceiver = broadcast::Receiver<AppEvent>;

pub fn create_event_bus() -> (EventSender, EventReceiver) {
    broadcast::channel(256)
}
