use serde::{Deserialize, Serialize};

// ============================================================
// Auth
// ============================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthUser {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    pub display_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub access_token: String,
    pub expires_at: String,
    pub user: AuthUser,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Profile {
    pub id: String,
    pub display_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
}

// ============================================================
// Presence
// ============================================================

/// Payload each client tracks on the shared presence topic. The
/// aggregate membership is derived state owned by the channel service;
/// clients only ever publish their own entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceEntry {
    pub user_id: String,
    pub display_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
    pub online_at: String,
}

// ============================================================
// Stream Sessions
// ============================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamRole {
    Broadcaster,
    Viewer,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViewerSession {
    pub session_id: String,
    /// Null for anonymous viewers.
    pub viewer_id: Option<String>,
    pub display_name: String,
    pub is_guest: bool,
    pub joined_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
}

// ============================================================
// Connection Quality
// ============================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QualityLevel {
    Poor,
    Fair,
    Good,
    Excellent,
}

/// Ordered so that `max` picks the most pessimistic interpretation of
/// the active candidate pairs: a relay candidate anywhere wins.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TransportPath {
    #[default]
    #[serde(rename = "unknown")]
    Unknown,
    #[serde(rename = "direct")]
    Direct,
    #[serde(rename = "nat-traversed")]
    NatTraversed,
    #[serde(rename = "relayed")]
    Relayed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionQuality {
    pub quality: QualityLevel,
    pub transport_path: TransportPath,
    pub packet_loss_percent: f64,
    pub round_trip_time_ms: f64,
    pub bitrate_kbps: f64,
}

// ============================================================
// Calls
// ============================================================

/// Calls table row, as far as this client reads and writes it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallRecord {
    pub id: String,
    pub caller_id: String,
    pub callee_id: String,
    pub call_type: String, // "video" or "audio"
    pub status: String,    // "ringing", "active", "rejected", "ended"
    #[serde(skip_serializing_if = "Option::is_none")]
    pub answered_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncomingCallPrompt {
    pub call_id: String,
    pub caller_id: String,
    pub call_type: String,
    pub caller_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub caller_avatar: Option<String>,
}

// ============================================================
// Notification Settings
// ============================================================

/// Per-category gates for desktop notification events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationPrefs {
    pub calls: String, // "all" or "none"
    pub streams: String,
}

impl Default for NotificationPrefs {
    fn default() -> Self {
        Self {
            calls: "all".to_string(),
            streams: "all".to_string(),
        }
    }
}
