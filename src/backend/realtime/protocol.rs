//! Wire shapes for the hosted realtime service.
//!
//! Everything rides in Phoenix-style envelopes. Presence arrives as a
//! map of key to meta list and is folded locally; row change events
//! carry the changed record inside a `data` object.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const HEARTBEAT_TOPIC: &str = "phoenix";

pub const EVENT_JOIN: &str = "phx_join";
pub const EVENT_LEAVE: &str = "phx_leave";
pub const EVENT_REPLY: &str = "phx_reply";
pub const EVENT_CLOSE: &str = "phx_close";
pub const EVENT_HEARTBEAT: &str = "heartbeat";
pub const EVENT_PRESENCE: &str = "presence";
pub const EVENT_PRESENCE_STATE: &str = "presence_state";
pub const EVENT_PRESENCE_DIFF: &str = "presence_diff";
pub const EVENT_POSTGRES_CHANGES: &str = "postgres_changes";
pub const EVENT_BROADCAST: &str = "broadcast";
pub const EVENT_SYSTEM: &str = "system";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub topic: String,
    pub event: String,
    pub payload: Value,
    #[serde(rename = "ref")]
    pub reference: Option<String>,
}

impl Envelope {
    pub fn new(topic: &str, event: &str, payload: Value, reference: Option<String>) -> Self {
        Self {
            topic: topic.to_string(),
            event: event.to_string(),
            payload,
            reference,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReplyPayload {
    pub status: String,
    #[serde(default)]
    pub response: Value,
}

// ============================================================
// Join configuration
// ============================================================

#[derive(Debug, Clone, Serialize)]
pub struct JoinPayload {
    pub config: JoinConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct JoinConfig {
    pub broadcast: BroadcastConfig,
    pub presence: PresenceConfig,
    pub postgres_changes: Vec<PostgresChangeFilter>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BroadcastConfig {
    /// Echo our own broadcasts back to us.
    #[serde(rename = "self")]
    pub echo: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PresenceConfig {
    pub key: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PostgresChangeFilter {
    pub event: String, // "INSERT", "UPDATE", "DELETE" or "*"
    pub schema: String,
    pub table: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filter: Option<String>,
}

impl PostgresChangeFilter {
    pub fn inserts(table: &str, filter: Option<String>) -> Self {
        Self {
            event: "INSERT".to_string(),
            schema: "public".to_string(),
            table: table.to_string(),
            filter,
        }
    }

    pub fn all(table: &str, filter: Option<String>) -> Self {
        Self {
            event: "*".to_string(),
            schema: "public".to_string(),
            table: table.to_string(),
            filter,
        }
    }
}

// ============================================================
// Presence
// ============================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Presence {
    pub metas: Vec<PresenceMeta>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceMeta {
    pub phx_ref: String,
    #[serde(flatten)]
    pub payload: serde_json::Map<String, Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PresenceState(pub HashMap<String, Presence>);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceDiff {
    pub joins: HashMap<String, Presence>,
    pub leaves: HashMap<String, Presence>,
}

impl PresenceState {
    /// Flatten every key's meta list into the set of user ids announced
    /// in the tracked payloads. Keys are connection-scoped and may not
    /// equal the user id, so only the payload counts.
    pub fn user_ids(&self) -> HashSet<String> {
        self.0
            .values()
            .flat_map(|p| &p.metas)
            .filter_map(|m| m.payload.get("user_id").and_then(Value::as_str))
            .map(str::to_string)
            .collect()
    }

    /// Phoenix sync semantics: joins add metas under their key, leaves
    /// remove metas by `phx_ref`, keys with no metas left disappear.
    pub fn apply_diff(&mut self, diff: &PresenceDiff) {
        for (key, joined) in &diff.joins {
            let entry = self
                .0
                .entry(key.clone())
                .or_insert_with(|| Presence { metas: Vec::new() });
            for meta in &joined.metas {
                if !entry.metas.iter().any(|m| m.phx_ref == meta.phx_ref) {
                    entry.metas.push(meta.clone());
                }
            }
        }
        for (key, left) in &diff.leaves {
            let emptied = match self.0.get_mut(key) {
                Some(entry) => {
                    entry
                        .metas
                        .retain(|m| !left.metas.iter().any(|l| l.phx_ref == m.phx_ref));
                    entry.metas.is_empty()
                }
                None => false,
            };
            if emptied {
                self.0.remove(key);
            }
        }
    }
}

// ============================================================
// Postgres change feed
// ============================================================

#[derive(Debug, Clone, Deserialize)]
pub struct ChangePayload {
    pub data: ChangeData,
    #[serde(default)]
    pub ids: Vec<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChangeData {
    #[serde(rename = "type")]
    pub kind: String, // "INSERT", "UPDATE", "DELETE"
    pub table: String,
    #[serde(default)]
    pub schema: String,
    #[serde(default)]
    pub record: Option<Value>,
    #[serde(default)]
    pub old_record: Option<Value>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn meta(phx_ref: &str, user_id: &str) -> PresenceMeta {
        let payload = match json!({ "user_id": user_id, "display_name": user_id }) {
            Value::Object(map) => map,
            _ => unreachable!(),
        };
        PresenceMeta {
            phx_ref: phx_ref.to_string(),
            payload,
        }
    }

    #[test]
    fn envelope_round_trips_with_ref_field() {
        let env = Envelope::new("realtime:online-users", EVENT_JOIN, json!({}), Some("1".into()));
        let text = serde_json::to_string(&env).unwrap();
        assert!(text.contains("\"ref\":\"1\""));
        let back: Envelope = serde_json::from_str(&text).unwrap();
        assert_eq!(back.topic, "realtime:online-users");
        assert_eq!(back.reference.as_deref(), Some("1"));
    }

    #[test]
    fn user_ids_come_from_payloads_not_keys() {
        let mut state = PresenceState::default();
        state.0.insert(
            "conn-abc".to_string(),
            Presence {
                metas: vec![meta("r1", "user-1"), meta("r2", "user-2")],
            },
        );
        state.0.insert(
            "conn-def".to_string(),
            Presence {
                metas: vec![meta("r3", "user-1")],
            },
        );
        let ids = state.user_ids();
        assert_eq!(ids.len(), 2);
        assert!(ids.contains("user-1") && ids.contains("user-2"));
        assert!(!ids.contains("conn-abc"));
    }

    #[test]
    fn diff_joins_add_and_leaves_remove_by_ref() {
        let mut state = PresenceState::default();
        state.0.insert(
            "k1".to_string(),
            Presence {
                metas: vec![meta("r1", "user-1")],
            },
        );

        let mut diff = PresenceDiff {
            joins: HashMap::new(),
            leaves: HashMap::new(),
        };
        diff.joins.insert(
            "k2".to_string(),
            Presence {
                metas: vec![meta("r2", "user-2")],
            },
        );
        state.apply_diff(&diff);
        assert!(state.user_ids().contains("user-2"));

        let mut leave = PresenceDiff {
            joins: HashMap::new(),
            leaves: HashMap::new(),
        };
        leave.leaves.insert(
            "k1".to_string(),
            Presence {
                metas: vec![meta("r1", "user-1")],
            },
        );
        state.apply_diff(&leave);
        assert!(!state.user_ids().contains("user-1"));
        assert!(!state.0.contains_key("k1"));
    }

    #[test]
    fn leave_with_unknown_ref_keeps_other_metas() {
        let mut state = PresenceState::default();
        state.0.insert(
            "k1".to_string(),
            Presence {
                metas: vec![meta("r1", "user-1"), meta("r2", "user-1")],
            },
        );
        let mut diff = PresenceDiff {
            joins: HashMap::new(),
            leaves: HashMap::new(),
        };
        diff.leaves.insert(
            "k1".to_string(),
            Presence {
                metas: vec![meta("r1", "user-1")],
            },
        );
        state.apply_diff(&diff);
        // Second connection of the same user is still there.
        assert!(state.user_ids().contains("user-1"));
    }

    #[test]
    fn change_payload_parses_insert() {
        let payload: ChangePayload = serde_json::from_value(json!({
            "ids": [1],
            "data": {
                "type": "INSERT",
                "table": "calls",
                "schema": "public",
                "record": { "id": "call-1", "status": "ringing" }
            }
        }))
        .unwrap();
        assert_eq!(payload.data.kind, "INSERT");
        assert_eq!(
            payload.data.record.unwrap()["status"],
            Value::String("ringing".into())
        );
    }
}
