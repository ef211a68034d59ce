pub mod engine;
pub mod peer;
pub mod quality;

use serde::{Deserialize, Serialize};

use crate::models::StreamRole;

/// Commands sent to the stream engine from API routes.
#[derive(Debug)]
pub enum StreamCommand {
    JoinStream {
        session_id: String,
        role: StreamRole,
    },
    LeaveStream,
}

/// Current stream state snapshot returned by GET /stream/state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamState {
    pub in_stream: bool,
    pub session_id: Option<String>,
    pub role: Option<StreamRole>,
    pub connected: bool,
}

impl Default for StreamState {
    fn default() -> Self {
        Self {
            in_stream: false,
            session_id: None,
            role: None,
            connected: false,
        }
    }
}
