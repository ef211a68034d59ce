use reqwest::StatusCode;
use thiserror::Error;
use tokio::sync::watch;

use crate::config::AppConfig;
use crate::models::{AuthUser, Session};

pub mod auth;
pub mod realtime;
pub mod rpc;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("backend returned {status}: {body}")]
    Status { status: StatusCode, body: String },
    #[error("decode failed: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("no active session")]
    NoSession,
    #[error("realtime socket: {0}")]
    Socket(String),
    #[error("channel join rejected: {0}")]
    ChannelRejected(String),
    #[error("realtime connection closed")]
    SocketClosed,
}

/// Client for the hosted platform's REST surface. Auth and RPC calls go
/// through here; the realtime socket lives in [`realtime`] and only
/// shares the session watch.
#[derive(Clone)]
pub struct Backend {
    http: reqwest::Client,
    base_url: String,
    anon_key: String,
    session_tx: watch::Sender<Option<Session>>,
}

impl Backend {
    pub fn new(config: &AppConfig) -> Self {
        let (session_tx, _) = watch::channel(None);
        Self {
            http: reqwest::Client::new(),
            base_url: config.backend_url.clone(),
            anon_key: config.anon_key.clone(),
            session_tx,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn session(&self) -> Option<Session> {
        self.session_tx.borrow().clone()
    }

    /// Current signed-in user, `None` when signed out. Observers use
    /// this as their no-op guard.
    pub fn current_user(&self) -> Option<AuthUser> {
        self.session_tx.borrow().as_ref().map(|s| s.user.clone())
    }

    /// Watch that flips whenever the session changes. Observers park on
    /// it until a user signs in.
    pub fn session_watch(&self) -> watch::Receiver<Option<Session>> {
        self.session_tx.subscribe()
    }

    pub(crate) fn set_session(&self, session: Option<Session>) {
        let _ = self.session_tx.send(session);
    }

    /// Bearer token for REST calls and channel joins. Falls back to the
    /// publishable key so anonymous reads still work.
    pub fn access_token(&self) -> String {
        self.session_tx
            .borrow()
            .as_ref()
            .map(|s| s.access_token.clone())
            .unwrap_or_else(|| self.anon_key.clone())
    }

    pub(crate) fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        self.http
            .request(method, format!("{}{}", self.base_url, path))
            .header("apikey", &self.anon_key)
            .bearer_auth(self.access_token())
    }
}

/// Reads the body of a failed response into a [`BackendError::Status`].
pub(crate) async fn error_from_response(resp: reqwest::Response) -> BackendError {
    let status = resp.status();
    let body = resp.text().await.unwrap_or_default();
    BackendError::Status { status, body }
}
