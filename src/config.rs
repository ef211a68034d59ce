use std::{env, fmt::Display, str::FromStr};

use tracing::warn;

pub const DEFAULT_API_PORT: u16 = 9870;
const DEFAULT_BACKEND_URL: &str = "http://127.0.0.1:54321";
const DEFAULT_STUN_URLS: &str = "stun:stun.l.google.com:19302,stun:stun1.l.google.com:19302";

#[derive(Debug, Clone)]
pub struct TurnConfig {
    pub url: String,
    pub username: String,
    pub credential: String,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Local API port, overridable from the CLI.
    pub api_port: u16,
    /// Base URL of the hosted backend (REST, auth and realtime share it).
    pub backend_url: String,
    /// Publishable API key sent on every backend request.
    pub anon_key: String,
    pub stun_urls: Vec<String>,
    /// Only set when url, username and credential are all configured.
    pub turn: Option<TurnConfig>,
}

impl AppConfig {
    pub fn from_env() -> Self {
        Self::from_vars(|key| env::var(key).ok())
    }

    pub(crate) fn from_vars(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let backend_url = lookup("AMORA_BACKEND_URL").unwrap_or_else(|| {
            warn!("AMORA_BACKEND_URL not set, using {DEFAULT_BACKEND_URL}");
            DEFAULT_BACKEND_URL.to_string()
        });
        let anon_key = lookup("AMORA_ANON_KEY").unwrap_or_else(|| {
            warn!("AMORA_ANON_KEY not set, backend requests will be rejected");
            String::new()
        });
        let stun_urls = lookup("AMORA_STUN_URLS")
            .unwrap_or_else(|| DEFAULT_STUN_URLS.to_string())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        let turn = match (
            lookup("AMORA_TURN_URL"),
            lookup("AMORA_TURN_USERNAME"),
            lookup("AMORA_TURN_CREDENTIAL"),
        ) {
            (Some(url), Some(username), Some(credential)) => Some(TurnConfig {
                url,
                username,
                credential,
            }),
            (None, None, None) => None,
            _ => {
                warn!("Incomplete TURN configuration ignored, set url, username and credential");
                None
            }
        };

        Self {
            api_port: parse_or_default(&lookup, "AMORA_API_PORT", DEFAULT_API_PORT),
            backend_url: backend_url.trim_end_matches('/').to_string(),
            anon_key,
            stun_urls,
            turn,
        }
    }

    /// Realtime socket endpoint derived from the backend base URL.
    pub fn realtime_url(&self) -> String {
        let ws_base = if let Some(rest) = self.backend_url.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = self.backend_url.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            format!("ws://{}", self.backend_url)
        };
        format!(
            "{ws_base}/realtime/v1/websocket?apikey={}&vsn=1.0.0",
            self.anon_key
        )
    }
}

fn parse_or_default<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T
where
    T::Err: Display,
{
    match lookup(key) {
        None => default,
        Some(raw) => raw.parse().unwrap_or_else(|e| {
            warn!("Invalid {key} value ({e}), using default");
            default
        }),
    }
}
