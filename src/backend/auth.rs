use chrono::{TimeZone, Utc};
use serde::Deserialize;
use serde_json::Value;
use tracing::{info, warn};

use super::{error_from_response, Backend, BackendError};
use crate::models::{AuthUser, Session};

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: i64,
    expires_at: Option<i64>,
    user: WireUser,
}

#[derive(Debug, Deserialize)]
struct WireUser {
    id: String,
    email: Option<String>,
    #[serde(default)]
    user_metadata: Value,
}

/// Password-grant sign-in. Stores the session on the backend handle so
/// the observers see it through their session watch.
pub async fn sign_in_with_password(
    backend: &Backend,
    email: &str,
    password: &str,
) -> Result<Session, BackendError> {
    let resp = backend
        .request(reqwest::Method::POST, "/auth/v1/token?grant_type=password")
        .json(&serde_json::json!({ "email": email, "password": password }))
        .send()
        .await?;
    if !resp.status().is_success() {
        return Err(error_from_response(resp).await);
    }
    let token: TokenResponse = resp.json().await?;
    let session = session_from_token(token);
    info!("Signed in as {}", session.user.display_name);
    backend.set_session(Some(session.clone()));
    Ok(session)
}

/// Best-effort server-side revoke, then clear the local session either way.
pub async fn sign_out(backend: &Backend) {
    if let Err(e) = backend
        .request(reqwest::Method::POST, "/auth/v1/logout")
        .send()
        .await
    {
        warn!("Sign-out request failed: {e}");
    }
    backend.set_session(None);
}

fn session_from_token(token: TokenResponse) -> Session {
    let expires_at = token
        .expires_at
        .and_then(|ts| Utc.timestamp_opt(ts, 0).single())
        .unwrap_or_else(|| Utc::now() + chrono::Duration::seconds(token.expires_in));
    let meta = &token.user.user_metadata;
    let display_name = meta
        .get("display_name")
        .and_then(Value::as_str)
        .map(str::to_string)
        .or_else(|| {
            token
                .user
                .email
                .as_deref()
                .and_then(|e| e.split('@').next())
                .map(str::to_string)
        })
        .unwrap_or_else(|| "Unknown".to_string());
    let avatar_url = meta
        .get("avatar_url")
        .and_then(Value::as_str)
        .map(str::to_string);

    Session {
        access_token: token.access_token,
        expires_at: expires_at.to_rfc3339(),
        user: AuthUser {
            id: token.user.id,
            email: token.user.email,
            display_name,
            avatar_url,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token(metadata: Value, email: Option<&str>) -> TokenResponse {
        TokenResponse {
            access_token: "jwt".to_string(),
            expires_in: 3600,
            expires_at: Some(1_700_000_000),
            user: WireUser {
                id: "user-1".to_string(),
                email: email.map(str::to_string),
                user_metadata: metadata,
            },
        }
    }

    #[test]
    fn maps_metadata_into_user_fields() {
        let session = session_from_token(token(
            serde_json::json!({ "display_name": "Ada", "avatar_url": "https://cdn/a.png" }),
            Some("ada@example.com"),
        ));
        assert_eq!(session.user.display_name, "Ada");
        assert_eq!(session.user.avatar_url.as_deref(), Some("https://cdn/a.png"));
        assert!(session.expires_at.starts_with("2023-11-14T22:13:20"));
    }

    #[test]
    fn falls_back_to_email_prefix_without_metadata() {
        let session = session_from_token(token(Value::Null, Some("ada@example.com")));
        assert_eq!(session.user.display_name, "ada");
        assert!(session.user.avatar_url.is_none());
    }

    #[test]
    fn unknown_when_neither_metadata_nor_email() {
        let session = session_from_token(token(Value::Null, None));
        assert_eq!(session.user.display_name, "Unknown");
    }
}
