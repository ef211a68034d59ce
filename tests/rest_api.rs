use amora_lib::api;
use amora_lib::config::AppConfig;
use axum::{http::StatusCode, routing::post, Json, Router};
use futures_util::StreamExt;
use tokio::time::{sleep, timeout, Duration};

fn next_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .expect("bind ephemeral port")
        .local_addr()
        .unwrap()
        .port()
}

async fn wait_for_health(base_url: &str) {
    let client = reqwest::Client::new();
    for _ in 0..50 {
        if let Ok(resp) = client.get(format!("{base_url}/api/v1/health")).send().await {
            if resp.status().is_success() {
                return;
            }
        }
        sleep(Duration::from_millis(100)).await;
    }
    panic!("server did not become healthy in time");
}

async fn wait_until<F, Fut, T>(mut check: F) -> T
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Option<T>>,
{
    timeout(Duration::from_secs(10), async {
        loop {
            if let Some(value) = check().await {
                break value;
            }
            sleep(Duration::from_millis(100)).await;
        }
    })
    .await
    .expect("condition not met in time")
}

// Minimal stand-in for the hosted platform: password grant, sign-out,
// and the stored procedures the observers call.
fn stub_backend_router() -> Router {
    Router::new()
        .route(
            "/auth/v1/token",
            post(|| async {
                Json(serde_json::json!({
                    "access_token": "stub-jwt",
                    "expires_in": 3600,
                    "expires_at": 1_924_992_000i64,
                    "user": {
                        "id": "user-1",
                        "email": "ada@example.com",
                        "user_metadata": { "display_name": "Ada" }
                    }
                }))
            }),
        )
        .route("/auth/v1/logout", post(|| async { StatusCode::NO_CONTENT }))
        .route(
            "/rest/v1/rpc/get_stream_viewers",
            post(|| async {
                Json(serde_json::json!([
                    {
                        "viewer_id": "user-2",
                        "display_name": "Bea",
                        "is_guest": false,
                        "joined_at": "2024-05-01T10:00:00Z"
                    },
                    {}
                ]))
            }),
        )
        .route(
            "/rest/v1/rpc/send_gift",
            post(|| async { Json(serde_json::json!({ "balance": 120 })) }),
        )
}

async fn spawn_stub_backend() -> (String, tokio::task::JoinHandle<()>) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind stub backend");
    let addr = listener.local_addr().expect("stub backend addr");
    let server = tokio::spawn(async move {
        let _ = axum::serve(listener, stub_backend_router()).await;
    });
    (format!("http://{addr}"), server)
}

async fn spawn_app(backend_url: &str) -> (String, u16, tokio::task::JoinHandle<()>) {
    let port = next_port();
    let config = AppConfig {
        api_port: port,
        backend_url: backend_url.to_string(),
        anon_key: "test-anon-key".to_string(),
        stun_urls: vec!["stun:stun.l.google.com:19302".to_string()],
        turn: None,
    };
    let ctx = amora_lib::create_service_context(config).await;
    let server = tokio::spawn(async move {
        api::server::start_api_server(ctx, port).await;
    });
    let base_url = format!("http://127.0.0.1:{port}");
    wait_for_health(&base_url).await;
    (base_url, port, server)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn rest_surface_round_trip() {
    let (backend_url, stub) = spawn_stub_backend().await;
    let (base_url, _port, server) = spawn_app(&backend_url).await;
    let client = reqwest::Client::new();

    // Signed out: empty session, empty presence, idle stream, no call.
    let session: serde_json::Value = client
        .get(format!("{base_url}/api/v1/auth/session"))
        .send()
        .await
        .expect("session resp")
        .json()
        .await
        .expect("session json");
    assert!(session["session"].is_null());

    let presence: serde_json::Value = client
        .get(format!("{base_url}/api/v1/presence"))
        .send()
        .await
        .expect("presence resp")
        .json()
        .await
        .expect("presence json");
    assert_eq!(presence["online"], serde_json::json!([]));

    let check: serde_json::Value = client
        .get(format!("{base_url}/api/v1/presence/user-9"))
        .send()
        .await
        .expect("check resp")
        .json()
        .await
        .expect("check json");
    assert_eq!(check["online"], serde_json::json!(false));

    let state: serde_json::Value = client
        .get(format!("{base_url}/api/v1/stream/state"))
        .send()
        .await
        .expect("state resp")
        .json()
        .await
        .expect("state json");
    assert_eq!(state["in_stream"], serde_json::json!(false));
    assert_eq!(state["connected"], serde_json::json!(false));

    let quality: serde_json::Value = client
        .get(format!("{base_url}/api/v1/stream/quality"))
        .send()
        .await
        .expect("quality resp")
        .json()
        .await
        .expect("quality json");
    assert!(quality["quality"].is_null());

    let incoming: serde_json::Value = client
        .get(format!("{base_url}/api/v1/calls/incoming"))
        .send()
        .await
        .expect("incoming resp")
        .json()
        .await
        .expect("incoming json");
    assert!(incoming["call"].is_null());

    // Accepting a call that is not ringing fails.
    let resp = client
        .post(format!("{base_url}/api/v1/calls/nope/accept"))
        .send()
        .await
        .expect("accept resp");
    assert_eq!(resp.status(), reqwest::StatusCode::INTERNAL_SERVER_ERROR);

    // Sign in through the stub and read the session back.
    let signed_in: serde_json::Value = client
        .post(format!("{base_url}/api/v1/auth/sign-in"))
        .json(&serde_json::json!({ "email": "ada@example.com", "password": "pw" }))
        .send()
        .await
        .expect("sign-in resp")
        .json()
        .await
        .expect("sign-in json");
    assert_eq!(signed_in["user"]["id"], serde_json::json!("user-1"));
    assert_eq!(signed_in["user"]["display_name"], serde_json::json!("Ada"));

    let session: serde_json::Value = client
        .get(format!("{base_url}/api/v1/auth/session"))
        .send()
        .await
        .expect("session resp")
        .json()
        .await
        .expect("session json");
    assert_eq!(session["session"]["user"]["id"], serde_json::json!("user-1"));

    // Notification preferences: defaults, update, invalid level.
    let prefs: serde_json::Value = client
        .get(format!("{base_url}/api/v1/notifications"))
        .send()
        .await
        .expect("prefs resp")
        .json()
        .await
        .expect("prefs json");
    assert_eq!(prefs, serde_json::json!({ "calls": "all", "streams": "all" }));

    let updated: serde_json::Value = client
        .put(format!("{base_url}/api/v1/notifications"))
        .json(&serde_json::json!({ "calls": "none", "streams": "all" }))
        .send()
        .await
        .expect("put prefs resp")
        .json()
        .await
        .expect("put prefs json");
    assert_eq!(updated["calls"], serde_json::json!("none"));

    let invalid = client
        .put(format!("{base_url}/api/v1/notifications"))
        .json(&serde_json::json!({ "calls": "loud", "streams": "all" }))
        .send()
        .await
        .expect("invalid prefs resp");
    assert_eq!(invalid.status(), reqwest::StatusCode::BAD_REQUEST);

    // Viewer registry: watch, wait for the refetch, unwatch.
    let watch: serde_json::Value = client
        .post(format!("{base_url}/api/v1/sessions/live-1/viewers/watch"))
        .send()
        .await
        .expect("watch resp")
        .json()
        .await
        .expect("watch json");
    assert_eq!(watch["ok"], serde_json::json!(true));

    let viewers = wait_until(|| async {
        let json: serde_json::Value = client
            .get(format!("{base_url}/api/v1/sessions/live-1/viewers"))
            .send()
            .await
            .ok()?
            .json()
            .await
            .ok()?;
        let viewers = json.get("viewers")?.as_array()?.clone();
        if viewers.is_empty() {
            return None;
        }
        Some(viewers)
    })
    .await;
    assert_eq!(viewers.len(), 2);
    assert_eq!(viewers[0]["display_name"], serde_json::json!("Bea"));
    assert_eq!(viewers[0]["is_guest"], serde_json::json!(false));
    // The row with no viewer id normalizes to an anonymous guest.
    assert_eq!(viewers[1]["display_name"], serde_json::json!("Guest"));
    assert_eq!(viewers[1]["is_guest"], serde_json::json!(true));

    client
        .post(format!("{base_url}/api/v1/sessions/live-1/viewers/unwatch"))
        .send()
        .await
        .expect("unwatch resp");

    let after: serde_json::Value = client
        .get(format!("{base_url}/api/v1/sessions/live-1/viewers"))
        .send()
        .await
        .expect("after resp")
        .json()
        .await
        .expect("after json");
    assert_eq!(after["watching"], serde_json::json!(false));

    // Gift passthrough returns whatever the procedure returned.
    let gift: serde_json::Value = client
        .post(format!("{base_url}/api/v1/shop/gift"))
        .json(&serde_json::json!({ "recipient_id": "user-2", "gift_id": "rose" }))
        .send()
        .await
        .expect("gift resp")
        .json()
        .await
        .expect("gift json");
    assert_eq!(gift["balance"], serde_json::json!(120));

    // Sign out clears the session.
    client
        .post(format!("{base_url}/api/v1/auth/sign-out"))
        .send()
        .await
        .expect("sign-out resp");
    let session: serde_json::Value = client
        .get(format!("{base_url}/api/v1/auth/session"))
        .send()
        .await
        .expect("session resp")
        .json()
        .await
        .expect("session json");
    assert!(session["session"].is_null());

    server.abort();
    stub.abort();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn websocket_bridge_forwards_events() {
    let (backend_url, stub) = spawn_stub_backend().await;
    let (base_url, port, server) = spawn_app(&backend_url).await;

    let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://127.0.0.1:{port}/ws"))
        .await
        .expect("connect ws");
    // Give the server side a moment to subscribe to the event bus.
    sleep(Duration::from_millis(100)).await;

    let client = reqwest::Client::new();
    client
        .post(format!("{base_url}/api/v1/auth/sign-in"))
        .json(&serde_json::json!({ "email": "ada@example.com", "password": "pw" }))
        .send()
        .await
        .expect("sign-in resp");

    let event = timeout(Duration::from_secs(5), async {
        loop {
            let msg = ws.next().await.expect("ws stream ended").expect("ws frame");
            if let tokio_tungstenite::tungstenite::Message::Text(text) = msg {
                let json: serde_json::Value = serde_json::from_str(&text).expect("event json");
                if json["type"] == serde_json::json!("SignedIn") {
                    break json;
                }
            }
        }
    })
    .await
    .expect("no SignedIn event on the bridge");

    assert_eq!(event["data"]["user_id"], serde_json::json!("user-1"));
    assert_eq!(event["data"]["display_name"], serde_json::json!("Ada"));

    server.abort();
    stub.abort();
}
