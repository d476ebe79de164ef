use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use futures_util::{SinkExt, StreamExt};
use jsonwebtoken::{EncodingKey, Header};
use tokio::net::TcpStream;
use tokio::time;
use tokio_tungstenite::tungstenite;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use parley_gateway::auth::TokenClaims;
use parley_gateway::config::Config;
use parley_gateway::gateway::calls::CallRegistry;
use parley_gateway::gateway::presence::PresenceRegistry;
use parley_gateway::gateway::rooms::RoomRouter;
use parley_gateway::store::{Conversation, MemoryNotifier, MemoryStore, User};
use parley_gateway::AppState;

pub const TEST_SECRET: &str = "gateway-test-secret";

/// Short timers so expiry paths are observable in tests.
pub const TEST_RINGING_TIMEOUT: Duration = Duration::from_millis(400);
pub const TEST_TYPING_EXPIRY: Duration = Duration::from_millis(200);

pub type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub struct TestServer {
    pub addr: SocketAddr,
    pub state: AppState,
    pub store: Arc<MemoryStore>,
    pub notifier: Arc<MemoryNotifier>,
}

/// Start a real TCP server wired to in-memory collaborators. The server runs
/// in the background for the rest of the test.
pub async fn start_server() -> TestServer {
    let store = Arc::new(MemoryStore::new());
    let notifier = Arc::new(MemoryNotifier::new());

    let config = Config {
        port: 0,
        jwt_secret: TEST_SECRET.to_string(),
        ringing_timeout: TEST_RINGING_TIMEOUT,
        typing_expiry: TEST_TYPING_EXPIRY,
    };

    let state = AppState {
        config: Arc::new(config),
        store: store.clone(),
        receipts: store.clone(),
        reactions: store.clone(),
        notifier: notifier.clone(),
        presence: Arc::new(PresenceRegistry::new()),
        rooms: Arc::new(RoomRouter::new()),
        calls: Arc::new(CallRegistry::new()),
    };

    let app = Router::new()
        .merge(parley_gateway::gateway::server::router())
        .with_state(state.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    TestServer {
        addr,
        state,
        store,
        notifier,
    }
}

pub fn seed_user(store: &MemoryStore, id: &str, username: &str) {
    store.insert_user(User {
        id: id.to_string(),
        username: username.to_string(),
        avatar_url: None,
        fcm_tokens: vec![],
    });
}

pub fn seed_user_with_tokens(store: &MemoryStore, id: &str, username: &str, tokens: &[&str]) {
    store.insert_user(User {
        id: id.to_string(),
        username: username.to_string(),
        avatar_url: None,
        fcm_tokens: tokens.iter().map(|t| t.to_string()).collect(),
    });
}

pub fn seed_direct(store: &MemoryStore, id: &str, a: &str, b: &str) {
    store.insert_conversation(Conversation {
        id: id.to_string(),
        name: None,
        is_group: false,
        participant_ids: vec![a.to_string(), b.to_string()],
        last_message_id: None,
    });
}

pub fn seed_group(store: &MemoryStore, id: &str, name: &str, participants: &[&str]) {
    store.insert_conversation(Conversation {
        id: id.to_string(),
        name: Some(name.to_string()),
        is_group: true,
        participant_ids: participants.iter().map(|p| p.to_string()).collect(),
        last_message_id: None,
    });
}

pub fn mint_token(user_id: &str) -> String {
    let claims = TokenClaims {
        sub: user_id.to_string(),
        exp: chrono::Utc::now().timestamp() + 300,
    };
    jsonwebtoken::encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(TEST_SECRET.as_bytes()),
    )
    .expect("mint test token")
}

/// Open an authenticated gateway connection for a user.
pub async fn connect(addr: SocketAddr, user_id: &str) -> WsClient {
    let token = mint_token(user_id);
    let url = format!("ws://{addr}/gateway?token={token}");
    let (ws, _) = tokio_tungstenite::connect_async(&url)
        .await
        .expect("ws connect");
    ws
}

pub async fn send_frame(ws: &mut WsClient, frame: serde_json::Value) {
    ws.send(tungstenite::Message::Text(frame.to_string().into()))
        .await
        .expect("ws send");
}

/// Receive the next event frame, with a timeout.
pub async fn recv_event(ws: &mut WsClient) -> serde_json::Value {
    loop {
        let msg = time::timeout(Duration::from_secs(2), ws.next())
            .await
            .expect("timeout waiting for event")
            .expect("stream ended")
            .expect("ws read error");
        match msg {
            tungstenite::Message::Text(text) => {
                return serde_json::from_str(&text).expect("parse event")
            }
            tungstenite::Message::Ping(_) | tungstenite::Message::Pong(_) => continue,
            other => panic!("unexpected frame: {other:?}"),
        }
    }
}

/// Receive events until one matches `event_name`, skipping unrelated
/// broadcasts (status changes from other tests' users, etc.).
pub async fn recv_named(ws: &mut WsClient, event_name: &str) -> serde_json::Value {
    for _ in 0..20 {
        let frame = recv_event(ws).await;
        if frame["event"] == event_name {
            return frame;
        }
    }
    panic!("no {event_name} event within 20 frames");
}

/// Assert no event frame arrives within `window`.
pub async fn assert_silent(ws: &mut WsClient, window: Duration) {
    match time::timeout(window, ws.next()).await {
        Err(_) => {}
        Ok(Some(Ok(tungstenite::Message::Text(text)))) => {
            panic!("expected silence, got: {text}")
        }
        Ok(_) => {}
    }
}

/// Assert no frame with `event_name` arrives within `window`; unrelated
/// frames are skipped.
pub async fn assert_no_named(ws: &mut WsClient, event_name: &str, window: Duration) {
    let deadline = time::Instant::now() + window;
    loop {
        let remaining = deadline.saturating_duration_since(time::Instant::now());
        if remaining.is_zero() {
            return;
        }
        match time::timeout(remaining, ws.next()).await {
            Err(_) => return,
            Ok(Some(Ok(tungstenite::Message::Text(text)))) => {
                let frame: serde_json::Value = serde_json::from_str(&text).expect("parse event");
                assert_ne!(frame["event"], event_name, "unexpected {event_name}: {frame}");
            }
            Ok(_) => continue,
        }
    }
}
