use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use parley_gateway::config::Config;
use parley_gateway::gateway::calls::CallRegistry;
use parley_gateway::gateway::presence::PresenceRegistry;
use parley_gateway::gateway::rooms::RoomRouter;
use parley_gateway::store::memory::{MemoryNotifier, MemoryStore};
use parley_gateway::AppState;

#[tokio::main]
async fn main() {
    // Load .env file (silently skip if missing — env vars may be set externally)
    if dotenvy::dotenv().is_err() {
        let env_path = Path::new(env!("CARGO_MANIFEST_DIR")).join(".env");
        let _ = dotenvy::from_path(env_path);
    }

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env();
    let port = config.port;

    // In-memory store and notifier for single-process mode. Swap for the
    // database-backed implementations when running against the full stack.
    let store = Arc::new(MemoryStore::new());
    let notifier = Arc::new(MemoryNotifier::new());

    let state = AppState {
        config: Arc::new(config),
        store: store.clone(),
        receipts: store.clone(),
        reactions: store,
        notifier,
        presence: Arc::new(PresenceRegistry::new()),
        rooms: Arc::new(RoomRouter::new()),
        calls: Arc::new(CallRegistry::new()),
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .merge(parley_gateway::gateway::server::router())
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!(%addr, "gateway listening");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("failed to bind");
    axum::serve(listener, app).await.expect("server error");
}
