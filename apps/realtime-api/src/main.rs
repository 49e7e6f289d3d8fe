use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use realtime_api::config::Config;
use realtime_api::gateway::backplane::MemoryBackplane;
use realtime_api::stores::devices::MemoryDeviceDirectory;
use realtime_api::stores::ledger::MemoryPointLedger;
use realtime_api::stores::message::MemoryMessageStore;
use realtime_api::AppState;

#[tokio::main]
async fn main() {
    // Load .env file (silently skip if missing; env vars may be set externally)
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

    tracing::info!(
        instance_id = %config.instance_id,
        worker_id = config.worker_id,
        "realtime-api configured"
    );

    // In-memory backplane and stores for single-node deployments. Swap for
    // the shared-store implementations when running multiple instances.
    let state = AppState::new(
        config,
        Arc::new(MemoryBackplane::new()),
        Arc::new(MemoryMessageStore::new()),
        Arc::new(MemoryPointLedger::new()),
        Arc::new(MemoryDeviceDirectory::new()),
    );

    state.spawn_router();
    realtime_api::tasks::spawn_all(&state);

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .merge(realtime_api::routes::router())
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!(%addr, "realtime-api listening");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("failed to bind");
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received");
        })
        .await
        .expect("server error");
}
