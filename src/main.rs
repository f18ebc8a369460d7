//! Live battle backend entrypoint wiring REST, WebSocket, SSE and storage.

use std::{env, net::SocketAddr, sync::Arc};

use anyhow::Context;
use axum::Router;
use tokio::net::TcpListener;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use live_battle_back::{
    config::AppConfig,
    dao::battle_store::{BattleStore, memory::MemoryBattleStore},
    routes,
    state::{AppState, SharedState},
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let config = AppConfig::load();
    let app_state = build_state(config);

    let app = build_router(app_state);

    let port = env::var("PORT")
        .or_else(|_| env::var("SERVER_PORT"))
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(8080);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!(%addr, "starting server");

    let listener = TcpListener::bind(addr).await.context("binding server")?;
    let service = app.into_make_service();
    axum::serve(listener, service)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serving axum")?;

    Ok(())
}

/// Pick the storage backend: MongoDB when `MONGO_URI` is set, memory otherwise.
fn build_state(config: AppConfig) -> SharedState {
    #[cfg(feature = "mongo-store")]
    if env::var("MONGO_URI").is_ok() {
        let state = AppState::new(config);
        tokio::spawn(live_battle_back::services::storage_supervisor::run(
            state.clone(),
            connect_mongo,
        ));
        info!("starting in degraded mode until MongoDB is reachable");
        return state;
    }

    warn!("MONGO_URI not set; battles are kept in memory only");
    let store: Arc<dyn BattleStore> = Arc::new(MemoryBattleStore::new());
    AppState::with_store(config, store)
}

#[cfg(feature = "mongo-store")]
async fn connect_mongo()
-> Result<Arc<dyn BattleStore>, live_battle_back::dao::storage::StorageError> {
    use live_battle_back::dao::battle_store::mongodb::{MongoBattleStore, MongoConfig};

    let config = MongoConfig::from_env().await?;
    let store = MongoBattleStore::connect(config).await?;
    Ok(Arc::new(store))
}

/// Build the top-level router and attach cross-cutting middleware layers.
fn build_router(state: SharedState) -> Router<()> {
    routes::router(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

/// Configure tracing subscribers so logs include spans by default.
fn init_tracing() {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,tower_http=debug".into());
    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Wait for Ctrl+C or SIGTERM and shut the server down gracefully.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {},
                    _ = term.recv() => {},
                }
            }
            Err(err) => {
                warn!(error = %err, "cannot install SIGTERM handler; waiting for Ctrl+C");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
