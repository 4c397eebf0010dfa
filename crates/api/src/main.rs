//! Deskline API server

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio_util::sync::CancellationToken;

use deskline_api::{
    routes::create_router,
    store::{ChatStore, MemoryStore, PgStore},
    websocket::PresenceRelay,
    AppState, Config,
};

/// How often expired observer entries are purged
const OBSERVER_CLEANUP_INTERVAL: Duration = Duration::from_secs(60 * 60);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let config = Config::from_env().context("Failed to load configuration")?;
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Starting Deskline API");

    let store: Arc<dyn ChatStore> = match &config.database_url {
        Some(url) => {
            let pool = deskline_shared::create_pool(url, config.database_max_connections)
                .await
                .context("Failed to connect to database")?;
            deskline_shared::run_migrations(&pool)
                .await
                .context("Failed to run migrations")?;
            tracing::info!("Using Postgres store");
            Arc::new(PgStore::new(pool))
        }
        None => {
            tracing::warn!("DATABASE_URL not set, using in-memory store (all tickets open)");
            Arc::new(MemoryStore::permissive())
        }
    };

    let bind_address = config.bind_address.clone();
    let state = AppState::new(config, store).context("Invalid configuration")?;

    let shutdown = CancellationToken::new();
    let cleanup = tokio::spawn(observer_cleanup(
        Arc::clone(&state.ws_state.relay),
        shutdown.clone(),
    ));

    let listener = tokio::net::TcpListener::bind(&bind_address)
        .await
        .with_context(|| format!("Failed to bind {bind_address}"))?;
    tracing::info!(address = %bind_address, "Listening");

    let signal = shutdown.clone();
    axum::serve(listener, create_router(state))
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for shutdown signal");
            }
            tracing::info!("Shutdown signal received");
            signal.cancel();
        })
        .await
        .context("Server error")?;

    shutdown.cancel();
    let _ = cleanup.await;
    tracing::info!("Server stopped");
    Ok(())
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("deskline_api=info,tower_http=info"));

    if std::env::var("LOG_FORMAT").is_ok_and(|format| format == "json") {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

/// Periodically purge expired observer entries until shutdown
async fn observer_cleanup(relay: Arc<PresenceRelay>, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(OBSERVER_CLEANUP_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                let removed = relay.cleanup();
                if removed > 0 {
                    tracing::info!(removed, "Purged expired observer entries");
                }
            }
        }
    }
}
