use anyhow::Context;
use axum::Router;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{error, info};

use csv_query_backend::api::{handlers::AppState, routes};
use csv_query_backend::config::Config;
use csv_query_backend::services::spawn_sweeper;
use csv_query_backend::storage;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration first so the log level can fall back to it
    let config = Config::from_env().context("Failed to load configuration")?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.level)),
        )
        .with_ansi(config.logging.style != "never")
        .init();

    info!("Starting server on {}", config.server_address());

    storage::prepare_data_dir(&config.storage.data_dir).with_context(|| {
        format!("Failed to prepare data directory {}", config.storage.data_dir.display())
    })?;

    let state = AppState::new(config.clone()).context("Failed to initialize services")?;
    let sweeper = spawn_sweeper(Arc::clone(&state.sessions), config.sweep_interval());

    let app: Router = routes::create_router_with_state(state);

    let addr: SocketAddr = config
        .server_address()
        .parse()
        .with_context(|| format!("Invalid server address {}", config.server_address()))?;
    info!("Server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    sweeper.abort();
    info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
