//! testsight -- historical test-quality analytics.
//!
//! This crate stores test-suite execution records and analyses them for
//! trends, anomalies, seasonal patterns, quality forecasts and prioritized
//! recommendations.

pub mod analysis;
pub mod api;
pub mod cache;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod recommend;
pub mod records;
pub mod storage;

use std::sync::Arc;

use anyhow::{Context, Result};

pub use config::AppConfig;
pub use engine::Engine;
pub use error::AnalyticsError;

/// Start the testsight daemon: storage, background analysis, retention
/// sweeps and the HTTP API.
pub async fn serve(config: AppConfig) -> Result<()> {
    let bind = config.api.bind.clone();

    tracing::info!(db_path = %config.storage.db_path, "Initializing database");
    let engine = Arc::new(Engine::open(config).context("failed to open record store")?);
    engine.start().context("failed to start background tasks")?;

    let addr: std::net::SocketAddr = bind.parse().with_context(|| format!("invalid bind address '{bind}'"))?;
    let app = api::router(api::state::AppState::new(engine.clone()));

    tracing::info!(%addr, "testsight listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    engine.shutdown();
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
