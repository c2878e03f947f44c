//! DisasterLink reference remote authority
//!
//! Serves the alert/message sync contract from memory so field devices and
//! the CLI have something to drain against.

mod config;
mod error;
mod routes;

use std::sync::Arc;

use config::ApiConfig;
use routes::{app_router, AppState};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    #[cfg(debug_assertions)]
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("disasterlink_api=info".parse()?),
        )
        .init();

    let config = Arc::new(ApiConfig::from_env()?);
    tracing::info!("Starting disasterlink-api with config: {:?}", config);

    let state = AppState::from_config(config);
    let bind_addr = state.config.bind_addr.clone();
    let router = app_router(state);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    tracing::info!("disasterlink-api listening on {}", bind_addr);
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    tracing::info!("disasterlink-api stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {error}");
        std::future::pending::<()>().await;
    }
}
