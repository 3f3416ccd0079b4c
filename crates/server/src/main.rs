//! ChatServe - Main Entry Point
//!
//! Loads the model once, then serves `POST /chat` until interrupted. A load
//! failure exits before the listener is bound.

use chatserve_common::config::{CONFIG_PATH_ENV, DEFAULT_CONFIG_PATH};
use chatserve_common::{Result, ServerConfig, METRICS};
use chatserve_engine::{load_model, Capabilities};
use chatserve_server::{router, AppState};
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config_path =
        std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
    let config = ServerConfig::load(&config_path)?;

    // Initialize logging
    let level = &config.observability.log_level;
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!(
                    "chatserve={level},chatserve_server={level},chatserve_engine={level},tower_http={level}"
                )
                .into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting ChatServe");
    info!(
        "Configuration loaded from {}: bind={}:{}, model={}",
        config_path,
        config.bind_address,
        config.port,
        config.model.path.display()
    );

    let loaded = match load_model(&config.model, Capabilities::probe()) {
        Ok(loaded) => loaded,
        Err(e) => {
            error!("Failed to load model: {}", e);
            return Err(e);
        }
    };
    METRICS
        .server
        .model_load_seconds
        .set(loaded.load_duration.as_secs_f64());
    info!("Model loaded successfully");

    let generator = Arc::new(loaded.into_generator(&config.generation));
    let state = AppState::new(
        generator,
        &config.limits,
        config.observability.enable_metrics,
    );

    let addr = config.socket_addr()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("ChatServe listening on {}", addr);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("ChatServe shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Received shutdown signal");
}
