//! Model server - store/product demand prediction service
//!
//! Loads the prediction artifact and reference table once, then serves
//! enriched predictions over HTTP alongside health and metrics endpoints.

use anyhow::{Context, Result};
use model_server::{api, config::ServerConfig};
use serving_lib::{ModelAdapter, StructuredLogger};
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const SERVER_VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and env filter
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    let config = ServerConfig::load()?;
    info!(replica = %config.replica_name, model_uri = %config.model_uri, "Model server configured");

    let logger = StructuredLogger::new(&config.replica_name);
    logger.log_startup(SERVER_VERSION, &config.model_uri, config.input_mode.as_str());

    let adapter = ModelAdapter::builder(config.adapter_config())
        .cache_dir(&config.artifact_cache_dir)
        .replica_name(&config.replica_name)
        .build()
        .context("Failed to initialise artifact storage")?;
    let adapter = Arc::new(adapter);

    // Probes are answered while the model loads
    let app_state = Arc::new(api::AppState::new(adapter.clone()));
    let api_handle = tokio::spawn(api::serve(config.api_port, app_state));

    // A failed load stays visible through /healthz until the replica is restarted
    if let Err(e) = adapter.load().await {
        error!(error = %e, "Model load failed");
    }

    tokio::select! {
        result = api_handle => {
            match result {
                Ok(Ok(())) => info!("API server stopped"),
                Ok(Err(e)) => {
                    logger.log_shutdown("API server error");
                    return Err(e);
                }
                Err(e) => {
                    logger.log_shutdown("API server task panicked");
                    return Err(e.into());
                }
            }
        }
        signal = tokio::signal::ctrl_c() => {
            signal?;
            logger.log_shutdown("SIGINT received");
            info!("Shutting down");
        }
    }

    Ok(())
}
