//! Server configuration

use anyhow::{Context, Result};
use serde::Deserialize;
use serving_lib::reference::{KeyColumns, PRODUCT_KEY_COLUMN, STORE_KEY_COLUMN};
use serving_lib::{AdapterConfig, InputMode};

/// Optional config file, any extension the `config` crate understands
const CONFIG_FILE: &str = "model-server";

/// Server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Artifact location (local path, file:// or http(s)://)
    #[serde(default = "default_model_uri")]
    pub model_uri: String,

    /// Reference table location
    #[serde(default = "default_reference_uri")]
    pub reference_uri: String,

    /// How enriched features are passed to the artifact
    #[serde(default)]
    pub input_mode: InputMode,

    #[serde(default = "default_store_key_column")]
    pub store_key_column: String,

    #[serde(default = "default_product_key_column")]
    pub product_key_column: String,

    /// Where remote artifacts are downloaded to
    #[serde(default = "default_artifact_cache_dir")]
    pub artifact_cache_dir: String,

    /// HTTP port for predictions, health and metrics
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    /// Replica name attached to structured log events
    #[serde(default = "default_replica_name")]
    pub replica_name: String,
}

fn default_model_uri() -> String {
    "/mnt/models".to_string()
}

fn default_reference_uri() -> String {
    "/mnt/models/reference.csv".to_string()
}

fn default_store_key_column() -> String {
    STORE_KEY_COLUMN.to_string()
}

fn default_product_key_column() -> String {
    PRODUCT_KEY_COLUMN.to_string()
}

fn default_artifact_cache_dir() -> String {
    serving_lib::adapter::DEFAULT_CACHE_DIR.to_string()
}

fn default_api_port() -> u16 {
    9000
}

fn default_replica_name() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string())
}

impl ServerConfig {
    /// Load configuration from an optional file, then the environment
    pub fn load() -> Result<Self> {
        let config = config::Config::builder()
            .add_source(config::File::with_name(CONFIG_FILE).required(false))
            .add_source(config::Environment::with_prefix("MODEL_SERVER"))
            .build()
            .context("Failed to read configuration")?;

        config
            .try_deserialize()
            .context("Invalid model server configuration")
    }

    /// Settings handed to the serving adapter
    pub fn adapter_config(&self) -> AdapterConfig {
        AdapterConfig::new(&self.model_uri, &self.reference_uri)
            .with_input_mode(self.input_mode)
            .with_key_columns(KeyColumns {
                store: self.store_key_column.clone(),
                product: self.product_key_column.clone(),
            })
    }
}
