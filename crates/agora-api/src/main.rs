//! `agora-api` binary entrypoint.
//!
//! Loads configuration from environment variables, opens the store, loads
//! capability schemas, and starts the HTTP server plus background runner.

#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]

use std::sync::Arc;

use anyhow::Result;
use tracing_subscriber::EnvFilter;

use agora_api::config::Config;
use agora_api::server::Server;
use agora_flow::SchemaRegistry;
use agora_store::Store;

fn init_logging(debug: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if debug {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;
    init_logging(config.debug);

    let store = if let Some(path) = config.database_path.as_deref() {
        tracing::info!(path = %path, "opening database");
        Store::open(path)?
    } else {
        if !config.debug {
            anyhow::bail!("AGORA_DATABASE_PATH is required when AGORA_DEBUG=false");
        }
        tracing::warn!("AGORA_DATABASE_PATH not set; using in-memory database (debug only)");
        Store::open_in_memory()?
    };

    let registry = Arc::new(SchemaRegistry::load(&config.schema_dir)?);
    tracing::info!(
        capabilities = registry.capabilities().len(),
        schema_dir = %config.schema_dir,
        "capability schemas loaded"
    );

    Server::new(config, store, registry).serve().await?;
    Ok(())
}
