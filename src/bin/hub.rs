//! Audio Hub Server
//!
//! Streams a shared audio feed to connected clients and serves the JSON-RPC
//! control channel.

use anyhow::Result;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use lan_audio_hub::{
    config::HubConfig,
    hub::StreamHub,
    store::ClientStore,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting LAN Audio Hub v{}", env!("CARGO_PKG_VERSION"));

    // Optional config file path from args
    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = HubConfig::load_or_default(config_path.as_deref())?;

    tracing::info!(
        "Stream port {}, control port {}, buffer {}ms, format {}, source {}",
        config.stream_port,
        config.control_port,
        config.buffer_ms,
        config.sample_format,
        config.source_path.display(),
    );

    // Client registry, persisted across restarts
    let store = match &config.store_path {
        Some(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            Arc::new(ClientStore::load(path.clone())?)
        }
        None => Arc::new(ClientStore::new()),
    };

    let hub = StreamHub::new(config, store)?;
    hub.start().await?;

    tracing::info!("Hub running - press Ctrl+C to stop");
    tokio::signal::ctrl_c().await?;

    tracing::info!("Shutting down");
    hub.stop().await;
    Ok(())
}
