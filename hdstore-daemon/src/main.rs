//! hdstore daemon - hosts a storage root and its relict cleaner

mod settings;

use hdstore_core::HistoricalStorage;
use settings::DaemonConfig;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .with_thread_ids(false)
        .init();

    let config = DaemonConfig::from_env()?;

    info!("Starting hdstore {}...", hdstore_core::VERSION);
    info!("Data directory: {:?}", config.storage.data_dir);
    info!("Cleanup interval: {:?}", config.storage.cleanup_interval);

    // Blocking file I/O; keep it off the async executor
    let storage_config = config.storage.clone();
    let storage = tokio::task::spawn_blocking(move || HistoricalStorage::open(storage_config)).await??;
    storage.start_cleaner()?;

    for id in storage.list_channels() {
        info!("Channel available: {}", id);
    }

    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");

    tokio::task::spawn_blocking(move || storage.dispose()).await??;

    Ok(())
}
