//! Daemon settings, read from `HDSTORE_*` environment variables

use anyhow::Context;
use hdstore_core::configuration::parse_duration;
use hdstore_core::StorageConfig;
use std::path::PathBuf;
use std::time::Duration;

/// Storage data directory
pub const DATA_DIR_VAR: &str = "HDSTORE_DATA_DIR";
/// Open file handle limit
pub const MAX_OPEN_FILES_VAR: &str = "HDSTORE_MAX_OPEN_FILES";
/// Relict cleanup period, e.g. `10m` or `1h 30m`
pub const CLEANUP_INTERVAL_VAR: &str = "HDSTORE_CLEANUP_INTERVAL";
/// Relict cleanup worker threads
pub const CLEANUP_WORKERS_VAR: &str = "HDSTORE_CLEANUP_WORKERS";

/// Daemon configuration
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub storage: StorageConfig,
}

impl DaemonConfig {
    /// Read the process environment
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any variable lookup; unset variables keep their defaults
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let mut storage = StorageConfig::default();

        if let Some(dir) = lookup(DATA_DIR_VAR) {
            storage.data_dir = PathBuf::from(dir);
        }
        if let Some(value) = lookup(MAX_OPEN_FILES_VAR) {
            storage.max_open_files = value
                .trim()
                .parse()
                .with_context(|| format!("{} must be a positive integer", MAX_OPEN_FILES_VAR))?;
        }
        if let Some(value) = lookup(CLEANUP_INTERVAL_VAR) {
            let millis = parse_duration(&value).with_context(|| format!("Invalid {}", CLEANUP_INTERVAL_VAR))?;
            anyhow::ensure!(millis > 0, "{} must be positive", CLEANUP_INTERVAL_VAR);
            storage.cleanup_interval = Duration::from_millis(millis as u64);
        }
        if let Some(value) = lookup(CLEANUP_WORKERS_VAR) {
            storage.cleanup_workers = value
                .trim()
                .parse()
                .with_context(|| format!("{} must be a positive integer", CLEANUP_WORKERS_VAR))?;
        }

        anyhow::ensure!(storage.max_open_files > 0, "{} must be positive", MAX_OPEN_FILES_VAR);
        anyhow::ensure!(storage.cleanup_workers > 0, "{} must be positive", CLEANUP_WORKERS_VAR);

        Ok(Self { storage })
    }
}
