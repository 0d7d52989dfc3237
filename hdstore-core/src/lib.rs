//! hdstore Core - Historical Data Storage Engine
//!
//! Stores quality-tagged long or double samples of process monitoring
//! channels and keeps pre-aggregated copies at coarser resolutions, so long
//! retention periods stay queryable without scanning raw data.
//!
//! # Architecture
//!
//! - **Back end**: one fixed-capacity, file-backed array of value slots (a fragment)
//! - **Manager**: shards a channel level into time-aligned fragments
//! - **Multiplexer**: one unbounded time axis over the fragments of a level
//! - **Channel**: raw level plus cascading AVG / MIN / MAX levels
//! - **Cleaner**: periodic deletion of fragments past their retention age

pub mod backend;
pub mod channel;
pub mod cleanup;
pub mod clock;
pub mod configuration;
pub mod manager;
pub mod multiplexer;
pub mod storage;

mod calculation;
mod error;
mod types;

pub use channel::{CalculatingStorageChannel, ValueVisitor};
pub use cleanup::{CleanupReport, RelictCleaner};
pub use error::{HdError, Result};
pub use storage::{HistoricalStorage, StorageConfig};
pub use types::*;

/// hdstore version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default configuration values
pub mod config {
    use std::time::Duration;

    /// Default data directory
    pub const DEFAULT_DATA_DIR: &str = "data";

    /// Channel settings file inside each channel directory
    pub const SETTINGS_FILE: &str = "settings.json";

    /// Maximum simultaneously open fragment files
    pub const MAX_OPEN_FILES: usize = 256;

    /// Relict cleanup period (10 minutes)
    pub const CLEANUP_INTERVAL: Duration = Duration::from_secs(10 * 60);

    /// Relict cleanup worker threads
    pub const CLEANUP_WORKERS: usize = 2;

    /// Maximum queued cleanup jobs
    pub const CLEANUP_QUEUE_CAPACITY: usize = 1024;
}
