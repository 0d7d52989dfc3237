//! Historical storage - owns every channel below one data directory

mod engine;

pub use engine::HistoricalStorage;

use crate::cleanup::CleanerConfig;
use std::path::PathBuf;
use std::time::Duration;

/// Storage root configuration
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Data directory; each channel lives in a sub-directory named after it
    pub data_dir: PathBuf,
    /// Upper bound of simultaneously open fragment files
    pub max_open_files: usize,
    /// Time between two relict cleanup cycles
    pub cleanup_interval: Duration,
    /// Relict cleanup worker threads
    pub cleanup_workers: usize,
    /// Maximum queued cleanup jobs
    pub queue_capacity: usize,
}

impl StorageConfig {
    /// Settings of the relict cleaner
    pub fn cleaner_config(&self) -> CleanerConfig {
        CleanerConfig {
            interval: self.cleanup_interval,
            workers: self.cleanup_workers,
            queue_capacity: self.queue_capacity,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(crate::config::DEFAULT_DATA_DIR),
            max_open_files: crate::config::MAX_OPEN_FILES,
            cleanup_interval: crate::config::CLEANUP_INTERVAL,
            cleanup_workers: crate::config::CLEANUP_WORKERS,
            queue_capacity: crate::config::CLEANUP_QUEUE_CAPACITY,
        }
    }
}
