//! Historical storage - top-level coordinator

use super::StorageConfig;
use crate::backend::{HandlePool, MAX_CONFIGURATION_ID_LEN};
use crate::channel::CalculatingStorageChannel;
use crate::cleanup::{CleanupReport, RelictCleaner, RelictSource};
use crate::clock::{Clock, SystemClock};
use crate::configuration::{ChannelConfiguration, JsonPropertiesFile, Properties, PropertiesSource};
use crate::{config, HdError, Result};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

/// hdstore storage root
pub struct HistoricalStorage {
    config: StorageConfig,
    handles: Arc<HandlePool>,
    clock: Arc<dyn Clock>,
    channels: RwLock<HashMap<String, Arc<CalculatingStorageChannel>>>,
    cleaner: Mutex<Option<RelictCleaner>>,
    disposed: AtomicBool,
}

impl HistoricalStorage {
    /// Open the storage root, reloading every persisted channel
    pub fn open(config: StorageConfig) -> Result<Self> {
        Self::open_with_clock(config, Arc::new(SystemClock))
    }

    /// Open with an explicit clock
    pub fn open_with_clock(config: StorageConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        std::fs::create_dir_all(&config.data_dir)?;

        let storage = Self {
            handles: Arc::new(HandlePool::new(config.max_open_files)),
            config,
            clock,
            channels: RwLock::new(HashMap::new()),
            cleaner: Mutex::new(None),
            disposed: AtomicBool::new(false),
        };

        storage.load_channels()?;

        Ok(storage)
    }

    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    /// Create a channel from its configuration properties and persist them
    pub fn create_channel(
        &self,
        configuration_id: &str,
        properties: &Properties,
    ) -> Result<Arc<CalculatingStorageChannel>> {
        self.ensure_open()?;
        validate_configuration_id(configuration_id)?;
        let configuration = ChannelConfiguration::from_properties(properties)?;

        let mut channels = self.channels.write();
        if channels.contains_key(configuration_id) {
            return Err(HdError::ChannelExists(configuration_id.to_string()));
        }

        let dir = self.channel_dir(configuration_id);
        let channel = Arc::new(with_new_dir(&dir, || {
            JsonPropertiesFile::new(dir.join(config::SETTINGS_FILE)).store(&configuration.to_properties())?;
            CalculatingStorageChannel::open(
                configuration_id,
                &dir,
                configuration,
                self.handles.clone(),
                self.clock.clone(),
            )
        })?);
        channels.insert(configuration_id.to_string(), channel.clone());
        drop(channels);
        self.register_with_cleaner(&channel);

        info!("Created channel: {}", configuration_id);

        Ok(channel)
    }

    /// Get a channel by configuration id
    pub fn get_channel(&self, configuration_id: &str) -> Result<Arc<CalculatingStorageChannel>> {
        self.ensure_open()?;
        self.channels
            .read()
            .get(configuration_id)
            .cloned()
            .ok_or_else(|| HdError::ChannelNotFound(configuration_id.to_string()))
    }

    /// Delete a channel with all its data and settings
    pub fn delete_channel(&self, configuration_id: &str) -> Result<()> {
        self.ensure_open()?;
        let channel = self
            .channels
            .write()
            .remove(configuration_id)
            .ok_or_else(|| HdError::ChannelNotFound(configuration_id.to_string()))?;

        channel.delete()?;

        let dir = self.channel_dir(configuration_id);
        if dir.exists() {
            std::fs::remove_dir_all(&dir)?;
        }

        info!("Deleted channel: {}", configuration_id);

        Ok(())
    }

    /// Configuration ids of every channel, sorted
    pub fn list_channels(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.channels.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Run relict cleanup on every channel now.
    ///
    /// A channel whose cleanup fails is logged and skipped.
    pub fn cleanup_relicts(&self) -> Result<CleanupReport> {
        self.ensure_open()?;

        let channels: Vec<_> = self.channels.read().values().cloned().collect();
        let mut report = CleanupReport::default();
        for channel in channels {
            match channel.cleanup_relicts() {
                Ok(r) => report.merge(r),
                Err(e) => warn!("Cleanup of {} failed: {}", channel.configuration_id(), e),
            }
        }
        Ok(report)
    }

    /// Start periodic relict cleanup for every current and future channel
    pub fn start_cleaner(&self) -> Result<()> {
        self.ensure_open()?;

        let mut cleaner = self.cleaner.lock();
        if cleaner.is_some() {
            return Ok(());
        }

        let started = RelictCleaner::start(self.config.cleaner_config())?;
        for channel in self.channels.read().values() {
            let source: Arc<dyn RelictSource> = channel.clone();
            started.register(&source);
        }
        *cleaner = Some(started);
        Ok(())
    }

    /// Queue an immediate cleanup cycle; returns the number of jobs queued
    pub fn trigger_cleanup(&self) -> usize {
        self.cleaner.lock().as_ref().map_or(0, |c| c.trigger())
    }

    /// Stop the cleaner, then flush and close every channel
    pub fn dispose(&self) -> Result<()> {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        if let Some(cleaner) = self.cleaner.lock().take() {
            cleaner.shutdown();
        }

        let mut first_error = None;
        for channel in self.channels.read().values() {
            if let Err(e) = channel.dispose() {
                first_error.get_or_insert(e);
            }
        }
        self.handles.release_all();

        info!("Storage at {:?} disposed", self.config.data_dir);

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn channel_dir(&self, configuration_id: &str) -> PathBuf {
        self.config.data_dir.join(configuration_id)
    }

    fn register_with_cleaner(&self, channel: &Arc<CalculatingStorageChannel>) {
        if let Some(cleaner) = self.cleaner.lock().as_ref() {
            let source: Arc<dyn RelictSource> = channel.clone();
            cleaner.register(&source);
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(HdError::Disposed(format!("{:?}", self.config.data_dir)));
        }
        Ok(())
    }

    fn load_channels(&self) -> Result<()> {
        for entry in std::fs::read_dir(&self.config.data_dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }

            let name = entry.file_name().to_string_lossy().to_string();
            if validate_configuration_id(&name).is_err() {
                continue;
            }

            let settings = JsonPropertiesFile::new(entry.path().join(config::SETTINGS_FILE));
            if !settings.exists() {
                continue;
            }

            match self.load_channel(&name, &settings) {
                Ok(channel) => {
                    self.channels.write().insert(name.clone(), Arc::new(channel));
                    info!("Loaded channel: {}", name);
                }
                Err(e) => {
                    warn!("Failed to load channel {}: {}", name, e);
                }
            }
        }

        Ok(())
    }

    fn load_channel(&self, name: &str, settings: &JsonPropertiesFile) -> Result<CalculatingStorageChannel> {
        let configuration = ChannelConfiguration::from_properties(&settings.load()?)?;
        CalculatingStorageChannel::open(
            name,
            self.channel_dir(name),
            configuration,
            self.handles.clone(),
            self.clock.clone(),
        )
    }
}

impl Drop for HistoricalStorage {
    fn drop(&mut self) {
        if let Err(e) = self.dispose() {
            warn!("Error while disposing storage: {}", e);
        }
    }
}

/// Run `f` with `dir` created; a directory created here is removed again if `f` fails
fn with_new_dir<T>(dir: &Path, f: impl FnOnce() -> Result<T>) -> Result<T> {
    let created = !dir.exists();
    std::fs::create_dir_all(dir)?;

    let result = f();
    if result.is_err() && created {
        if let Err(e) = std::fs::remove_dir_all(dir) {
            warn!("Failed to remove {:?} after failed channel creation: {}", dir, e);
        }
    }
    result
}

/// Configuration ids name directories and fragment files: `[A-Za-z0-9_-]{1,88}`
fn validate_configuration_id(id: &str) -> Result<()> {
    if id.is_empty() || id.len() > MAX_CONFIGURATION_ID_LEN {
        return Err(HdError::Config(format!(
            "Configuration id must be 1 to {} bytes long: {:?}",
            MAX_CONFIGURATION_ID_LEN, id
        )));
    }
    if !id.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-') {
        return Err(HdError::Config(format!(
            "Configuration id may only contain letters, digits, '_' and '-': {:?}",
            id
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::configuration::tests::sample_properties;
    use crate::{CalculationMethod, Sample};
    use tempfile::TempDir;

    const HOUR: i64 = 3_600_000;
    const DAY: i64 = 24 * HOUR;
    const T0: i64 = 1_000 * DAY;

    fn open(dir: &TempDir, clock: Arc<ManualClock>) -> HistoricalStorage {
        let config = StorageConfig {
            data_dir: dir.path().to_path_buf(),
            max_open_files: 8,
            ..Default::default()
        };
        HistoricalStorage::open_with_clock(config, clock).unwrap()
    }

    #[test]
    fn test_validate_configuration_id() {
        assert!(validate_configuration_id("pump-1_flow").is_ok());
        assert!(validate_configuration_id(&"a".repeat(MAX_CONFIGURATION_ID_LEN)).is_ok());
        for bad in ["", "a.b", "../x", "with space", "ü"] {
            assert!(validate_configuration_id(bad).is_err(), "accepted {:?}", bad);
        }
        assert!(validate_configuration_id(&"a".repeat(MAX_CONFIGURATION_ID_LEN + 1)).is_err());
    }

    #[test]
    fn test_reopen_reloads_channels() {
        let dir = TempDir::new().unwrap();
        let clock = Arc::new(ManualClock::new(T0 + HOUR));

        {
            let storage = open(&dir, clock.clone());
            let channel = storage.create_channel("flow", &sample_properties()).unwrap();
            for s in 0..5 {
                channel.update_double(&Sample::new(T0 + s * 1_000, s as f64)).unwrap();
            }
            storage.dispose().unwrap();
        }

        let storage = open(&dir, clock);
        assert_eq!(storage.list_channels(), vec!["flow".to_string()]);

        let channel = storage.get_channel("flow").unwrap();
        let raw = channel
            .get_double_values(0, CalculationMethod::Native, T0, T0 + HOUR)
            .unwrap();
        let got: Vec<f64> = raw.iter().map(|s| s.value).collect();
        assert_eq!(got, vec![0.0, 1.0, 2.0, 3.0, 4.0]);
        assert_eq!(channel.configuration().maximum_compression_level(), 2);
    }

    #[test]
    fn test_create_errors() {
        let dir = TempDir::new().unwrap();
        let storage = open(&dir, Arc::new(ManualClock::new(T0)));

        storage.create_channel("flow", &sample_properties()).unwrap();
        assert!(matches!(
            storage.create_channel("flow", &sample_properties()),
            Err(HdError::ChannelExists(_))
        ));
        assert!(matches!(
            storage.create_channel("bad.id", &sample_properties()),
            Err(HdError::Config(_))
        ));

        let mut props = sample_properties();
        props.remove("compression_timespan_level_1");
        assert!(matches!(storage.create_channel("broken", &props), Err(HdError::Config(_))));
        assert!(!dir.path().join("broken").exists());

        assert!(matches!(storage.get_channel("missing"), Err(HdError::ChannelNotFound(_))));
    }

    #[test]
    fn test_failed_creation_leaves_no_directory() {
        let dir = TempDir::new().unwrap();
        let channel_dir = dir.path().join("flow");

        let result: Result<()> = with_new_dir(&channel_dir, || {
            std::fs::write(channel_dir.join(config::SETTINGS_FILE), "{}")?;
            Err(HdError::Config("cannot open".into()))
        });
        assert!(result.is_err());
        assert!(!channel_dir.exists());

        // A directory that was already there is left alone
        std::fs::create_dir_all(&channel_dir).unwrap();
        let result: Result<()> = with_new_dir(&channel_dir, || Err(HdError::Config("cannot open".into())));
        assert!(result.is_err());
        assert!(channel_dir.exists());

        assert_eq!(with_new_dir(&dir.path().join("level"), || Ok(7)).unwrap(), 7);
        assert!(dir.path().join("level").is_dir());
    }

    #[test]
    fn test_unloadable_channel_is_skipped() {
        let dir = TempDir::new().unwrap();
        let clock = Arc::new(ManualClock::new(T0));
        {
            let storage = open(&dir, clock.clone());
            storage.create_channel("good", &sample_properties()).unwrap();
            storage.create_channel("bad", &sample_properties()).unwrap();
        }
        std::fs::write(dir.path().join("bad").join(config::SETTINGS_FILE), "{").unwrap();

        let storage = open(&dir, clock);
        assert_eq!(storage.list_channels(), vec!["good".to_string()]);
    }

    #[test]
    fn test_delete_channel() {
        let dir = TempDir::new().unwrap();
        let storage = open(&dir, Arc::new(ManualClock::new(T0 + HOUR)));

        let channel = storage.create_channel("flow", &sample_properties()).unwrap();
        channel.update_double(&Sample::new(T0, 1.0)).unwrap();
        storage.create_channel("level", &sample_properties()).unwrap();

        storage.delete_channel("flow").unwrap();
        assert_eq!(storage.list_channels(), vec!["level".to_string()]);
        assert!(!dir.path().join("flow").exists());
        assert!(channel.update_double(&Sample::new(T0, 1.0)).is_err());
        assert!(matches!(storage.delete_channel("flow"), Err(HdError::ChannelNotFound(_))));
    }

    #[test]
    fn test_cleanup_across_channels() {
        let dir = TempDir::new().unwrap();
        let clock = Arc::new(ManualClock::new(T0 + HOUR));
        let storage = open(&dir, clock.clone());

        for id in ["a", "b"] {
            let channel = storage.create_channel(id, &sample_properties()).unwrap();
            channel.update_double(&Sample::new(T0, 1.0)).unwrap();
        }

        assert_eq!(storage.cleanup_relicts().unwrap().deleted, 0);
        clock.set(T0 + 2 * DAY);
        assert_eq!(storage.cleanup_relicts().unwrap(), CleanupReport { deleted: 2, failed: 0 });
    }

    #[test]
    fn test_cleaner_covers_new_channels() {
        let dir = TempDir::new().unwrap();
        let storage = open(&dir, Arc::new(ManualClock::new(T0)));
        assert_eq!(storage.trigger_cleanup(), 0);

        storage.create_channel("a", &sample_properties()).unwrap();
        storage.start_cleaner().unwrap();
        storage.create_channel("b", &sample_properties()).unwrap();

        assert_eq!(storage.trigger_cleanup(), 2);
        storage.dispose().unwrap();
    }

    #[test]
    fn test_disposed_storage_rejects_calls() {
        let dir = TempDir::new().unwrap();
        let storage = open(&dir, Arc::new(ManualClock::new(T0)));
        let channel = storage.create_channel("flow", &sample_properties()).unwrap();

        storage.dispose().unwrap();
        storage.dispose().unwrap();

        assert!(matches!(storage.get_channel("flow"), Err(HdError::Disposed(_))));
        assert!(matches!(
            channel.update_double(&Sample::new(T0, 1.0)),
            Err(HdError::Disposed(_))
        ));
    }
}
