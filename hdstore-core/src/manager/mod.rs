//! Fragment manager
//!
//! Shards the unbounded time axis of one channel level into fragments whose
//! start times are multiples of the fragment span counted from the Unix epoch.
//! Boundaries therefore depend only on the configuration, and a restarted
//! process rebuilds exactly the same index from the directory listing.

mod factory;

pub use factory::{BackEndFactory, FragmentName, FRAGMENT_EXTENSION};

use crate::backend::{FileBackEnd, StorageChannelMetaData};
use crate::cleanup::CleanupReport;
use crate::clock::Clock;
use crate::{align_down, CalculationMethod, DataType, Result, TimeRange, Timestamp};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Fragment geometry and acceptance rules of one channel level
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagerConfig {
    pub data_type: DataType,
    pub calculation_method: CalculationMethod,
    pub level: u32,
    /// Time represented by one slot
    pub slot_span: i64,
    /// Time covered by one fragment
    pub fragment_span: i64,
    /// Retention after a fragment's end
    pub proposed_data_age: i64,
    /// Tolerance for writes ahead of the clock or behind the oldest fragment
    pub accepted_time_delta: i64,
}

impl ManagerConfig {
    /// Slots per fragment
    pub fn capacity(&self) -> u32 {
        (self.fragment_span / self.slot_span) as u32
    }
}

/// Owns the fragments of one (level, method) pair
pub struct BackEndManager {
    factory: Arc<BackEndFactory>,
    config: ManagerConfig,
    clock: Arc<dyn Clock>,
    fragments: RwLock<BTreeMap<Timestamp, Arc<FileBackEnd>>>,
}

impl BackEndManager {
    /// Create a manager; call [`initialize`](Self::initialize) to load existing fragments
    pub fn new(factory: Arc<BackEndFactory>, config: ManagerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            factory,
            config,
            clock,
            fragments: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    /// Rebuild the fragment index from the channel directory.
    ///
    /// Fragments that cannot be opened, or whose geometry no longer matches
    /// the configuration, are logged and left out; the rest stay usable.
    pub fn initialize(&self) -> Result<usize> {
        let discovered = self
            .factory
            .list(self.config.level, self.config.calculation_method)?;

        let mut index = BTreeMap::new();
        for (path, name) in discovered {
            let backend = match self.factory.open(&path, &name) {
                Ok(backend) => backend,
                Err(e) => {
                    warn!("Skipping unusable fragment {:?}: {}", path, e);
                    continue;
                }
            };

            let meta = backend.metadata();
            if meta.data_type != self.config.data_type
                || meta.slot_span != self.config.slot_span
                || meta.capacity != self.config.capacity()
                || meta.start_time != align_down(meta.start_time, self.config.fragment_span)
            {
                warn!(
                    "Skipping fragment {:?}: layout does not match the channel configuration",
                    path
                );
                continue;
            }

            index.insert(meta.start_time, Arc::new(backend));
        }

        let count = index.len();
        *self.fragments.write() = index;

        debug!(
            "Loaded {} fragments for {} level {} {}",
            count,
            self.factory.configuration_id(),
            self.config.level,
            self.config.calculation_method
        );
        Ok(count)
    }

    /// Fragment covering `time`.
    ///
    /// With `create` set, a missing fragment is created unless the time is
    /// ahead of the clock by more than the accepted time delta, older than
    /// the earliest fragment beyond tolerance, or already past retention.
    pub fn get_back_end(&self, time: Timestamp, create: bool) -> Result<Option<Arc<FileBackEnd>>> {
        let start = align_down(time, self.config.fragment_span);

        {
            let fragments = self.fragments.read();
            if let Some(backend) = fragments.get(&start) {
                return Ok(Some(backend.clone()));
            }
        }
        if !create || !self.may_create(time, start) {
            return Ok(None);
        }

        let mut fragments = self.fragments.write();
        if let Some(backend) = fragments.get(&start) {
            return Ok(Some(backend.clone()));
        }

        let backend = Arc::new(self.factory.create(self.metadata_for(start))?);
        fragments.insert(start, backend.clone());
        Ok(Some(backend))
    }

    /// Fragments overlapping `range`, in ascending time order. Creates none.
    pub fn get_back_ends(&self, range: &TimeRange) -> Vec<Arc<FileBackEnd>> {
        if range.is_empty() {
            return Vec::new();
        }

        let first = align_down(range.start, self.config.fragment_span);
        self.fragments
            .read()
            .range(first..range.end)
            .map(|(_, backend)| backend.clone())
            .filter(|backend| backend.metadata().overlaps_time(range))
            .collect()
    }

    /// Every known fragment, in ascending time order
    pub fn back_ends(&self) -> Vec<Arc<FileBackEnd>> {
        self.fragments.read().values().cloned().collect()
    }

    /// Start times of every known fragment
    pub fn fragment_starts(&self) -> Vec<Timestamp> {
        self.fragments.read().keys().copied().collect()
    }

    /// Delete fragments whose end plus the retention age lies in the past.
    ///
    /// A failed deletion is logged and counted; the remaining candidates are
    /// still processed and the failed fragment stays indexed.
    pub fn cleanup_relicts(&self, now: Timestamp) -> CleanupReport {
        let candidates: Vec<Arc<FileBackEnd>> = self
            .fragments
            .read()
            .values()
            .filter(|b| self.is_relict(b.metadata().end_time(), now))
            .cloned()
            .collect();

        let mut report = CleanupReport::default();
        for backend in candidates {
            match backend.delete() {
                Ok(()) => {
                    self.fragments.write().remove(&backend.metadata().start_time);
                    report.deleted += 1;
                }
                Err(e) => {
                    warn!("Failed to delete relict fragment {:?}: {}", backend.path(), e);
                    report.failed += 1;
                }
            }
        }
        report
    }

    /// Delete every fragment; the first failure is returned after all were attempted
    pub fn delete(&self) -> Result<()> {
        let mut first_error = None;

        for backend in self.back_ends() {
            match backend.delete() {
                Ok(()) => {
                    self.fragments.write().remove(&backend.metadata().start_time);
                }
                Err(e) => {
                    warn!("Failed to delete fragment {:?}: {}", backend.path(), e);
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Flush and close every open fragment handle
    pub fn deinitialize(&self) -> Result<()> {
        for backend in self.back_ends() {
            backend.sync()?;
            backend.deinitialize();
        }
        Ok(())
    }

    fn metadata_for(&self, start: Timestamp) -> StorageChannelMetaData {
        StorageChannelMetaData {
            configuration_id: self.factory.configuration_id().to_string(),
            calculation_method: self.config.calculation_method,
            data_type: self.config.data_type,
            level: self.config.level,
            slot_span: self.config.slot_span,
            start_time: start,
            capacity: self.config.capacity(),
        }
    }

    fn is_relict(&self, end_time: Timestamp, now: Timestamp) -> bool {
        end_time.saturating_add(self.config.proposed_data_age) < now
    }

    fn may_create(&self, time: Timestamp, start: Timestamp) -> bool {
        let now = self.clock.now();
        let delta = self.config.accepted_time_delta;

        if time > now.saturating_add(delta) {
            debug!("Refusing fragment for {}: ahead of clock {} by more than {}ms", time, now, delta);
            return false;
        }

        if self.is_relict(start.saturating_add(self.config.fragment_span), now) {
            debug!("Refusing fragment for {}: already past retention", time);
            return false;
        }

        // A window aggregate may start up to one slot before the write that triggered it
        let tolerance = delta + self.config.slot_span;
        if let Some(&earliest) = self.fragments.read().keys().next() {
            if time < earliest.saturating_sub(tolerance) {
                debug!("Refusing fragment for {}: before earliest fragment {}", time, earliest);
                return false;
            }
        }

        info!(
            "Creating fragment {} level {} {} at {}",
            self.factory.configuration_id(),
            self.config.level,
            self.config.calculation_method,
            start
        );
        true
    }
}
