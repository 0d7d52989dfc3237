//! Calculating storage channel
//!
//! A channel stores raw samples at level 0 and derives increasingly
//! compressed levels from them:
//!
//! ```text
//!              ┌─> AVG 1 ─> AVG 2 ─> ...
//!   NATIVE 0 ──┼─> MIN 1 ─> MIN 2 ─> ...
//!              └─> MAX 1 ─> MAX 2 ─> ...
//! ```
//!
//! Whenever a write completes (or corrects) an aggregation window of the level
//! above, the window is recomputed from the stored values and written one
//! level up, which may cascade further.

mod node;

use crate::backend::HandlePool;
use crate::cleanup::{CleanupReport, RelictSource};
use crate::clock::Clock;
use crate::configuration::ChannelConfiguration;
use crate::manager::{BackEndFactory, BackEndManager, ManagerConfig};
use crate::multiplexer::BackEndMultiplexer;
use crate::{
    CalculationMethod, DataType, HdError, Result, Sample, SampleValue, TimeRange, Timestamp,
};
use node::LevelNode;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Receives samples during [`CalculatingStorageChannel::visit`]
pub trait ValueVisitor<T> {
    /// Handle one sample; return `false` to stop the visit
    fn visit(&mut self, sample: &Sample<T>) -> bool;
}

impl<T, F> ValueVisitor<T> for F
where
    F: FnMut(&Sample<T>) -> bool,
{
    fn visit(&mut self, sample: &Sample<T>) -> bool {
        self(sample)
    }
}

/// A raw channel plus every derived compression level
pub struct CalculatingStorageChannel {
    configuration_id: String,
    config: ChannelConfiguration,
    clock: Arc<dyn Clock>,
    raw: Arc<LevelNode>,
    nodes: HashMap<(CalculationMethod, u32), Arc<LevelNode>>,
    /// Newest accepted raw sample time
    high_water: Mutex<Option<Timestamp>>,
    disposed: AtomicBool,
    dir: PathBuf,
}

impl CalculatingStorageChannel {
    /// Open the channel stored in `dir`, loading every existing fragment
    pub fn open(
        configuration_id: &str,
        dir: impl Into<PathBuf>,
        config: ChannelConfiguration,
        handles: Arc<HandlePool>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let dir = dir.into();
        let factory = Arc::new(BackEndFactory::new(&dir, configuration_id, handles)?);
        let mut nodes = HashMap::new();
        let raw_span = config.level(0).compression_timespan;

        let node = |method: CalculationMethod, level: u32, children: Vec<Arc<LevelNode>>| {
            let manager_config = manager_config(&config, method, level);
            let slot_span = manager_config.slot_span;
            let manager = BackEndManager::new(factory.clone(), manager_config, clock.clone());
            Arc::new(LevelNode::new(
                method,
                level,
                slot_span,
                raw_span,
                BackEndMultiplexer::new(manager),
                children,
            ))
        };

        let mut first_levels = Vec::new();
        for &method in config.calculation_methods() {
            let mut child: Option<Arc<LevelNode>> = None;
            for level in (1..=config.maximum_compression_level()).rev() {
                let current = node(method, level, child.take().into_iter().collect());
                nodes.insert((method, level), current.clone());
                child = Some(current);
            }
            first_levels.extend(child);
        }
        let raw = node(CalculationMethod::Native, 0, first_levels);
        nodes.insert((CalculationMethod::Native, 0), raw.clone());

        let mut fragments = 0;
        for node in nodes.values() {
            fragments += match config.data_type() {
                DataType::Long => node.initialize::<i64>()?,
                DataType::Double => node.initialize::<f64>()?,
            };
        }
        let high_water = match config.data_type() {
            DataType::Long => raw.latest_time::<i64>()?,
            DataType::Double => raw.latest_time::<f64>()?,
        };

        info!(
            "Opened channel {} ({}, {} levels, {} fragments)",
            configuration_id,
            config.data_type(),
            config.maximum_compression_level() + 1,
            fragments
        );

        Ok(Self {
            configuration_id: configuration_id.to_string(),
            config,
            clock,
            raw,
            nodes,
            high_water: Mutex::new(high_water),
            disposed: AtomicBool::new(false),
            dir,
        })
    }

    pub fn configuration_id(&self) -> &str {
        &self.configuration_id
    }

    pub fn configuration(&self) -> &ChannelConfiguration {
        &self.config
    }

    /// Channel directory
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Newest accepted raw sample time
    pub fn high_water(&self) -> Option<Timestamp> {
        *self.high_water.lock()
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Write a raw sample.
    ///
    /// Returns `false` when the sample lies outside the accepted time delta
    /// around the clock and the newest accepted sample.
    pub fn update_value<T: SampleValue>(&self, sample: &Sample<T>) -> Result<bool> {
        self.ensure_open()?;
        self.check_type(T::DATA_TYPE)?;

        let mut high_water = self.high_water.lock();
        if !self.accepts(sample.time, *high_water) {
            debug!(
                "Rejecting sample at {} for {}: outside accepted time delta",
                sample.time, self.configuration_id
            );
            return Ok(false);
        }

        let stored = self.raw.write(sample)?;
        if stored {
            *high_water = Some(high_water.map_or(sample.time, |hw| hw.max(sample.time)));
        }
        Ok(stored)
    }

    pub fn update_long(&self, sample: &Sample<i64>) -> Result<bool> {
        self.update_value(sample)
    }

    pub fn update_double(&self, sample: &Sample<f64>) -> Result<bool> {
        self.update_value(sample)
    }

    /// Write a batch of raw samples in ascending time order; returns how many were accepted
    pub fn insert_values<T: SampleValue>(&self, samples: &[Sample<T>]) -> Result<usize> {
        let mut ordered = samples.to_vec();
        ordered.sort_by_key(|s| s.time);

        let mut accepted = 0;
        for sample in &ordered {
            if self.update_value(sample)? {
                accepted += 1;
            }
        }
        Ok(accepted)
    }

    /// Samples of one level and method in `[start, end)`.
    ///
    /// Level 0 is the raw level and only answers to `NATIVE`; an unknown
    /// combination yields no data.
    pub fn get_values<T: SampleValue>(
        &self,
        level: u32,
        method: CalculationMethod,
        start: Timestamp,
        end: Timestamp,
    ) -> Result<Vec<Sample<T>>> {
        self.ensure_open()?;
        self.check_type(T::DATA_TYPE)?;

        match self.nodes.get(&(method, level)) {
            Some(node) => node.multiplexer.get_values(&TimeRange::new(start, end)),
            None => {
                debug!(
                    "Channel {} has no level {} {}",
                    self.configuration_id, level, method
                );
                Ok(Vec::new())
            }
        }
    }

    pub fn get_long_values(
        &self,
        level: u32,
        method: CalculationMethod,
        start: Timestamp,
        end: Timestamp,
    ) -> Result<Vec<Sample<i64>>> {
        self.get_values(level, method, start, end)
    }

    pub fn get_double_values(
        &self,
        level: u32,
        method: CalculationMethod,
        start: Timestamp,
        end: Timestamp,
    ) -> Result<Vec<Sample<f64>>> {
        self.get_values(level, method, start, end)
    }

    /// Feed the samples of one level and method in `[start, end)` to `visitor`
    /// until it declines; returns the number of samples visited
    pub fn visit<T: SampleValue, V: ValueVisitor<T>>(
        &self,
        level: u32,
        method: CalculationMethod,
        start: Timestamp,
        end: Timestamp,
        mut visitor: V,
    ) -> Result<usize> {
        let mut visited = 0;
        for sample in self.get_values::<T>(level, method, start, end)? {
            visited += 1;
            if !visitor.visit(&sample) {
                break;
            }
        }
        Ok(visited)
    }

    /// Delete the fragments of every level that are past their retention age
    pub fn cleanup_relicts(&self) -> Result<CleanupReport> {
        self.ensure_open()?;

        let now = self.clock.now();
        let mut report = CleanupReport::default();
        for node in self.nodes.values() {
            report.merge(node.multiplexer.manager().cleanup_relicts(now));
        }
        Ok(report)
    }

    /// Delete every fragment of every level; the channel is unusable afterwards
    pub fn delete(&self) -> Result<()> {
        self.disposed.store(true, Ordering::Release);

        let mut first_error = None;
        for node in self.nodes.values() {
            if let Err(e) = node.multiplexer.manager().delete() {
                first_error.get_or_insert(e);
            }
        }
        info!("Deleted channel {}", self.configuration_id);

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Flush and close every fragment; later operations fail with `Disposed`
    pub fn dispose(&self) -> Result<()> {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let mut first_error = None;
        for node in self.nodes.values() {
            if let Err(e) = node.multiplexer.manager().deinitialize() {
                warn!(
                    "Failed to close level {} {} of {}: {}",
                    node.level, node.method, self.configuration_id, e
                );
                first_error.get_or_insert(e);
            }
        }
        debug!("Disposed channel {}", self.configuration_id);

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn accepts(&self, time: Timestamp, high_water: Option<Timestamp>) -> bool {
        let delta = self.config.accepted_time_delta();
        if time > self.clock.now().saturating_add(delta) {
            return false;
        }
        match high_water {
            Some(hw) => time >= hw.saturating_sub(delta),
            None => true,
        }
    }

    fn check_type(&self, actual: DataType) -> Result<()> {
        if actual != self.config.data_type() {
            return Err(HdError::DataTypeMismatch {
                expected: self.config.data_type(),
                actual,
            });
        }
        Ok(())
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_disposed() {
            return Err(HdError::Disposed(self.configuration_id.clone()));
        }
        Ok(())
    }
}

impl RelictSource for CalculatingStorageChannel {
    fn name(&self) -> &str {
        &self.configuration_id
    }

    fn cleanup_relicts(&self) -> Result<CleanupReport> {
        CalculatingStorageChannel::cleanup_relicts(self)
    }
}

impl std::fmt::Debug for CalculatingStorageChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CalculatingStorageChannel")
            .field("configuration_id", &self.configuration_id)
            .field("data_type", &self.config.data_type())
            .field("dir", &self.dir)
            .finish()
    }
}

fn manager_config(config: &ChannelConfiguration, method: CalculationMethod, level: u32) -> ManagerConfig {
    let settings = config.level(level);
    // Aggregates of a late raw write land up to one slot per lower level earlier
    let carried: i64 = config.levels()[1..level.max(1) as usize]
        .iter()
        .map(|l| l.compression_timespan)
        .sum();

    ManagerConfig {
        data_type: config.data_type(),
        calculation_method: method,
        level,
        slot_span: settings.compression_timespan,
        fragment_span: settings.fragment_timespan,
        proposed_data_age: settings.proposed_data_age,
        accepted_time_delta: config.accepted_time_delta() + carried,
    }
}
