//! Back-end multiplexer
//!
//! Presents the fragments of one manager as a single channel with an
//! unbounded time axis. Writes are routed to the fragment covering the sample
//! time, reads are stitched together from every overlapping fragment.

use crate::manager::BackEndManager;
use crate::{HdError, Result, Sample, SampleValue, TimeRange, Timestamp};
use tracing::debug;

/// One continuous storage channel over many fragments
pub struct BackEndMultiplexer {
    manager: BackEndManager,
}

impl BackEndMultiplexer {
    pub fn new(manager: BackEndManager) -> Self {
        Self { manager }
    }

    /// Load the fragments already on disk
    pub fn initialize(&self) -> Result<usize> {
        self.manager.initialize()
    }

    pub fn manager(&self) -> &BackEndManager {
        &self.manager
    }

    /// Store `sample` in the fragment covering its time.
    ///
    /// Returns `false` when the write was dropped because no fragment may be
    /// created for that time.
    pub fn update<T: SampleValue>(&self, sample: &Sample<T>) -> Result<bool> {
        let Some(backend) = self.manager.get_back_end(sample.time, true)? else {
            debug!(
                "Dropping sample at {} for level {} {}",
                sample.time,
                self.manager.config().level,
                self.manager.config().calculation_method
            );
            return Ok(false);
        };

        let meta = backend.metadata();
        match backend.update(&sample.at_index(meta.start_time, meta.slot_span)) {
            Ok(()) => Ok(true),
            // Lost a race against relict cleanup
            Err(HdError::FragmentDeleted(path)) => {
                debug!("Dropping sample at {}: fragment {} was deleted", sample.time, path);
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    pub fn update_long(&self, sample: &Sample<i64>) -> Result<bool> {
        self.update(sample)
    }

    pub fn update_double(&self, sample: &Sample<f64>) -> Result<bool> {
        self.update(sample)
    }

    /// Every stored sample whose time lies in `range`, ascending
    pub fn get_values<T: SampleValue>(&self, range: &TimeRange) -> Result<Vec<Sample<T>>> {
        let mut samples = Vec::new();

        for backend in self.manager.get_back_ends(range) {
            let meta = backend.metadata();
            // Clip to the fragment first; open-ended bounds would overflow
            let start = range.start.max(meta.start_time);
            let end = range.end.min(meta.end_time());
            if start >= end {
                continue;
            }
            let start_index = ceil_div(start - meta.start_time, meta.slot_span);
            let end_index = ceil_div(end - meta.start_time, meta.slot_span);

            samples.extend(
                backend
                    .get_values::<T>(start_index, end_index)?
                    .iter()
                    .map(|v| v.at_time(meta.start_time, meta.slot_span)),
            );
        }

        Ok(samples)
    }

    pub fn get_long_values(&self, range: &TimeRange) -> Result<Vec<Sample<i64>>> {
        self.get_values(range)
    }

    pub fn get_double_values(&self, range: &TimeRange) -> Result<Vec<Sample<f64>>> {
        self.get_values(range)
    }

    /// Time of the newest stored sample
    pub fn latest_time<T: SampleValue>(&self) -> Result<Option<Timestamp>> {
        for backend in self.manager.back_ends().iter().rev() {
            let meta = backend.metadata();
            let values = backend.get_values::<T>(0, meta.capacity as i64)?;
            if let Some(last) = values.last() {
                return Ok(Some(meta.start_time + last.index * meta.slot_span));
            }
        }
        Ok(None)
    }
}

fn ceil_div(a: i64, b: i64) -> i64 {
    -((-a).div_euclid(b))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::HandlePool;
    use crate::clock::ManualClock;
    use crate::manager::tests::{raw_config, HOUR};
    use crate::manager::BackEndFactory;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Barrier};
    use std::thread;
    use tempfile::TempDir;

    fn multiplexer(dir: &TempDir, now: Timestamp) -> BackEndMultiplexer {
        let pool = Arc::new(HandlePool::new(16));
        let factory = Arc::new(BackEndFactory::new(dir.path(), "flow", pool).unwrap());
        let clock = Arc::new(ManualClock::new(now));
        BackEndMultiplexer::new(BackEndManager::new(factory, raw_config(), clock))
    }

    #[test]
    fn test_ceil_div() {
        assert_eq!(ceil_div(0, 1_000), 0);
        assert_eq!(ceil_div(1, 1_000), 1);
        assert_eq!(ceil_div(1_000, 1_000), 1);
        assert_eq!(ceil_div(-1, 1_000), 0);
        assert_eq!(ceil_div(-1_001, 1_000), -1);
    }

    #[test]
    fn test_reads_span_fragments() {
        let dir = TempDir::new().unwrap();
        let mux = multiplexer(&dir, 100 * HOUR);

        let times = [98 * HOUR + 5_000, 99 * HOUR - 1_000, 99 * HOUR, 99 * HOUR + 1_500];
        for (i, t) in times.iter().enumerate() {
            assert!(mux.update_double(&Sample::new(*t, i as f64)).unwrap());
        }
        assert_eq!(mux.manager().fragment_starts(), vec![98 * HOUR, 99 * HOUR]);

        let all = mux.get_double_values(&TimeRange::new(0, 200 * HOUR)).unwrap();
        let got: Vec<(Timestamp, f64)> = all.iter().map(|s| (s.time, s.value)).collect();
        assert_eq!(
            got,
            vec![
                (98 * HOUR + 5_000, 0.0),
                (99 * HOUR - 1_000, 1.0),
                (99 * HOUR, 2.0),
                // Quantized to the slot start
                (99 * HOUR + 1_000, 3.0),
            ]
        );
    }

    #[test]
    fn test_reads_are_half_open_in_time() {
        let dir = TempDir::new().unwrap();
        let mux = multiplexer(&dir, 100 * HOUR);
        for s in 0..10 {
            assert!(mux.update_double(&Sample::new(99 * HOUR + s * 1_000, s as f64)).unwrap());
        }

        let range = TimeRange::new(99 * HOUR + 2_000, 99 * HOUR + 5_000);
        let values: Vec<f64> = mux.get_double_values(&range).unwrap().iter().map(|s| s.value).collect();
        assert_eq!(values, vec![2.0, 3.0, 4.0]);

        // A start inside a slot excludes that slot
        let range = TimeRange::new(99 * HOUR + 2_001, 99 * HOUR + 5_001);
        let values: Vec<f64> = mux.get_double_values(&range).unwrap().iter().map(|s| s.value).collect();
        assert_eq!(values, vec![3.0, 4.0, 5.0]);

        let empty = TimeRange::new(99 * HOUR + 5_000, 99 * HOUR + 5_000);
        assert!(mux.get_double_values(&empty).unwrap().is_empty());
    }

    #[test]
    fn test_unbounded_read() {
        let dir = TempDir::new().unwrap();
        let mux = multiplexer(&dir, 100 * HOUR);
        mux.update_double(&Sample::new(98 * HOUR, 1.0)).unwrap();
        mux.update_double(&Sample::new(99 * HOUR + HOUR - 1_000, 2.0)).unwrap();

        let all = mux.get_double_values(&TimeRange::new(i64::MIN, i64::MAX)).unwrap();
        let got: Vec<(Timestamp, f64)> = all.iter().map(|s| (s.time, s.value)).collect();
        assert_eq!(got, vec![(98 * HOUR, 1.0), (100 * HOUR - 1_000, 2.0)]);

        let before = mux.get_double_values(&TimeRange::new(i64::MIN, 98 * HOUR)).unwrap();
        assert!(before.is_empty());
    }

    #[test]
    fn test_write_into_deleted_fragment_is_dropped() {
        let dir = TempDir::new().unwrap();
        let mux = multiplexer(&dir, 100 * HOUR);
        assert!(mux.update_double(&Sample::new(99 * HOUR, 1.0)).unwrap());

        // Deleted but still indexed, as while relict cleanup is running
        let backend = mux.manager().get_back_end(99 * HOUR, false).unwrap().unwrap();
        backend.delete().unwrap();

        assert!(!mux.update_double(&Sample::new(99 * HOUR + 1_000, 2.0)).unwrap());
        assert!(mux.get_double_values(&TimeRange::new(99 * HOUR, 100 * HOUR)).unwrap().is_empty());
        assert_eq!(mux.latest_time::<f64>().unwrap(), None);
    }

    #[test]
    fn test_relict_cleanup_races_readers_and_writers() {
        let dir = TempDir::new().unwrap();
        let pool = Arc::new(HandlePool::new(16));
        let factory = Arc::new(BackEndFactory::new(dir.path(), "flow", pool).unwrap());
        let clock = Arc::new(ManualClock::new(100 * HOUR));
        let mux = Arc::new(BackEndMultiplexer::new(BackEndManager::new(
            factory,
            raw_config(),
            clock.clone(),
        )));

        let slots = HOUR / 1_000;
        for i in 0..slots {
            assert!(mux.update_double(&Sample::new(99 * HOUR + i * 1_000, i as f64)).unwrap());
        }

        // Far past retention; only the fragment already indexed takes writes
        clock.set(200 * HOUR);
        let range = TimeRange::new(99 * HOUR, 100 * HOUR);
        let start = Arc::new(Barrier::new(4));
        let done = Arc::new(AtomicBool::new(false));

        let readers: Vec<_> = (0..2)
            .map(|_| {
                let (mux, start, done) = (mux.clone(), start.clone(), done.clone());
                thread::spawn(move || {
                    start.wait();
                    let mut reads = 0;
                    while !done.load(Ordering::Acquire) || reads < 10 {
                        let values = mux.get_double_values(&range).unwrap();
                        // All of the fragment or none of it
                        assert!(values.is_empty() || values.len() as i64 == slots);
                        for s in &values {
                            assert_eq!(s.value, ((s.time - 99 * HOUR) / 1_000) as f64);
                            assert_eq!(s.base_value_count, 1);
                        }
                        reads += 1;
                    }
                })
            })
            .collect();

        let writer = {
            let (mux, start, done) = (mux.clone(), start.clone(), done.clone());
            thread::spawn(move || {
                start.wait();
                let mut i = 0;
                while !done.load(Ordering::Acquire) {
                    let slot = i % slots;
                    mux.update_double(&Sample::new(99 * HOUR + slot * 1_000, slot as f64))
                        .unwrap();
                    i += 1;
                }
            })
        };

        start.wait();
        let report = mux.manager().cleanup_relicts(200 * HOUR);
        done.store(true, Ordering::Release);

        for reader in readers {
            reader.join().unwrap();
        }
        writer.join().unwrap();

        assert_eq!(report.deleted, 1);
        assert!(mux.manager().fragment_starts().is_empty());
        assert!(!mux.update_double(&Sample::new(99 * HOUR, 0.0)).unwrap());
        assert!(mux.get_double_values(&range).unwrap().is_empty());
    }

    #[test]
    fn test_future_write_is_dropped() {
        let dir = TempDir::new().unwrap();
        let mux = multiplexer(&dir, 100 * HOUR);

        assert!(!mux.update_double(&Sample::new(101 * HOUR, 1.0)).unwrap());
        assert!(mux.manager().fragment_starts().is_empty());
    }

    #[test]
    fn test_latest_time() {
        let dir = TempDir::new().unwrap();
        let mux = multiplexer(&dir, 100 * HOUR);
        assert_eq!(mux.latest_time::<f64>().unwrap(), None);

        mux.update_double(&Sample::new(98 * HOUR + 7_000, 1.0)).unwrap();
        mux.update_double(&Sample::new(98 * HOUR + 3_000, 1.0)).unwrap();
        assert_eq!(mux.latest_time::<f64>().unwrap(), Some(98 * HOUR + 7_000));

        // An empty newer fragment does not hide older data
        mux.manager().get_back_end(99 * HOUR, true).unwrap().unwrap();
        assert_eq!(mux.latest_time::<f64>().unwrap(), Some(98 * HOUR + 7_000));
    }
}
