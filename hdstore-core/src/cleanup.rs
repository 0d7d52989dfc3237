//! Relict cleanup scheduling
//!
//! A ticker thread fires every `interval` and fans one job per registered
//! channel out onto a bounded queue drained by a small worker pool. Channels
//! are held weakly: a dropped channel simply stops being cleaned.

use crate::{config, Result};
use crossbeam_channel::{bounded, select, tick, Receiver, Sender, TrySendError};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Outcome of one cleanup pass
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CleanupReport {
    /// Fragments removed
    pub deleted: usize,
    /// Fragments whose removal failed
    pub failed: usize,
}

impl CleanupReport {
    pub fn merge(&mut self, other: CleanupReport) {
        self.deleted += other.deleted;
        self.failed += other.failed;
    }
}

/// Something holding expirable fragments
pub trait RelictSource: Send + Sync {
    /// Name used in log output
    fn name(&self) -> &str;

    /// Delete every fragment past its retention age
    fn cleanup_relicts(&self) -> Result<CleanupReport>;
}

/// Cleaner settings
#[derive(Debug, Clone)]
pub struct CleanerConfig {
    /// Time between two cleanup cycles
    pub interval: Duration,
    /// Number of worker threads
    pub workers: usize,
    /// Maximum queued cleanup jobs
    pub queue_capacity: usize,
}

impl Default for CleanerConfig {
    fn default() -> Self {
        Self {
            interval: config::CLEANUP_INTERVAL,
            workers: config::CLEANUP_WORKERS,
            queue_capacity: config::CLEANUP_QUEUE_CAPACITY,
        }
    }
}

/// Totals over the cleaner's lifetime
#[derive(Debug, Default)]
pub struct CleanerStats {
    cycles: AtomicU64,
    deleted: AtomicU64,
    failed: AtomicU64,
    errors: AtomicU64,
}

impl CleanerStats {
    /// Cycles started
    pub fn cycles(&self) -> u64 {
        self.cycles.load(Ordering::Relaxed)
    }

    /// Fragments deleted
    pub fn deleted(&self) -> u64 {
        self.deleted.load(Ordering::Relaxed)
    }

    /// Fragments that could not be deleted
    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    /// Channel cleanups that returned an error
    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    fn record(&self, result: &Result<CleanupReport>) {
        match result {
            Ok(report) => {
                self.deleted.fetch_add(report.deleted as u64, Ordering::Relaxed);
                self.failed.fetch_add(report.failed as u64, Ordering::Relaxed);
            }
            Err(_) => {
                self.errors.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

type Sources = Arc<Mutex<Vec<Weak<dyn RelictSource>>>>;

/// Periodic relict cleanup over a set of channels
pub struct RelictCleaner {
    sources: Sources,
    stats: Arc<CleanerStats>,
    jobs: Option<Sender<Weak<dyn RelictSource>>>,
    stop: Option<Sender<()>>,
    ticker: Option<JoinHandle<()>>,
    workers: Vec<JoinHandle<()>>,
}

impl RelictCleaner {
    /// Start the ticker and worker threads
    pub fn start(config: CleanerConfig) -> Result<Self> {
        let sources: Sources = Arc::new(Mutex::new(Vec::new()));
        let stats = Arc::new(CleanerStats::default());
        let (jobs_tx, jobs_rx) = bounded::<Weak<dyn RelictSource>>(config.queue_capacity.max(1));
        let (stop_tx, stop_rx) = bounded::<()>(0);

        let mut workers = Vec::with_capacity(config.workers.max(1));
        for idx in 0..config.workers.max(1) {
            let rx = jobs_rx.clone();
            let stats = Arc::clone(&stats);
            let handle = thread::Builder::new()
                .name(format!("hdstore-cleaner-{idx}"))
                .spawn(move || worker_loop(rx, stats))?;
            workers.push(handle);
        }

        let ticker = {
            let sources = Arc::clone(&sources);
            let stats = Arc::clone(&stats);
            let jobs = jobs_tx.clone();
            let interval = config.interval;
            thread::Builder::new()
                .name("hdstore-cleaner-tick".to_string())
                .spawn(move || {
                    let ticks = tick(interval);
                    loop {
                        select! {
                            recv(ticks) -> _ => {
                                enqueue_cycle(&sources, &jobs, &stats);
                            }
                            recv(stop_rx) -> _ => break,
                        }
                    }
                })?
        };

        info!(
            "Relict cleaner started: interval {:?}, {} workers",
            config.interval,
            workers.len()
        );

        Ok(Self {
            sources,
            stats,
            jobs: Some(jobs_tx),
            stop: Some(stop_tx),
            ticker: Some(ticker),
            workers,
        })
    }

    /// Add a channel to every future cycle
    pub fn register(&self, source: &Arc<dyn RelictSource>) {
        let mut sources = self.sources.lock();
        sources.retain(|s| s.strong_count() > 0);
        sources.push(Arc::downgrade(source));
    }

    /// Number of live registered channels
    pub fn registered(&self) -> usize {
        self.sources.lock().iter().filter(|s| s.strong_count() > 0).count()
    }

    pub fn stats(&self) -> &CleanerStats {
        &self.stats
    }

    /// Queue an immediate cycle; returns the number of jobs queued
    pub fn trigger(&self) -> usize {
        match &self.jobs {
            Some(jobs) => enqueue_cycle(&self.sources, jobs, &self.stats),
            None => 0,
        }
    }

    /// Run one cycle on the calling thread
    pub fn run_cycle(&self) -> CleanupReport {
        self.stats.cycles.fetch_add(1, Ordering::Relaxed);

        let live: Vec<Arc<dyn RelictSource>> =
            self.sources.lock().iter().filter_map(Weak::upgrade).collect();

        let mut total = CleanupReport::default();
        for source in live {
            let result = run_job(source.as_ref());
            self.stats.record(&result);
            if let Ok(report) = result {
                total.merge(report);
            }
        }
        total
    }

    /// Stop ticking, drain queued jobs and join every thread
    pub fn shutdown(mut self) {
        self.stop_threads();
    }

    fn stop_threads(&mut self) {
        drop(self.stop.take());
        if let Some(ticker) = self.ticker.take() {
            let _ = ticker.join();
        }
        // Workers exit once the queue is drained and every sender is gone
        drop(self.jobs.take());
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
        debug!("Relict cleaner stopped");
    }
}

impl Drop for RelictCleaner {
    fn drop(&mut self) {
        self.stop_threads();
    }
}

fn enqueue_cycle(sources: &Sources, jobs: &Sender<Weak<dyn RelictSource>>, stats: &CleanerStats) -> usize {
    stats.cycles.fetch_add(1, Ordering::Relaxed);

    let snapshot: Vec<Weak<dyn RelictSource>> = {
        let mut sources = sources.lock();
        sources.retain(|s| s.strong_count() > 0);
        sources.clone()
    };

    let mut queued = 0;
    for source in snapshot {
        match jobs.try_send(source) {
            Ok(()) => queued += 1,
            Err(TrySendError::Full(_)) => {
                warn!("Cleanup queue full, skipping remaining channels this cycle");
                break;
            }
            Err(TrySendError::Disconnected(_)) => break,
        }
    }
    queued
}

fn worker_loop(rx: Receiver<Weak<dyn RelictSource>>, stats: Arc<CleanerStats>) {
    while let Ok(job) = rx.recv() {
        let Some(source) = job.upgrade() else {
            continue;
        };
        let result = run_job(source.as_ref());
        stats.record(&result);
    }
}

fn run_job(source: &dyn RelictSource) -> Result<CleanupReport> {
    let result = source.cleanup_relicts();
    match &result {
        Ok(report) if report.deleted > 0 || report.failed > 0 => {
            info!(
                "Cleanup of {}: {} fragments deleted, {} failed",
                source.name(),
                report.deleted,
                report.failed
            );
        }
        Ok(_) => {}
        Err(e) => warn!("Cleanup of {} failed: {}", source.name(), e),
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::HdError;
    use std::sync::atomic::AtomicUsize;

    struct FakeSource {
        name: String,
        calls: AtomicUsize,
        fail: bool,
    }

    impl FakeSource {
        fn new(name: &str, fail: bool) -> Arc<dyn RelictSource> {
            Arc::new(Self {
                name: name.to_string(),
                calls: AtomicUsize::new(0),
                fail,
            })
        }
    }

    impl RelictSource for FakeSource {
        fn name(&self) -> &str {
            &self.name
        }

        fn cleanup_relicts(&self) -> Result<CleanupReport> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(HdError::Io(std::io::Error::new(std::io::ErrorKind::Other, "disk gone")));
            }
            Ok(CleanupReport { deleted: 2, failed: 1 })
        }
    }

    fn idle_config() -> CleanerConfig {
        CleanerConfig {
            interval: Duration::from_secs(3_600),
            workers: 2,
            queue_capacity: 16,
        }
    }

    #[test]
    fn test_report_merge() {
        let mut total = CleanupReport::default();
        total.merge(CleanupReport { deleted: 3, failed: 0 });
        total.merge(CleanupReport { deleted: 1, failed: 2 });
        assert_eq!(total, CleanupReport { deleted: 4, failed: 2 });
    }

    #[test]
    fn test_run_cycle_survives_failing_source() {
        let cleaner = RelictCleaner::start(idle_config()).unwrap();
        let bad = FakeSource::new("bad", true);
        let good = FakeSource::new("good", false);
        cleaner.register(&bad);
        cleaner.register(&good);

        let report = cleaner.run_cycle();
        assert_eq!(report, CleanupReport { deleted: 2, failed: 1 });
        assert_eq!(cleaner.stats().errors(), 1);

        let report = cleaner.run_cycle();
        assert_eq!(report.deleted, 2);
        assert_eq!(cleaner.stats().cycles(), 2);
        cleaner.shutdown();
    }

    #[test]
    fn test_dropped_source_is_skipped() {
        let cleaner = RelictCleaner::start(idle_config()).unwrap();
        let kept = FakeSource::new("kept", false);
        let dropped = FakeSource::new("dropped", false);
        cleaner.register(&kept);
        cleaner.register(&dropped);
        assert_eq!(cleaner.registered(), 2);

        drop(dropped);
        assert_eq!(cleaner.registered(), 1);
        assert_eq!(cleaner.run_cycle().deleted, 2);
        cleaner.shutdown();
    }

    #[test]
    fn test_trigger_runs_on_workers() {
        let cleaner = RelictCleaner::start(idle_config()).unwrap();
        let a = FakeSource::new("a", false);
        let b = FakeSource::new("b", true);
        cleaner.register(&a);
        cleaner.register(&b);

        assert_eq!(cleaner.trigger(), 2);
        let stats = Arc::clone(&cleaner.stats);
        // Shutdown drains the queue before joining the workers
        cleaner.shutdown();

        assert_eq!(stats.deleted(), 2);
        assert_eq!(stats.failed(), 1);
        assert_eq!(stats.errors(), 1);
    }

    #[test]
    fn test_ticker_fires() {
        let cleaner = RelictCleaner::start(CleanerConfig {
            interval: Duration::from_millis(10),
            workers: 1,
            queue_capacity: 4,
        })
        .unwrap();
        let source = FakeSource::new("ticking", false);
        cleaner.register(&source);

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while cleaner.stats().deleted() == 0 && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(cleaner.stats().deleted() >= 2);
        cleaner.shutdown();
    }
}
