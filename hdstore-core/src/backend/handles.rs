//! LRU-bounded pool of open fragment files
//!
//! Systems with many channels and fragments would otherwise exhaust file
//! descriptors. The pool keeps at most `capacity` files open; evicting a
//! handle only drops the pool's reference, so an operation already holding a
//! clone finishes normally and the next access reopens the file.

use crate::Result;
use lru_cache::LruCache;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::trace;

/// Open file shared between the pool and in-flight operations.
///
/// Fragments are accessed with positioned reads and writes only, so the
/// handle carries no cursor and needs no lock of its own.
pub type SharedFile = Arc<File>;

/// Pool of open fragment files with least-recently-used eviction
pub struct HandlePool {
    inner: Mutex<PoolInner>,
}

struct PoolInner {
    open: LruCache<PathBuf, SharedFile>,
    opened_total: u64,
}

impl HandlePool {
    /// Create a pool holding at most `capacity` open files
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(PoolInner {
                open: LruCache::new(capacity.max(1)),
                opened_total: 0,
            }),
        }
    }

    /// Get the open handle for `path`, opening it if needed
    pub fn acquire(&self, path: &Path) -> Result<SharedFile> {
        let mut inner = self.inner.lock();

        if let Some(file) = inner.open.get_mut(path) {
            return Ok(file.clone());
        }

        let file = Arc::new(OpenOptions::new().read(true).write(true).open(path)?);
        if inner.open.len() >= inner.open.capacity() {
            if let Some((evicted, _)) = inner.open.remove_lru() {
                trace!("Evicted fragment handle {:?}", evicted);
            }
        }
        inner.open.insert(path.to_path_buf(), file.clone());
        inner.opened_total += 1;

        Ok(file)
    }

    /// Close the pooled handle for `path`, if any
    pub fn release(&self, path: &Path) {
        self.inner.lock().open.remove(path);
    }

    /// Close every pooled handle
    pub fn release_all(&self) {
        self.inner.lock().open.clear();
    }

    /// Number of currently pooled handles
    pub fn open_count(&self) -> usize {
        self.inner.lock().open.len()
    }

    /// Number of files opened over the pool's lifetime
    pub fn opened_total(&self) -> u64 {
        self.inner.lock().opened_total
    }

    /// Maximum number of pooled handles
    pub fn capacity(&self) -> usize {
        self.inner.lock().open.capacity()
    }
}
