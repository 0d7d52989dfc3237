//! File-backed fragment storage

use super::handles::HandlePool;
use super::layout::{self, HEADER_SIZE, RECORD_SIZE};
use super::StorageChannelMetaData;
use crate::{DataType, HdError, Result, SampleValue, Value};
use bytes::BytesMut;
use parking_lot::RwLock;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// Records read per positioned read during range scans
const READ_CHUNK_RECORDS: u32 = 4096;

/// One fragment file: a fixed-capacity array of value slots.
///
/// Writes and deletion take the exclusive lock, reads the shared one, so a
/// reader never observes a half-written record or a half-deleted file.
pub struct FileBackEnd {
    path: PathBuf,
    metadata: StorageChannelMetaData,
    handles: Arc<HandlePool>,
    state: RwLock<BackEndState>,
}

#[derive(Debug, Default)]
struct BackEndState {
    deleted: bool,
}

impl FileBackEnd {
    /// Create a new, empty fragment file
    pub fn create(
        path: impl Into<PathBuf>,
        metadata: StorageChannelMetaData,
        handles: Arc<HandlePool>,
    ) -> Result<Self> {
        let path = path.into();
        let header = layout::encode_header(&metadata)?;

        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)?;
        file.write_all(&header)?;
        // Pre-size so every slot exists; unwritten slots read back as zeros
        file.set_len(layout::file_size(metadata.capacity))?;
        file.sync_all()?;

        info!(
            "Created fragment {:?} ({} slots of {}ms)",
            path, metadata.capacity, metadata.slot_span
        );

        Ok(Self {
            path,
            metadata,
            handles,
            state: RwLock::new(BackEndState::default()),
        })
    }

    /// Open an existing fragment, recovering its metadata from the header
    pub fn initialize(path: impl Into<PathBuf>, handles: Arc<HandlePool>) -> Result<Self> {
        let path = path.into();
        let mut file = File::open(&path)?;

        let mut header = [0u8; HEADER_SIZE];
        file.read_exact(&mut header).map_err(|e| {
            HdError::Corruption(format!("Unreadable fragment header in {:?}: {}", path, e))
        })?;
        let metadata = layout::decode_header(&header)?;

        let expected = layout::file_size(metadata.capacity);
        let actual = file.metadata()?.len();
        if actual < expected {
            return Err(HdError::Corruption(format!(
                "Truncated fragment {:?}: {} bytes, expected {}",
                path, actual, expected
            )));
        }

        Ok(Self {
            path,
            metadata,
            handles,
            state: RwLock::new(BackEndState::default()),
        })
    }

    /// Release the open file handle; the fragment stays usable and reopens on demand
    pub fn deinitialize(&self) {
        let _state = self.state.write();
        self.handles.release(&self.path);
    }

    /// Delete the fragment file.
    ///
    /// Waits for in-flight readers. On failure the fragment is left as it was.
    pub fn delete(&self) -> Result<()> {
        let mut state = self.state.write();
        if state.deleted {
            return Ok(());
        }

        self.handles.release(&self.path);
        match fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        state.deleted = true;

        info!("Deleted fragment {:?}", self.path);
        Ok(())
    }

    /// Flush written slots to stable storage
    pub fn sync(&self) -> Result<()> {
        let state = self.state.read();
        if state.deleted {
            return Ok(());
        }
        let file = self.handles.acquire(&self.path)?;
        file.sync_data()?;
        Ok(())
    }

    /// Fragment metadata
    pub fn metadata(&self) -> &StorageChannelMetaData {
        &self.metadata
    }

    /// Fragment file path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Check if the fragment has been deleted
    pub fn is_deleted(&self) -> bool {
        self.state.read().deleted
    }

    /// Write a value into its slot.
    ///
    /// Values whose index lies outside `[0, capacity)` belong to another
    /// fragment and are dropped without error.
    pub fn update<T: SampleValue>(&self, value: &Value<T>) -> Result<()> {
        self.check_type(T::DATA_TYPE)?;

        if value.index < 0 || value.index >= self.metadata.capacity as i64 {
            debug!(
                "Dropping value at index {} outside fragment {:?}",
                value.index, self.path
            );
            return Ok(());
        }

        let mut record = BytesMut::with_capacity(RECORD_SIZE);
        layout::encode_record(value, &mut record);

        let state = self.state.write();
        if state.deleted {
            return Err(HdError::FragmentDeleted(self.path.display().to_string()));
        }

        let file = self.handles.acquire(&self.path)?;
        positioned::write_all_at(&file, &record, layout::slot_offset(value.index as u32))?;

        Ok(())
    }

    /// Read every written slot in the half-open index range `[start, end)`.
    ///
    /// Bounds are clipped to the fragment; empty or reversed ranges yield
    /// an empty result, as does a deleted fragment.
    pub fn get_values<T: SampleValue>(&self, start_index: i64, end_index: i64) -> Result<Vec<Value<T>>> {
        self.check_type(T::DATA_TYPE)?;

        let start = start_index.max(0);
        let end = end_index.min(self.metadata.capacity as i64);
        if start >= end {
            return Ok(Vec::new());
        }

        let state = self.state.read();
        if state.deleted {
            return Ok(Vec::new());
        }

        // Positioned reads leave the shared handle untouched, so readers
        // of one fragment proceed in parallel under the shared lock
        let file = self.handles.acquire(&self.path)?;

        let mut values = Vec::new();
        let mut buf = Vec::new();
        let mut chunk_start = start as u32;
        let end = end as u32;

        while chunk_start < end {
            let count = (end - chunk_start).min(READ_CHUNK_RECORDS);
            buf.resize(count as usize * RECORD_SIZE, 0);

            positioned::read_exact_at(&file, &mut buf, layout::slot_offset(chunk_start))?;

            for (i, record) in buf.chunks_exact(RECORD_SIZE).enumerate() {
                let index = chunk_start as i64 + i as i64;
                if let Some(value) = layout::decode_record(index, record) {
                    values.push(value);
                }
            }

            chunk_start += count;
        }

        drop(file);
        drop(state);
        Ok(values)
    }

    /// Write a long value
    pub fn update_long(&self, value: &Value<i64>) -> Result<()> {
        self.update(value)
    }

    /// Write a double value
    pub fn update_double(&self, value: &Value<f64>) -> Result<()> {
        self.update(value)
    }

    /// Read long values in `[start, end)`
    pub fn get_long_values(&self, start_index: i64, end_index: i64) -> Result<Vec<Value<i64>>> {
        self.get_values(start_index, end_index)
    }

    /// Read double values in `[start, end)`
    pub fn get_double_values(&self, start_index: i64, end_index: i64) -> Result<Vec<Value<f64>>> {
        self.get_values(start_index, end_index)
    }

    fn check_type(&self, actual: DataType) -> Result<()> {
        if actual != self.metadata.data_type {
            return Err(HdError::DataTypeMismatch {
                expected: self.metadata.data_type,
                actual,
            });
        }
        Ok(())
    }
}

#[cfg(unix)]
mod positioned {
    use std::fs::File;
    use std::io;
    use std::os::unix::fs::FileExt;

    pub(super) fn read_exact_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<()> {
        file.read_exact_at(buf, offset)
    }

    pub(super) fn write_all_at(file: &File, buf: &[u8], offset: u64) -> io::Result<()> {
        file.write_all_at(buf, offset)
    }
}

#[cfg(windows)]
mod positioned {
    use std::fs::File;
    use std::io;
    use std::os::windows::fs::FileExt;

    pub(super) fn read_exact_at(file: &File, mut buf: &mut [u8], mut offset: u64) -> io::Result<()> {
        while !buf.is_empty() {
            match file.seek_read(buf, offset)? {
                0 => return Err(io::ErrorKind::UnexpectedEof.into()),
                n => {
                    buf = &mut buf[n..];
                    offset += n as u64;
                }
            }
        }
        Ok(())
    }

    pub(super) fn write_all_at(file: &File, mut buf: &[u8], mut offset: u64) -> io::Result<()> {
        while !buf.is_empty() {
            match file.seek_write(buf, offset)? {
                0 => return Err(io::ErrorKind::WriteZero.into()),
                n => {
                    buf = &buf[n..];
                    offset += n as u64;
                }
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for FileBackEnd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileBackEnd")
            .field("path", &self.path)
            .field("metadata", &self.metadata)
            .finish()
    }
}
