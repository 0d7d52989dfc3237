//! Fragment file naming, discovery and creation for one channel directory

use crate::backend::{FileBackEnd, HandlePool, StorageChannelMetaData};
use crate::{CalculationMethod, HdError, Result, Timestamp};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Fragment file extension
pub const FRAGMENT_EXTENSION: &str = "hds";

/// Identity of a fragment as encoded in its file name:
/// `<configuration id>.<level>.<METHOD>.<start>.<end>.hds`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FragmentName {
    pub configuration_id: String,
    pub level: u32,
    pub calculation_method: CalculationMethod,
    pub start_time: Timestamp,
    pub end_time: Timestamp,
}

impl FragmentName {
    /// Name of the fragment described by `meta`
    pub fn from_metadata(meta: &StorageChannelMetaData) -> Self {
        Self {
            configuration_id: meta.configuration_id.clone(),
            level: meta.level,
            calculation_method: meta.calculation_method,
            start_time: meta.start_time,
            end_time: meta.end_time(),
        }
    }

    /// Parse a file name; `None` for anything that is not a fragment
    pub fn parse(file_name: &str) -> Option<Self> {
        let stem = file_name.strip_suffix(FRAGMENT_EXTENSION)?.strip_suffix('.')?;
        let parts: Vec<&str> = stem.split('.').collect();
        let [id, level, method, start, end] = parts.as_slice() else {
            return None;
        };

        let name = Self {
            configuration_id: (*id).to_string(),
            level: level.parse().ok()?,
            calculation_method: method.parse().ok()?,
            start_time: start.parse().ok()?,
            end_time: end.parse().ok()?,
        };
        if name.configuration_id.is_empty() || name.end_time <= name.start_time {
            return None;
        }
        Some(name)
    }

    /// Render the file name
    pub fn file_name(&self) -> String {
        format!(
            "{}.{}.{}.{}.{}.{}",
            self.configuration_id,
            self.level,
            self.calculation_method.label(),
            self.start_time,
            self.end_time,
            FRAGMENT_EXTENSION
        )
    }
}

/// Creates, opens and enumerates the fragment files of one channel
pub struct BackEndFactory {
    dir: PathBuf,
    configuration_id: String,
    handles: Arc<HandlePool>,
}

impl BackEndFactory {
    /// Create a factory for the channel directory `dir`
    pub fn new(dir: impl Into<PathBuf>, configuration_id: impl Into<String>, handles: Arc<HandlePool>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            configuration_id: configuration_id.into(),
            handles,
        })
    }

    /// Channel directory
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn configuration_id(&self) -> &str {
        &self.configuration_id
    }

    /// Path of the fragment described by `meta`
    pub fn fragment_path(&self, meta: &StorageChannelMetaData) -> PathBuf {
        self.dir.join(FragmentName::from_metadata(meta).file_name())
    }

    /// List the fragment files of one level and method, ordered by start time
    pub fn list(&self, level: u32, method: CalculationMethod) -> Result<Vec<(PathBuf, FragmentName)>> {
        let mut found = Vec::new();

        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let path = entry.path();
            let Some(name) = path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(FragmentName::parse)
            else {
                continue;
            };
            if name.configuration_id == self.configuration_id
                && name.level == level
                && name.calculation_method == method
            {
                found.push((path, name));
            }
        }

        found.sort_by_key(|(_, name)| name.start_time);
        Ok(found)
    }

    /// Create a new fragment file
    pub fn create(&self, meta: StorageChannelMetaData) -> Result<FileBackEnd> {
        let path = self.fragment_path(&meta);
        FileBackEnd::create(path, meta, self.handles.clone())
    }

    /// Open a discovered fragment, checking its header against its name
    pub fn open(&self, path: &Path, name: &FragmentName) -> Result<FileBackEnd> {
        let backend = FileBackEnd::initialize(path, self.handles.clone())?;
        let actual = FragmentName::from_metadata(backend.metadata());
        if &actual != name {
            return Err(HdError::Corruption(format!(
                "Fragment header of {:?} does not match its name ({:?})",
                path, actual
            )));
        }
        Ok(backend)
    }
}
