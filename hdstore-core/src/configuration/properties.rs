//! Persisted property sources

use crate::Result;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Flat string key-value configuration
pub type Properties = BTreeMap<String, String>;

/// Source of persisted channel properties
pub trait PropertiesSource: Send + Sync {
    /// Load all properties
    fn load(&self) -> Result<Properties>;

    /// Replace the stored properties
    fn store(&self, properties: &Properties) -> Result<()>;
}

/// Properties stored as a JSON object of strings
#[derive(Debug, Clone)]
pub struct JsonPropertiesFile {
    path: PathBuf,
}

impl JsonPropertiesFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.is_file()
    }
}

impl PropertiesSource for JsonPropertiesFile {
    fn load(&self) -> Result<Properties> {
        let data = fs::read_to_string(&self.path)?;
        Ok(serde_json::from_str(&data)?)
    }

    fn store(&self, properties: &Properties) -> Result<()> {
        let data = serde_json::to_string_pretty(properties)?;
        // Write-then-rename so a crash never leaves a half-written file
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, data)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}
