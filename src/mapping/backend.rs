use std::{
    fs,
    io::Write,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use tempfile::NamedTempFile;

use super::PersistedMapping;

/// Somewhere the identity mapping can be read from and written to.
pub trait MappingBackend {
    /// Read the persisted mapping.
    /// Returns an empty mapping if nothing has been written yet.
    fn read_mapping(&self) -> Result<PersistedMapping>;

    /// Atomically replace the persisted mapping.
    fn write_mapping(&self, mapping: &PersistedMapping) -> Result<()>;
}

/// YAML file backend.
pub struct FileMappingBackend {
    path: PathBuf,
}

impl FileMappingBackend {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        FileMappingBackend {
            path: path.as_ref().to_path_buf(),
        }
    }
}

impl MappingBackend for FileMappingBackend {
    fn read_mapping(&self) -> Result<PersistedMapping> {
        tracing::debug!("Loading changelist mapping from {:?}", self.path);
        if !self.path.exists() {
            return Ok(PersistedMapping::default());
        }

        let content = fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read changelist mapping from {:?}", self.path))?;

        let mapping: PersistedMapping = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse changelist mapping from {:?}", self.path))?;

        Ok(mapping)
    }

    fn write_mapping(&self, mapping: &PersistedMapping) -> Result<()> {
        let parent = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&parent)
            .with_context(|| format!("Failed to create directory {:?}", parent))?;

        let content =
            serde_yaml::to_string(mapping).context("Failed to serialize changelist mapping")?;

        // Temp file in the same directory so the rename stays on one filesystem
        let mut temp_file = NamedTempFile::new_in(&parent)
            .with_context(|| format!("Failed to create temporary file in {:?}", parent))?;
        temp_file
            .write_all(content.as_bytes())
            .context("Failed to write changelist mapping to temporary file")?;
        temp_file
            .persist(&self.path)
            .with_context(|| format!("Failed to write changelist mapping to {:?}", self.path))?;

        Ok(())
    }
}
