mod backend;
mod persisted;
mod store;

use std::path::Path;

use anyhow::{Context, Result};

pub use backend::{FileMappingBackend, MappingBackend};
pub use persisted::{PersistedGroup, PersistedLink, PersistedMapping};
pub use store::{MappingStore, MappingTables};

/// Load the mapping persisted at `path`. A missing file yields an empty store.
pub fn load(path: &Path, default_name: &str) -> Result<MappingStore> {
    MappingStore::load_from(&FileMappingBackend::new(path), default_name)
        .with_context(|| format!("Failed to load changelist mapping from {:?}", path))
}

/// Persist the mapping to `path`.
pub fn save(store: &MappingStore, path: &Path) -> Result<()> {
    store
        .save_to(&FileMappingBackend::new(path))
        .with_context(|| format!("Failed to save changelist mapping to {:?}", path))
}
