use std::{
    env,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Expand tilde (~) in path to user's home directory
fn expand_tilde(path: &Path) -> PathBuf {
    if let Some(s) = path.to_str() {
        if let Some(stripped) = s.strip_prefix("~/") {
            if let Some(home) = dirs::home_dir() {
                return home.join(stripped);
            }
        } else if s == "~" {
            if let Some(home) = dirs::home_dir() {
                return home;
            }
        }
    }
    path.to_path_buf()
}

/// Configuration for changelist synchronization
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SyncConfig {
    /// Where the local group <-> changelist mapping is persisted
    #[serde(default = "defaults::mapping_path")]
    pub mapping_path: PathBuf,
    /// How long a refresh result may be replayed for an unchanged scope
    #[serde(default = "defaults::refresh_ttl_secs")]
    pub refresh_ttl_secs: u64,
    /// Name of the local group standing for every default changelist
    #[serde(default = "defaults::default_changelist_name")]
    pub default_changelist_name: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            mapping_path: defaults::mapping_path(),
            refresh_ttl_secs: defaults::refresh_ttl_secs(),
            default_changelist_name: defaults::default_changelist_name(),
        }
    }
}

impl SyncConfig {
    /// Load configuration from the default config file and environment
    pub fn load() -> Result<Self> {
        let config_path = Self::config_file_path()?;
        Self::load_with_env(&config_path, |key| env::var(key).ok())
    }

    /// Load `path` (defaults when missing), then apply overrides from `lookup`
    pub fn load_with_env(path: &Path, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        tracing::debug!("loading p4-changelist-sync config from {:?}", path);
        let mut config = if path.exists() {
            Self::load_from_file(path)?
        } else {
            tracing::debug!("no config file at {:?}, using defaults", path);
            Self::default()
        };

        if let Some(path) = lookup("P4CL_MAPPING_PATH") {
            config.mapping_path = expand_tilde(&PathBuf::from(path));
        }

        if let Some(ttl) = lookup("P4CL_REFRESH_TTL_SECS") {
            config.refresh_ttl_secs = ttl
                .parse()
                .context("Failed to parse P4CL_REFRESH_TTL_SECS as u64")?;
        }

        if let Some(name) = lookup("P4CL_DEFAULT_CHANGELIST_NAME") {
            config.default_changelist_name = name;
        }

        Ok(config)
    }

    /// Load configuration from a file
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let mut config: SyncConfig = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;

        config.mapping_path = expand_tilde(&config.mapping_path);
        Ok(config)
    }

    /// Save configuration to file
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
        }

        let content = serde_yaml::to_string(self).context("Failed to serialize config")?;

        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {:?}", path))?;

        Ok(())
    }

    /// Get default config file path
    pub fn config_file_path() -> Result<PathBuf> {
        dirs::home_dir()
            .map(|home| home.join(".config/p4-changelist-sync/config.yaml"))
            .context("Could not determine home directory for config file")
    }

    pub fn refresh_ttl(&self) -> Duration {
        Duration::from_secs(self.refresh_ttl_secs)
    }
}

mod defaults {
    use std::path::PathBuf;

    pub(crate) fn mapping_path() -> PathBuf {
        super::expand_tilde(&PathBuf::from(
            "~/.config/p4-changelist-sync/mapping.yaml",
        ))
    }

    pub(crate) fn refresh_ttl_secs() -> u64 {
        10
    }

    pub(crate) fn default_changelist_name() -> String {
        "Default Changelist".to_string()
    }
}
