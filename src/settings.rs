//! Settings management
//!
//! Stores user preferences in ~/.config/vinery/settings.json

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::repository::{CacheBackend, SourceConfig};

/// Interpreter used for installer scripts when none is configured
pub const DEFAULT_INTERPRETER: &str = "bash";

/// Seconds a cancelled script gets to clean up before it is killed
pub const DEFAULT_CANCEL_GRACE_SECS: u64 = 10;

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Repository source '{0}' is configured more than once")]
    DuplicateSource(String),

    #[error("Repository source '{0}' has an empty location")]
    EmptyLocation(String),

    #[error("Could not determine the {0} directory")]
    NoDirectory(&'static str),
}

/// User settings for vinery
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    /// Repository sources, highest priority first
    #[serde(default)]
    pub sources: Vec<SourceConfig>,

    /// Directory holding the virtual drives (empty = data dir)
    #[serde(default)]
    pub drives_dir: String,

    /// Catalog cache file (empty = data dir)
    #[serde(default)]
    pub cache_path: String,

    #[serde(default)]
    pub cache_backend: CacheBackend,

    /// Where inline and downloaded scripts are staged (empty = data dir)
    #[serde(default)]
    pub scripts_dir: String,

    /// Create unknown drives on first use
    #[serde(default = "default_true")]
    pub auto_provision: bool,

    /// Worker pool size (0 = number of CPUs)
    #[serde(default)]
    pub workers: usize,

    /// Program that runs installer scripts
    #[serde(default = "default_interpreter")]
    pub interpreter: String,

    /// Seconds between asking a cancelled script to stop and killing it
    #[serde(default = "default_cancel_grace_secs")]
    pub cancel_grace_secs: u64,

    /// Directory for daily log files (empty = no file logging)
    #[serde(default)]
    pub log_dir: String,
}

fn default_true() -> bool {
    true
}

fn default_interpreter() -> String {
    DEFAULT_INTERPRETER.to_string()
}

fn default_cancel_grace_secs() -> u64 {
    DEFAULT_CANCEL_GRACE_SECS
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            sources: Vec::new(),
            drives_dir: String::new(),
            cache_path: String::new(),
            cache_backend: CacheBackend::default(),
            scripts_dir: String::new(),
            auto_provision: true,
            workers: 0,
            interpreter: default_interpreter(),
            cancel_grace_secs: DEFAULT_CANCEL_GRACE_SECS,
            log_dir: String::new(),
        }
    }
}

impl Settings {
    /// Get the config directory path (~/.config/vinery)
    fn config_dir() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Could not determine config directory")?
            .join("vinery");

        Ok(config_dir)
    }

    /// Get the data directory path (~/.local/share/vinery)
    fn data_dir() -> Result<PathBuf, ConfigError> {
        dirs::data_dir()
            .map(|d| d.join("vinery"))
            .ok_or(ConfigError::NoDirectory("data"))
    }

    /// Get the settings file path
    pub fn settings_path() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("settings.json"))
    }

    /// Load settings from the default location, or return defaults if not found
    pub fn load() -> Self {
        match Self::settings_path() {
            Ok(path) => Self::load_from(&path),
            Err(e) => {
                eprintln!("Could not load settings: {}. Using defaults.", e);
                Self::default()
            }
        }
    }

    /// Load settings from `path`, or return defaults if missing or unreadable
    pub fn load_from(path: &Path) -> Self {
        match Self::try_load_from(path) {
            Ok(settings) => settings,
            Err(e) => {
                eprintln!("Could not load settings: {:#}. Using defaults.", e);
                Self::default()
            }
        }
    }

    /// Try to load settings, returning error on failure
    pub fn try_load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content =
            std::fs::read_to_string(path).with_context(|| format!("Failed to read {:?}", path))?;

        let settings: Self = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse {:?}", path))?;

        Ok(settings)
    }

    /// Save settings to the default location
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::settings_path()?)
    }

    /// Save settings to `path`
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {:?}", parent))?;
        }

        let content = serde_json::to_string_pretty(self).context("Failed to serialize settings")?;

        std::fs::write(path, content).with_context(|| format!("Failed to write {:?}", path))?;

        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut names = HashSet::new();
        for source in &self.sources {
            let name = source.effective_name();
            if source.location.trim().is_empty() {
                return Err(ConfigError::EmptyLocation(name.to_string()));
            }
            if !names.insert(name) {
                return Err(ConfigError::DuplicateSource(name.to_string()));
            }
        }
        Ok(())
    }

    pub fn drives_dir(&self) -> Result<PathBuf, ConfigError> {
        if self.drives_dir.is_empty() {
            Ok(Self::data_dir()?.join("drives"))
        } else {
            Ok(PathBuf::from(&self.drives_dir))
        }
    }

    pub fn cache_path(&self) -> Result<PathBuf, ConfigError> {
        if !self.cache_path.is_empty() {
            return Ok(PathBuf::from(&self.cache_path));
        }
        let file = match self.cache_backend {
            CacheBackend::Json => "catalog.json",
            CacheBackend::Sqlite => "catalog.db",
        };
        Ok(Self::data_dir()?.join(file))
    }

    /// Where inline and downloaded scripts are written before running
    pub fn staging_dir(&self) -> Result<PathBuf, ConfigError> {
        if self.scripts_dir.is_empty() {
            Ok(Self::data_dir()?.join("scripts"))
        } else {
            Ok(PathBuf::from(&self.scripts_dir))
        }
    }

    pub fn log_dir(&self) -> Option<PathBuf> {
        if self.log_dir.is_empty() {
            None
        } else {
            Some(PathBuf::from(&self.log_dir))
        }
    }

    pub fn cancel_grace(&self) -> Duration {
        Duration::from_secs(self.cancel_grace_secs)
    }

    /// Effective worker pool size
    pub fn worker_count(&self) -> usize {
        if self.workers > 0 {
            return self.workers;
        }
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4)
    }
}
