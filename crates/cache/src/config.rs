//! Engine configuration for cache sizes, locations and worker pools.
//!
//! Configuration can be loaded from a TOML file, overridden from environment
//! variables, or built programmatically. Sizes are stored in bytes and written
//! to files in megabytes.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::memory::MemoryCategory;

const MB: usize = 1024 * 1024;

/// Configuration for the loading engine.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Memory cache budget in bytes, before the memory category multiplier
    pub memory_cache_size: usize,
    /// Disk cache size limit in bytes
    pub disk_cache_size: usize,
    /// Directory path for disk cache storage
    pub disk_cache_dir: PathBuf,
    /// Workers in the bounded source pool; `None` picks a size from the CPU count
    pub source_threads: Option<usize>,
    /// Workers in the animation pool; `None` picks a size from the CPU count
    pub animation_threads: Option<usize>,
    /// Keep released payloads reachable so they can move into the memory cache
    pub retain_cleared_payload: bool,
    /// Initial memory category
    pub memory_category: MemoryCategory,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            memory_cache_size: 64 * MB,
            disk_cache_size: 250 * MB,
            disk_cache_dir: Self::default_cache_dir(),
            source_threads: None,
            animation_threads: None,
            retain_cleared_payload: false,
            memory_category: MemoryCategory::Normal,
        }
    }
}

/// On-disk representation; every field is optional and falls back to the default.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    #[serde(skip_serializing_if = "Option::is_none")]
    memory_cache_mb: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    disk_cache_mb: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    disk_cache_dir: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    source_threads: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    animation_threads: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    retain_cleared_payload: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    memory_category: Option<MemoryCategory>,
}

impl EngineConfig {
    /// Sets the memory cache size in megabytes.
    pub fn with_memory_mb(mut self, mb: usize) -> Self {
        self.memory_cache_size = mb * MB;
        self
    }

    /// Sets the disk cache size in megabytes.
    pub fn with_disk_mb(mut self, mb: usize) -> Self {
        self.disk_cache_size = mb * MB;
        self
    }

    /// Sets the disk cache directory.
    pub fn with_disk_dir<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.disk_cache_dir = path.as_ref().to_path_buf();
        self
    }

    /// Sets the number of bounded source workers.
    pub fn with_source_threads(mut self, threads: usize) -> Self {
        self.source_threads = Some(threads);
        self
    }

    /// Sets the number of animation workers.
    pub fn with_animation_threads(mut self, threads: usize) -> Self {
        self.animation_threads = Some(threads);
        self
    }

    /// Keep released payloads reachable for the hand-off to the memory cache.
    pub fn with_retain_cleared_payload(mut self, retain: bool) -> Self {
        self.retain_cleared_payload = retain;
        self
    }

    /// Sets the initial memory category.
    pub fn with_memory_category(mut self, category: MemoryCategory) -> Self {
        self.memory_category = category;
        self
    }

    /// Returns the default cache directory for the current platform.
    ///
    /// - macOS: ~/Library/Caches/pixelflow/data
    /// - Linux: ~/.cache/pixelflow/data
    /// - Windows: %LOCALAPPDATA%\pixelflow\data
    pub fn default_cache_dir() -> PathBuf {
        if let Some(cache_dir) = dirs::cache_dir() {
            cache_dir.join("pixelflow").join("data")
        } else {
            PathBuf::from("cache/pixelflow")
        }
    }

    /// Loads configuration from environment variables on top of the defaults.
    ///
    /// Environment variables:
    /// - `PIXELFLOW_MEMORY_CACHE_MB`: memory cache size in MB (default: 64)
    /// - `PIXELFLOW_DISK_CACHE_MB`: disk cache size in MB (default: 250)
    /// - `PIXELFLOW_CACHE_DIR`: disk cache directory path
    /// - `PIXELFLOW_SOURCE_THREADS`: bounded source pool size
    ///
    /// # Errors
    /// Returns an error if any environment variable contains an invalid value.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::default().apply_env()
    }

    /// Overrides fields from environment variables.
    pub fn apply_env(mut self) -> Result<Self, ConfigError> {
        if let Some(mb) = env_usize("PIXELFLOW_MEMORY_CACHE_MB")? {
            self.memory_cache_size = mb * MB;
        }
        if let Some(mb) = env_usize("PIXELFLOW_DISK_CACHE_MB")? {
            self.disk_cache_size = mb * MB;
        }
        if let Ok(dir) = std::env::var("PIXELFLOW_CACHE_DIR") {
            self.disk_cache_dir = PathBuf::from(dir);
        }
        if let Some(threads) = env_usize("PIXELFLOW_SOURCE_THREADS")? {
            if threads == 0 {
                return Err(ConfigError::InvalidValue(
                    "PIXELFLOW_SOURCE_THREADS".to_string(),
                ));
            }
            self.source_threads = Some(threads);
        }
        Ok(self)
    }

    /// Loads configuration from a TOML file.
    ///
    /// Expected file format:
    /// ```toml
    /// memory_cache_mb = 64
    /// disk_cache_mb = 250
    /// disk_cache_dir = "/path/to/cache"
    /// source_threads = 4
    /// memory_category = "high"
    /// ```
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&contents)
    }

    /// Parses configuration from a TOML string.
    pub fn from_toml_str(toml_str: &str) -> Result<Self, ConfigError> {
        let file: ConfigFile = toml::from_str(toml_str)?;
        let mut config = Self::default();

        if let Some(mb) = file.memory_cache_mb {
            config.memory_cache_size = mb * MB;
        }
        if let Some(mb) = file.disk_cache_mb {
            config.disk_cache_size = mb * MB;
        }
        if let Some(dir) = file.disk_cache_dir {
            config.disk_cache_dir = dir;
        }
        if let Some(threads) = file.source_threads {
            if threads == 0 {
                return Err(ConfigError::InvalidValue("source_threads".to_string()));
            }
            config.source_threads = Some(threads);
        }
        if let Some(threads) = file.animation_threads {
            if threads == 0 {
                return Err(ConfigError::InvalidValue("animation_threads".to_string()));
            }
            config.animation_threads = Some(threads);
        }
        if let Some(retain) = file.retain_cleared_payload {
            config.retain_cleared_payload = retain;
        }
        if let Some(category) = file.memory_category {
            config.memory_category = category;
        }
        Ok(config)
    }

    /// Saves configuration to a TOML file.
    ///
    /// # Errors
    /// Returns an error if the file cannot be written.
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        fs::write(path.as_ref(), self.to_toml()?)?;
        Ok(())
    }

    /// Converts configuration to TOML format.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        let file = ConfigFile {
            memory_cache_mb: Some(self.memory_cache_mb()),
            disk_cache_mb: Some(self.disk_cache_mb()),
            disk_cache_dir: Some(self.disk_cache_dir.clone()),
            source_threads: self.source_threads,
            animation_threads: self.animation_threads,
            retain_cleared_payload: Some(self.retain_cleared_payload),
            memory_category: Some(self.memory_category),
        };
        Ok(toml::to_string(&file)?)
    }

    /// Returns the memory cache size in megabytes.
    pub fn memory_cache_mb(&self) -> usize {
        self.memory_cache_size / MB
    }

    /// Returns the disk cache size in megabytes.
    pub fn disk_cache_mb(&self) -> usize {
        self.disk_cache_size / MB
    }
}

fn env_usize(name: &str) -> Result<Option<usize>, ConfigError> {
    match std::env::var(name) {
        Ok(val) => val
            .trim()
            .parse::<usize>()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue(name.to_string())),
        Err(_) => Ok(None),
    }
}

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Invalid value for a configuration parameter
    #[error("Invalid value for configuration key: {0}")]
    InvalidValue(String),
    /// I/O error reading or writing configuration file
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),
    /// The file is not valid configuration TOML
    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),
    /// The configuration could not be rendered as TOML
    #[error("Failed to serialize configuration: {0}")]
    Serialize(#[from] toml::ser::Error),
}
