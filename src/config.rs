//! Bridge configuration.
//!
//! Handles parsing and management of chembridge.toml configuration files.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Environment variable overriding the native library directory.
pub const LIBRARY_PATH_VAR: &str = "CHEMBRIDGE_LIBRARY_PATH";

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Config file not found: {0}")]
    NotFound(String),
}

/// Result type for configuration operations.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Root configuration structure matching chembridge.toml.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct BridgeConfig {
    /// Native library location and extraction settings
    #[serde(default)]
    pub library: LibraryConfig,

    /// Session defaults
    #[serde(default)]
    pub session: SessionConfig,
}

impl BridgeConfig {
    /// Load configuration from a file path.
    pub fn load(path: &Path) -> ConfigResult<Self> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.display().to_string()));
        }
        let content = std::fs::read_to_string(path)?;
        let config: BridgeConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Find and load configuration by searching up from the given directory.
    pub fn find_and_load(start_dir: &Path) -> ConfigResult<Self> {
        let mut dir = start_dir.to_path_buf();
        loop {
            let config_path = dir.join("chembridge.toml");
            if config_path.exists() {
                return Self::load(&config_path);
            }
            if !dir.pop() {
                // Reached root without finding config
                return Ok(Self::default());
            }
        }
    }

    /// Load configuration from the current directory or parents.
    pub fn load_from_cwd() -> ConfigResult<Self> {
        let cwd = std::env::current_dir().map_err(ConfigError::Io)?;
        Self::find_and_load(&cwd)
    }

    /// The directory native libraries are loaded from, if overridden. The
    /// environment variable wins over the config file; when neither is set,
    /// modules are extracted from embedded payloads instead.
    pub fn library_dir(&self) -> Option<PathBuf> {
        if let Ok(dir) = std::env::var(LIBRARY_PATH_VAR) {
            if !dir.is_empty() {
                return Some(PathBuf::from(dir));
            }
        }
        self.library.dir.clone()
    }

    /// Root directory embedded payloads are materialized under. Qualified by
    /// crate version so upgrades never reuse stale binaries.
    pub fn extraction_root(&self) -> PathBuf {
        self.library.extraction_root.clone().unwrap_or_else(|| {
            std::env::temp_dir().join(format!("chembridge-{}", env!("CARGO_PKG_VERSION")))
        })
    }
}

/// Native library location settings.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LibraryConfig {
    /// Directory to load native modules from, skipping embedded extraction
    #[serde(default)]
    pub dir: Option<PathBuf>,

    /// Where embedded payloads are materialized (defaults to the OS temp dir)
    #[serde(default)]
    pub extraction_root: Option<PathBuf>,
}

/// Session defaults.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SessionConfig {
    /// Engine options applied to every newly allocated session
    #[serde(default)]
    pub options: HashMap<String, String>,
}
