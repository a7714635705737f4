//! Configuration management for Pouchmail

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Error, Result};

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// General settings
    #[serde(default)]
    pub general: GeneralConfig,

    /// Record cache settings
    #[serde(default)]
    pub cache: CacheConfig,

    /// Transfer settings
    #[serde(default)]
    pub transfer: TransferConfig,

    /// Auth settings
    #[serde(default)]
    pub auth: AuthConfig,
}

/// General application settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Log level (debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Data directory path
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            data_dir: default_data_dir(),
        }
    }
}

/// Which persistence backend the record cache uses.
///
/// Selection is explicit: there is no runtime probing with silent fallback,
/// so a misconfigured backend fails loudly instead of degrading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Single bincode-framed file holding the whole key space (fast)
    Binary,
    /// One JSON file per key (durable, inspectable)
    KeyValue,
}

impl Default for BackendKind {
    fn default() -> Self {
        Self::Binary
    }
}

/// Record cache settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Persistence backend
    #[serde(default)]
    pub backend: BackendKind,

    /// Entries older than this are treated as absent by readers
    #[serde(default = "default_ttl_hours")]
    pub ttl_hours: u64,

    /// Key prefix separating this cache from other users of the backend
    #[serde(default = "default_namespace")]
    pub namespace: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::default(),
            ttl_hours: default_ttl_hours(),
            namespace: default_namespace(),
        }
    }
}

/// Transfer settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferConfig {
    /// Minimum percent delta between progress callbacks
    #[serde(default = "default_progress_step")]
    pub progress_step_percent: u8,

    /// Override for the user-visible downloads directory
    #[serde(skip_serializing_if = "Option::is_none")]
    pub downloads_dir: Option<PathBuf>,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            progress_step_percent: default_progress_step(),
            downloads_dir: None,
        }
    }
}

/// Auth settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Override for the stored-token directory
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tokens_dir: Option<PathBuf>,
}

// Default value functions
fn default_log_level() -> String {
    "info".to_string()
}

fn default_data_dir() -> PathBuf {
    get_data_dir()
}

fn default_ttl_hours() -> u64 {
    12
}

fn default_namespace() -> String {
    crate::APP_NAME.to_string()
}

fn default_progress_step() -> u8 {
    5
}

/// Get the data directory (XDG: ~/.local/share/pouchmail)
fn get_data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".local")
        .join("share")
        .join(crate::APP_NAME)
}

/// Get the config directory (XDG: ~/.config/pouchmail)
fn get_config_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join(crate::APP_NAME)
}

impl Config {
    /// Load configuration from the default path
    pub fn load() -> Result<Self> {
        let config_path = get_config_dir().join("config.toml");
        Self::load_from(&config_path)
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &PathBuf) -> Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path)?;
            let config: Config = toml::from_str(&contents)?;
            info!("Loaded configuration from {:?}", path);
            Ok(config)
        } else {
            info!("No config file found at {:?}, using defaults", path);
            Ok(Config::default())
        }
    }

    /// Save configuration to the default path
    pub fn save(&self) -> Result<()> {
        let config_path = get_config_dir().join("config.toml");
        self.save_to(&config_path)
    }

    /// Save configuration to a specific path
    pub fn save_to(&self, path: &PathBuf) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))?;
        std::fs::write(path, contents)?;
        info!("Saved configuration to {:?}", path);
        Ok(())
    }

    /// Get the cache directory
    pub fn cache_dir(&self) -> PathBuf {
        self.general.data_dir.join("cache")
    }

    /// Get the app-sandboxed file directory
    pub fn private_dir(&self) -> PathBuf {
        self.general.data_dir.join("files")
    }

    /// Get the stored-token directory
    pub fn tokens_dir(&self) -> PathBuf {
        self.auth
            .tokens_dir
            .clone()
            .unwrap_or_else(|| get_config_dir().join("tokens"))
    }

    /// Get the user-visible downloads directory
    pub fn downloads_dir(&self) -> PathBuf {
        self.transfer
            .downloads_dir
            .clone()
            .or_else(dirs::download_dir)
            .unwrap_or_else(|| self.general.data_dir.join("downloads"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.general.log_level, "info");
        assert_eq!(config.cache.ttl_hours, 12);
        assert_eq!(config.cache.backend, BackendKind::Binary);
        assert_eq!(config.transfer.progress_step_percent, 5);
    }

    #[test]
    fn test_backend_kind_from_toml() {
        let config: Config = toml::from_str("[cache]\nbackend = \"key_value\"\n").unwrap();
        assert_eq!(config.cache.backend, BackendKind::KeyValue);
    }
}
