//! Configuration
//!
//! Tunables for the bridge and the transfer engine, with JSON persistence.
//! Config location: ~/.cloudbridge on macOS/Linux/Android, %APPDATA%\CloudBridge on Windows

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

/// Default per-call timeout for bridge requests
const DEFAULT_CALL_TIMEOUT_MS: u64 = 30_000;
/// Default wait for the worker's ready handshake
const DEFAULT_READY_TIMEOUT_MS: u64 = 15_000;
/// Concurrent file streams in a directory transfer
const DEFAULT_MAX_CONCURRENT_FILES: usize = 10;
/// Plaintext bytes per storage chunk
pub const DEFAULT_CHUNK_SIZE: usize = 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to determine config directory")]
    NoConfigDir,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Get the configuration directory
pub fn config_dir() -> Result<PathBuf, ConfigError> {
    #[cfg(windows)]
    {
        if let Some(app_data) = dirs::config_dir() {
            return Ok(app_data.join("CloudBridge"));
        }
        dirs::home_dir()
            .map(|home| home.join(".cloudbridge"))
            .ok_or(ConfigError::NoConfigDir)
    }

    #[cfg(not(windows))]
    {
        dirs::home_dir()
            .map(|home| home.join(".cloudbridge"))
            .ok_or(ConfigError::NoConfigDir)
    }
}

/// Root of the temporary transfer areas (`<cache>/cloudbridge`).
pub fn cache_root() -> Result<PathBuf, ConfigError> {
    dirs::cache_dir()
        .map(|dir| dir.join("cloudbridge"))
        .or_else(|| config_dir().ok().map(|dir| dir.join("cache")))
        .ok_or(ConfigError::NoConfigDir)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct BridgeConfig {
    pub call_timeout_ms: u64,
    pub ready_timeout_ms: u64,
    /// Buffered worker events per subscriber before lagging ones drop
    pub event_capacity: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            call_timeout_ms: DEFAULT_CALL_TIMEOUT_MS,
            ready_timeout_ms: DEFAULT_READY_TIMEOUT_MS,
            event_capacity: 256,
        }
    }
}

impl BridgeConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    pub fn ready_timeout(&self) -> Duration {
        Duration::from_millis(self.ready_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TransferConfig {
    pub max_concurrent_files: usize,
    pub chunk_size: usize,
    /// Override for the temporary downloads area
    pub temp_downloads_dir: Option<PathBuf>,
    /// Override for the temporary uploads area
    pub temp_uploads_dir: Option<PathBuf>,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            max_concurrent_files: DEFAULT_MAX_CONCURRENT_FILES,
            chunk_size: DEFAULT_CHUNK_SIZE,
            temp_downloads_dir: None,
            temp_uploads_dir: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    pub bridge: BridgeConfig,
    pub transfer: TransferConfig,
}

impl CoreConfig {
    /// Default config file path
    pub fn default_path() -> Result<PathBuf, ConfigError> {
        Ok(config_dir()?.join("core.json"))
    }

    /// Load from disk. A missing file yields defaults; a corrupt file is
    /// reported so the caller can decide whether to overwrite it.
    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        match fs::read_to_string(path).await {
            Ok(contents) => {
                let config: CoreConfig = serde_json::from_str(&contents)?;
                info!("Loaded core config from {:?}", path);
                Ok(config)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!("Core config not found at {:?}, using defaults", path);
                Ok(Self::default())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Write atomically (temp file + rename).
    pub async fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_string_pretty(self)?;
        let temp_path = path.with_extension("json.tmp");
        let mut file = fs::File::create(&temp_path).await?;
        file.write_all(json.as_bytes()).await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(&temp_path, path).await?;
        Ok(())
    }
}
