//! Layer configuration, loaded from TOML.
//!
//! Every section and key is optional; missing values take the defaults
//! below. The default location is `~/.config/polyfs/config.toml`.
//!
//! ```toml
//! [pool]
//! idle_timeout_ms = 300000
//! reaper_interval_ms = 30000
//!
//! [transfer]
//! chunk_size = 8388608
//! poll_interval_ms = 1000
//! max_poll_attempts = 60
//!
//! [registry]
//! program = "skopeo"
//!
//! [[nfs.mounts]]
//! server = "filer"
//! export = "/exports/home"
//! mount_point = "/mnt/filer-home"
//! version = 4
//! transport = "tcp"
//!
//! [ordering]
//! locale = "de"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::backends::nfs::NfsTransport;
use crate::pool::RetryPolicy;

/// Configuration load failure.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Durations as integer milliseconds.
mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VfsConfig {
    pub pool: PoolConfig,
    pub transfer: TransferConfig,
    pub registry: RegistryConfig,
    pub nfs: NfsConfig,
    pub ordering: OrderingConfig,
    pub ovirt: OvirtConfig,
}

/// `[pool]`: connection pool housekeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Unlocked handles idle this long are closed by the reaper.
    #[serde(rename = "idle_timeout_ms", with = "duration_ms")]
    pub idle_timeout: Duration,
    #[serde(rename = "reaper_interval_ms", with = "duration_ms")]
    pub reaper_interval: Duration,
    /// Key pooled sessions by login as well as realm.
    pub credentials_in_key: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(300),
            reaper_interval: Duration::from_secs(30),
            credentials_in_key: false,
        }
    }
}

/// `[transfer]`: chunked disk transfers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    pub chunk_size: usize,
    #[serde(rename = "poll_interval_ms", with = "duration_ms")]
    pub poll_interval: Duration,
    pub max_poll_attempts: u32,
    pub backoff: f64,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: 8 * 1024 * 1024,
            poll_interval: Duration::from_secs(1),
            max_poll_attempts: 60,
            backoff: 1.0,
        }
    }
}

impl TransferConfig {
    /// Policy for waiting on transfer phase changes.
    pub fn poll_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_poll_attempts, self.poll_interval, self.backoff)
    }
}

/// `[registry]`: container image helper.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Helper program (`skopeo` compatible).
    pub program: String,
    /// Parent directory for per-listing image folders; system temp if unset.
    pub temp_dir: Option<PathBuf>,
    /// Registry sessions depend on the account, so key them by login.
    pub credentials_in_key: bool,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            program: "skopeo".to_string(),
            temp_dir: None,
            credentials_in_key: true,
        }
    }
}

/// `[nfs]`: where exports are mounted locally.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NfsConfig {
    pub mounts: Vec<NfsMount>,
}

/// One `server:/export` → local mount point mapping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NfsMount {
    pub server: String,
    pub export: String,
    pub mount_point: PathBuf,
    /// Protocol version the export is mounted with. Addresses pinning a
    /// different `version` do not match this mount.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u8>,
    /// Transport the export is mounted over, matched like `version`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transport: Option<NfsTransport>,
}

/// `[ordering]`: listing order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrderingConfig {
    /// BCP-47 locale for name collation.
    pub locale: String,
    pub directories_first: bool,
}

impl Default for OrderingConfig {
    fn default() -> Self {
        Self {
            locale: "en".to_string(),
            directories_first: true,
        }
    }
}

/// `[ovirt]`: engine REST client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OvirtConfig {
    #[serde(rename = "request_timeout_ms", with = "duration_ms")]
    pub request_timeout: Duration,
}

impl Default for OvirtConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
        }
    }
}

impl VfsConfig {
    /// `~/.config/polyfs/config.toml`.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("polyfs").join("config.toml"))
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_toml_str(&text)?;
        info!(path = %path.display(), "loaded config");
        Ok(config)
    }

    /// Load `path`, or the default location when `None`. A missing default
    /// file yields the defaults; an explicitly named missing file is an error.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = path {
            return Self::load(path);
        }
        match Self::default_path() {
            Some(path) if path.exists() => Self::load(&path),
            _ => {
                debug!("no config file, using defaults");
                Ok(Self::default())
            }
        }
    }

    /// Pool settings for the registry backend.
    pub fn registry_pool(&self) -> PoolConfig {
        PoolConfig {
            credentials_in_key: self.registry.credentials_in_key,
            ..self.pool.clone()
        }
    }
}
