//! Configuration system
//!
//! TOML configuration for the daemon. Every section has defaults, so an
//! empty or partial file is valid.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Errors while loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path:?}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// Main configuration structure
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// General settings
    pub general: GeneralConfig,

    /// Screen power state machine timing
    pub power: PowerConfig,

    /// Vsync coalescing
    pub vsync: VsyncConfig,

    /// Values handed to clients at session connect
    pub session: SessionConfig,

    /// Privileged caller list
    pub permissions: PermissionConfig,
}

impl Config {
    /// Load configuration from file
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let config_path = path.map(Path::to_path_buf).or_else(Self::find_config_file);

        match config_path {
            Some(path) if path.exists() => {
                info!("Loading configuration from {:?}", path);
                let content = fs::read_to_string(&path).map_err(|source| ConfigError::Read {
                    path: path.clone(),
                    source,
                })?;
                Self::from_toml(&content).map_err(|source| ConfigError::Parse { path, source })
            },
            Some(path) => {
                warn!("Config file not found at {:?}, using defaults", path);
                Ok(Self::default())
            },
            None => {
                info!("No config file found, using defaults");
                Ok(Self::default())
            },
        }
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Find the configuration file
    fn find_config_file() -> Option<PathBuf> {
        let candidates = [
            dirs::config_dir().map(|p| p.join("displayd/config.toml")),
            dirs::home_dir().map(|p| p.join(".config/displayd/config.toml")),
            Some(PathBuf::from("/etc/displayd/config.toml")),
        ];

        candidates.into_iter().flatten().find(|p| p.exists())
    }

    /// Generate default configuration as a string
    pub fn default_config_string() -> String {
        toml::to_string_pretty(&Self::default())
            .unwrap_or_else(|_| String::from("# Error generating config"))
    }

    /// Get the socket path
    pub fn socket_path(&self) -> PathBuf {
        if let Some(ref path) = self.general.socket_path {
            PathBuf::from(path)
        } else {
            let runtime_dir =
                std::env::var("XDG_RUNTIME_DIR").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(runtime_dir).join("displayd.sock")
        }
    }
}

/// General settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Socket path for IPC
    pub socket_path: Option<String>,
    /// Name reported by `GetValueById(VERSION)`
    pub service_name: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            socket_path: None,
            service_name: "displayd".to_string(),
        }
    }
}

/// Screen power timing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PowerConfig {
    /// Wait for screen-on readiness before forcing the screen on.
    pub normal_timeout_ms: u64,
    /// Wait for AOD entry before forcing every screen off.
    pub aod_timeout_ms: u64,
    /// Number of screens that must report ready before leaving `SCREEN_INIT`.
    pub init_ref_count: u32,
}

impl Default for PowerConfig {
    fn default() -> Self {
        Self {
            normal_timeout_ms: 1000,
            aod_timeout_ms: 3000,
            init_ref_count: 0,
        }
    }
}

/// Vsync settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VsyncConfig {
    /// Outstanding hardware request is abandoned after this long.
    pub timeout_ms: u64,
    /// Tick rate of the software vsync source.
    pub refresh_rate_hz: u32,
}

impl Default for VsyncConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 600,
            refresh_rate_hz: 60,
        }
    }
}

/// System session configuration returned by `Connect`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub system_decor_enabled: bool,
    pub default_window_mode: u32,
    pub max_floating_window_size: u32,
    pub default_display_id: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            system_decor_enabled: true,
            default_window_mode: 1,
            max_floating_window_size: 1920,
            default_display_id: 0,
        }
    }
}

/// Callers allowed to use privileged scene operations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PermissionConfig {
    pub system_uids: Vec<u32>,
}

impl Default for PermissionConfig {
    fn default() -> Self {
        Self {
            system_uids: vec![0, 1000],
        }
    }
}
