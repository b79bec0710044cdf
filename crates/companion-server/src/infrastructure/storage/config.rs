//! TOML-based configuration persistence for the companion server.
//!
//! Reads and writes `AppConfig` to the platform-appropriate config file:
//! - Windows:  `%APPDATA%\CompanionServer\config.toml`
//! - Linux:    `~/.config/companion-server/config.toml`
//! - macOS:    `~/Library/Application Support/CompanionServer/config.toml`
//!
//! Example:
//!
//! ```toml
//! [server]
//! port = 34567
//! tick_interval_ms = 16
//!
//! [permissions]
//! granted = ["ReadSongs", "WriteMicrophone"]
//!
//! [[modifiers]]
//! id = "double-speed"
//! displayName = "Double speed"
//!
//! [[mic_profiles]]
//! name = "Pixel 8"
//! color = "#4080FF"
//! connected_client_id = "b3c9"
//! ```
//!
//! Every field has a `#[serde(default = ...)]` fallback, so a missing file or
//! an older file with fewer fields still loads.

use std::net::IpAddr;
use std::path::{Path, PathBuf};

use companion_core::{MicProfile, ModifierDescriptor, Permission};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error type for configuration file operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The platform config directory could not be determined.
    #[error("could not determine platform config directory")]
    NoPlatformConfigDir,

    /// A file system I/O error occurred.
    #[error("I/O error accessing config at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The TOML content could not be parsed.
    #[error("failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),

    /// The config could not be serialized to TOML.
    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
}

// ── Config schema types ───────────────────────────────────────────────────────

/// Top-level configuration stored on disk.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub permissions: PermissionsConfig,
    /// Game modifiers advertised in every `ConnectResponse`.
    #[serde(default)]
    pub modifiers: Vec<ModifierDescriptor>,
    /// Mic profiles loaded into the profile store at startup.
    #[serde(default)]
    pub mic_profiles: Vec<MicProfile>,
}

/// Listener and poll-loop settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerConfig {
    /// TCP and UDP port the server binds.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Interval between two `tick()` calls.
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    /// `tracing` log level: `"error"`, `"warn"`, `"info"`, `"debug"`, `"trace"`.
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// IP address to bind both sockets to.  `"0.0.0.0"` binds all interfaces.
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
}

/// Permissions granted to every companion client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PermissionsConfig {
    #[serde(default = "default_granted")]
    pub granted: Vec<Permission>,
}

// ── Default helpers ───────────────────────────────────────────────────────────

/// Port used when neither the config file nor the command line names one.
pub const DEFAULT_PORT: u16 = 34567;

fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_tick_interval_ms() -> u64 {
    16
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}
fn default_granted() -> Vec<Permission> {
    Permission::ALL.to_vec()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            tick_interval_ms: default_tick_interval_ms(),
            log_level: default_log_level(),
            bind_address: default_bind_address(),
        }
    }
}

impl Default for PermissionsConfig {
    fn default() -> Self {
        Self {
            granted: default_granted(),
        }
    }
}

impl ServerConfig {
    /// Parses `bind_address`.
    ///
    /// # Errors
    ///
    /// Returns the parse error if the address is not a valid IP address.
    pub fn bind_ip(&self) -> Result<IpAddr, std::net::AddrParseError> {
        self.bind_address.parse()
    }
}

// ── Config repository ─────────────────────────────────────────────────────────

/// Determines the platform-appropriate directory for the config file.
///
/// # Errors
///
/// Returns [`ConfigError::NoPlatformConfigDir`] when the platform config base
/// directory cannot be determined from the environment.
pub fn config_dir() -> Result<PathBuf, ConfigError> {
    platform_config_dir().ok_or(ConfigError::NoPlatformConfigDir)
}

/// Resolves the full path to the default config file.
///
/// # Errors
///
/// Returns [`ConfigError::NoPlatformConfigDir`] if the base directory cannot be
/// determined.
pub fn config_file_path() -> Result<PathBuf, ConfigError> {
    Ok(config_dir()?.join("config.toml"))
}

/// Loads `AppConfig` from the default location.  See [`load_config_from`].
///
/// # Errors
///
/// Same as [`load_config_from`], plus [`ConfigError::NoPlatformConfigDir`].
pub fn load_config() -> Result<AppConfig, ConfigError> {
    load_config_from(&config_file_path()?)
}

/// Loads `AppConfig` from `path`, returning `AppConfig::default()` if the
/// file does not exist yet.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] for file-system errors other than "not found",
/// and [`ConfigError::Parse`] if the TOML is malformed.
pub fn load_config_from(path: &Path) -> Result<AppConfig, ConfigError> {
    match std::fs::read_to_string(path) {
        Ok(content) => Ok(toml::from_str(&content)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(AppConfig::default()),
        Err(source) => Err(ConfigError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// Persists `config` to the default location.  See [`save_config_to`].
///
/// # Errors
///
/// Same as [`save_config_to`], plus [`ConfigError::NoPlatformConfigDir`].
pub fn save_config(config: &AppConfig) -> Result<(), ConfigError> {
    save_config_to(config, &config_file_path()?)
}

/// Persists `config` to `path`, creating the parent directory if needed.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] for file-system failures or
/// [`ConfigError::Serialize`] if serialization fails.
pub fn save_config_to(config: &AppConfig, path: &Path) -> Result<(), ConfigError> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).map_err(|source| ConfigError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
    }

    let content = toml::to_string_pretty(config)?;
    std::fs::write(path, content).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// Resolves the platform config directory for this application.
fn platform_config_dir() -> Option<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        std::env::var_os("APPDATA").map(|p| PathBuf::from(p).join("CompanionServer"))
    }

    #[cfg(target_os = "linux")]
    {
        // XDG_CONFIG_HOME or ~/.config
        let base = std::env::var_os("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".config")))?;
        Some(base.join("companion-server"))
    }

    #[cfg(target_os = "macos")]
    {
        std::env::var_os("HOME").map(|h| {
            PathBuf::from(h)
                .join("Library")
                .join("Application Support")
                .join("CompanionServer")
        })
    }

    #[cfg(not(any(target_os = "windows", target_os = "linux", target_os = "macos")))]
    {
        None
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
