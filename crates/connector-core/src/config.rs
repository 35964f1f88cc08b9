//! Configuration resolution for the mount connector.
//!
//! Implements hierarchical config resolution:
//! 1. Built-in defaults
//! 2. Settings file (`/etc/mount-connector/settings.json` or `--config`)
//! 3. Environment variables
//! 4. CLI arguments (highest priority, applied by the binary)

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};

/// Settings file looked up when no explicit path is given.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/mount-connector/settings.json";

/// Complete connector configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub daemon: DaemonConfig,
    pub helpers: HelperConfig,
    pub session: SessionConfig,
}

/// Socket server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub socket_path: PathBuf,
    /// Lifetime of a connection, counted from accept.
    pub idle_timeout_secs: u64,
    /// Longest accepted request line, newline excluded.
    pub max_line_bytes: usize,
    pub log_level: String,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from("/var/lib/mount-connector/connector.sock"),
            idle_timeout_secs: 30,
            max_line_bytes: 64 * 1024,
            log_level: "info".to_string(),
        }
    }
}

impl DaemonConfig {
    pub const fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

/// External mount helpers and the directories handed to them.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HelperConfig {
    /// User-space filesystem client.
    pub filesystem_client: PathBuf,
    /// Cloud-storage sync tool.
    pub sync_tool: PathBuf,
    /// Only checked at startup; the daemon never runs it itself.
    pub unmount_helper: PathBuf,
    /// First component of the user-agent string.
    pub user_agent_product: String,
    pub config_dir: Option<PathBuf>,
    pub cache_dir: Option<PathBuf>,
    pub log_dir: Option<PathBuf>,
}

impl Default for HelperConfig {
    fn default() -> Self {
        Self {
            filesystem_client: PathBuf::from("kodofs"),
            sync_tool: PathBuf::from("rclone"),
            unmount_helper: PathBuf::from("fusermount"),
            user_agent_product: "MountConnector".to_string(),
            config_dir: None,
            cache_dir: None,
            log_dir: None,
        }
    }
}

impl HelperConfig {
    /// Directory for temporary sync-tool config files.
    pub fn config_dir(&self) -> PathBuf {
        self.config_dir
            .clone()
            .unwrap_or_else(|| helper_home().join("config"))
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.cache_dir
            .clone()
            .unwrap_or_else(|| helper_home().join("cache"))
    }

    pub fn log_dir(&self) -> PathBuf {
        self.log_dir
            .clone()
            .unwrap_or_else(|| helper_home().join("log"))
    }
}

/// Per-connection process session tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Size of each stdout/stderr read.
    pub read_buffer_bytes: usize,
    /// How long to wait for output relays after the helper exits.
    pub drain_timeout_ms: u64,
    /// Grace period between SIGTERM and SIGKILL on cancellation.
    pub terminate_timeout_secs: u64,
    /// Capacity of the inbound and outbound command channels.
    pub channel_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            read_buffer_bytes: 4096,
            drain_timeout_ms: 2000,
            terminate_timeout_secs: 5,
            channel_capacity: 32,
        }
    }
}

impl SessionConfig {
    pub const fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    pub const fn terminate_timeout(&self) -> Duration {
        Duration::from_secs(self.terminate_timeout_secs)
    }
}

/// Base directory for helper state: `~/.rclone`, or the temp dir without a home.
fn helper_home() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(".rclone")
}

/// Load configuration with hierarchical resolution.
///
/// An explicitly requested file must exist; the default file is optional.
pub fn load_config(path: Option<&Path>) -> Result<Config> {
    let mut config = match path {
        Some(path) => load_config_file(path)?,
        None => {
            let default_path = Path::new(DEFAULT_CONFIG_PATH);
            if default_path.exists() {
                load_config_file(default_path)?
            } else {
                Config::default()
            }
        }
    };

    apply_overrides(&mut config, |key| std::env::var(key).ok());

    Ok(config)
}

fn load_config_file(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;
    serde_json::from_str(&content).map_err(|e| {
        Error::Config(format!("Failed to parse config file {}: {}", path.display(), e))
    })
}

/// Apply `MOUNT_CONNECTOR_*` overrides looked up through `lookup`.
pub fn apply_overrides(config: &mut Config, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(val) = lookup("MOUNT_CONNECTOR_SOCKET_PATH") {
        config.daemon.socket_path = PathBuf::from(val);
    }
    if let Some(val) = lookup("MOUNT_CONNECTOR_IDLE_TIMEOUT") {
        if let Ok(n) = val.parse() {
            config.daemon.idle_timeout_secs = n;
        }
    }
    if let Some(val) = lookup("MOUNT_CONNECTOR_LOG_LEVEL") {
        config.daemon.log_level = val;
    }
    if let Some(val) = lookup("MOUNT_CONNECTOR_FS_CLIENT") {
        config.helpers.filesystem_client = PathBuf::from(val);
    }
    if let Some(val) = lookup("MOUNT_CONNECTOR_SYNC_TOOL") {
        config.helpers.sync_tool = PathBuf::from(val);
    }
}
