//! Static configuration loaded once at startup
//!
//! This configuration is read-only after the bridge starts.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use super::paths::default_data_dir;

/// Lowest port tried by the listeners (inclusive)
pub const DEFAULT_PORT_LOW: u16 = 8990;
/// Port at which the listeners give up (exclusive)
pub const DEFAULT_PORT_HIGH: u16 = 9000;

/// Network listener configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address both listeners bind to
    pub bind: String,
    /// First port tried (inclusive)
    pub port_low: u16,
    /// End of the port range (exclusive)
    pub port_high: u16,
    /// TLS certificate (PEM). Defaults to `cert.pem` next to the executable.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tls_cert: Option<PathBuf>,
    /// TLS private key (PEM). Defaults to `key.pem` next to the executable.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tls_key: Option<PathBuf>,
    /// Extra origins allowed to reach the bridge from a browser
    pub origins: Vec<String>,
    /// Capacity of each client's outbound queue
    pub client_queue: usize,
    /// Maximum accepted upload body in bytes
    pub upload_limit: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".to_string(),
            port_low: DEFAULT_PORT_LOW,
            port_high: DEFAULT_PORT_HIGH,
            tls_cert: None,
            tls_key: None,
            origins: Vec::new(),
            client_queue: 256,
            upload_limit: 16 * 1024 * 1024,
        }
    }
}

impl ServerConfig {
    /// Resolve certificate and key paths, falling back to `dir`
    pub fn tls_paths(&self, dir: &Path) -> (PathBuf, PathBuf) {
        (
            self.tls_cert
                .clone()
                .unwrap_or_else(|| dir.join("cert.pem")),
            self.tls_key.clone().unwrap_or_else(|| dir.join("key.pem")),
        )
    }
}

/// Serial port configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialConfig {
    /// Regular expression selecting which ports are listed
    pub filter: String,
    /// Baud rate used when a client does not specify one
    pub default_baud: u32,
    /// Capacity of each connection's outbound write queue
    pub write_queue: usize,
    /// Size of the read buffer handed to the hardware read call
    pub read_chunk: usize,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            filter: "usb|acm|com".to_string(),
            default_baud: 9600,
            write_queue: 64,
            read_chunk: 1024,
        }
    }
}

/// Self-update configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdateConfig {
    /// Enable the background update scheduler
    pub enabled: bool,
    /// Base URL of the update source; empty disables updates
    pub url: String,
    /// Application name used to build update URLs
    pub app_name: String,
    /// Seconds between update checks
    pub interval_secs: u64,
    /// Where downloaded builds are staged. Defaults to `<data_dir>/update`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub staging_dir: Option<PathBuf>,
}

impl Default for UpdateConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            url: String::new(),
            app_name: "serialbridge".to_string(),
            interval_secs: 300,
            staging_dir: None,
        }
    }
}

/// LAN discovery configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Announce this instance on the local network
    pub enabled: bool,
    /// UDP port used for announcements
    pub port: u16,
    /// Seconds between announcements
    pub interval_secs: u64,
    /// Record announcements from other instances
    pub listen: bool,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: 8989,
            interval_secs: 10,
            listen: true,
        }
    }
}

/// Memory reclamation mode for serial connection buffers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryMode {
    /// Reclaim only when buffers grow past a high-water mark
    #[default]
    #[serde(alias = "std")]
    Default,
    /// Reclaim around every serial send and receive
    #[serde(alias = "max")]
    Aggressive,
    /// Never reclaim automatically; only on the `gc` command
    #[serde(alias = "off")]
    Disabled,
}

impl MemoryMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryMode::Default => "default",
            MemoryMode::Aggressive => "aggressive",
            MemoryMode::Disabled => "disabled",
        }
    }
}

impl fmt::Display for MemoryMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MemoryMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "default" | "std" => Ok(MemoryMode::Default),
            "aggressive" | "max" => Ok(MemoryMode::Aggressive),
            "disabled" | "off" => Ok(MemoryMode::Disabled),
            other => Err(format!(
                "unknown memory mode '{}' (expected default, aggressive or disabled)",
                other
            )),
        }
    }
}

/// Static configuration for the bridge daemon.
///
/// Located at `~/.config/serialbridge/config.toml` by default.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StaticConfig {
    /// Hostname reported to clients; the OS hostname when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,

    /// Memory reclamation mode
    #[serde(default)]
    pub memory: MemoryMode,

    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub serial: SerialConfig,

    #[serde(default)]
    pub update: UpdateConfig,

    #[serde(default)]
    pub discovery: DiscoveryConfig,

    /// Directory for uploads and staged updates
    ///
    /// Defaults to `~/.local/share/serialbridge` (XDG data directory).
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

impl Default for StaticConfig {
    fn default() -> Self {
        Self {
            hostname: None,
            memory: MemoryMode::default(),
            server: ServerConfig::default(),
            serial: SerialConfig::default(),
            update: UpdateConfig::default(),
            discovery: DiscoveryConfig::default(),
            data_dir: default_data_dir(),
        }
    }
}

impl StaticConfig {
    /// Create a new StaticConfig with a custom data directory.
    pub fn with_data_dir(data_dir: PathBuf) -> Self {
        Self {
            data_dir,
            ..Default::default()
        }
    }

    /// Parse StaticConfig from TOML string.
    pub fn from_toml(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Serialize StaticConfig to TOML string.
    pub fn to_toml(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }

    /// Directory receiving staged update builds
    pub fn staging_dir(&self) -> PathBuf {
        self.update
            .staging_dir
            .clone()
            .unwrap_or_else(|| self.data_dir.join("update"))
    }

    /// Directory receiving uploaded programs
    pub fn upload_dir(&self) -> PathBuf {
        self.data_dir.join("uploads")
    }
}
