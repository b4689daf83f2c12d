//! Runtime configuration
//!
//! Loads the static TOML configuration (writing defaults on first run),
//! applies command-line overrides, and prepares the data directory.

use std::path::{Path, PathBuf};

use serialbridge_core::{BridgeError, MemoryMode, Result, StaticConfig};
use tokio::fs;
use tracing::{debug, info};

/// Values given on the command line, taking precedence over the file
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub bind: Option<String>,
    pub regex: Option<String>,
    pub memory: Option<MemoryMode>,
    pub hostname: Option<String>,
    pub update_url: Option<String>,
    pub app_name: Option<String>,
    /// Comma-separated list of extra origins
    pub origins: Option<String>,
}

/// Configuration as used by the running daemon
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    static_config: StaticConfig,
    path: PathBuf,
}

impl RuntimeConfig {
    /// Load configuration from `config_path`, creating it with defaults if
    /// missing, and make sure the data directory is usable.
    pub async fn load(config_path: &Path) -> Result<Self> {
        info!("Loading configuration from: {}", config_path.display());
        let static_config = Self::load_static_config(config_path).await?;
        Ok(Self {
            static_config,
            path: config_path.to_path_buf(),
        })
    }

    /// Wrap an already-built configuration
    pub fn from_static(static_config: StaticConfig) -> Self {
        Self {
            static_config,
            path: PathBuf::new(),
        }
    }

    async fn load_static_config(path: &Path) -> Result<StaticConfig> {
        if !path.exists() {
            info!(
                "Static config not found at {}. Creating with defaults.",
                path.display()
            );

            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).await.map_err(|e| {
                    BridgeError::Config(format!(
                        "Failed to create config directory '{}': {}",
                        parent.display(),
                        e
                    ))
                })?;
            }

            let config = StaticConfig::default();
            let toml_str = config
                .to_toml()
                .map_err(|e| BridgeError::Config(format!("Failed to serialize config: {}", e)))?;
            fs::write(path, &toml_str)
                .await
                .map_err(|e| BridgeError::Config(format!("Failed to write config file: {}", e)))?;

            return Ok(config);
        }

        let content = fs::read_to_string(path)
            .await
            .map_err(|e| BridgeError::Config(format!("Failed to read config file: {}", e)))?;

        StaticConfig::from_toml(&content)
            .map_err(|e| BridgeError::Config(format!("Failed to parse config file: {}", e)))
    }

    /// Apply command-line overrides
    pub fn apply(&mut self, overrides: ConfigOverrides) {
        let config = &mut self.static_config;
        if let Some(bind) = overrides.bind {
            config.server.bind = bind;
        }
        if let Some(regex) = overrides.regex {
            config.serial.filter = regex;
        }
        if let Some(memory) = overrides.memory {
            config.memory = memory;
        }
        if let Some(hostname) = overrides.hostname.filter(|h| !h.trim().is_empty()) {
            config.hostname = Some(hostname);
        }
        if let Some(url) = overrides.update_url {
            config.update.url = url;
        }
        if let Some(app_name) = overrides.app_name {
            config.update.app_name = app_name;
        }
        if let Some(origins) = overrides.origins {
            config.server.origins.extend(
                origins
                    .split(',')
                    .map(str::trim)
                    .filter(|o| !o.is_empty())
                    .map(str::to_string),
            );
        }
        debug!("Configuration after overrides: {:?}", config);
    }

    /// Create the data and upload directories and check they are writable
    pub async fn ensure_dirs(&self) -> Result<()> {
        let data_dir = &self.static_config.data_dir;
        for dir in [data_dir.clone(), self.static_config.upload_dir()] {
            if !dir.exists() {
                info!("Creating directory: {}", dir.display());
                fs::create_dir_all(&dir).await.map_err(|e| {
                    BridgeError::Config(format!(
                        "Failed to create directory '{}': {}. \
                         Please create it manually or check permissions.",
                        dir.display(),
                        e
                    ))
                })?;
            }
        }

        let test_file = data_dir.join(".write_test");
        fs::write(&test_file, "test").await.map_err(|e| {
            BridgeError::Config(format!(
                "Data directory '{}' is not writable: {}",
                data_dir.display(),
                e
            ))
        })?;
        let _ = fs::remove_file(&test_file).await;
        Ok(())
    }

    pub fn static_config(&self) -> &StaticConfig {
        &self.static_config
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Hostname reported to clients: the override, else the OS hostname
    pub fn hostname(&self) -> String {
        self.static_config.hostname.clone().unwrap_or_else(|| {
            hostname::get()
                .ok()
                .and_then(|h| h.into_string().ok())
                .unwrap_or_else(|| "unknown-hostname".to_string())
        })
    }

    /// Whether the update scheduler should run
    pub fn updates_enabled(&self) -> bool {
        self.static_config.update.enabled && !self.static_config.update.url.trim().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_load_creates_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("nested").join("config.toml");

        let config = RuntimeConfig::load(&config_path).await.unwrap();
        assert!(config_path.exists());
        assert_eq!(config.static_config().server.port_low, 8990);
        assert!(!config.updates_enabled());
    }

    #[tokio::test]
    async fn test_load_existing_file() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.toml");
        let mut original = StaticConfig::with_data_dir(temp_dir.path().join("data"));
        original.serial.filter = "ttyUSB".to_string();
        std::fs::write(&config_path, original.to_toml().unwrap()).unwrap();

        let config = RuntimeConfig::load(&config_path).await.unwrap();
        assert_eq!(config.static_config().serial.filter, "ttyUSB");
        assert_eq!(config.path(), config_path.as_path());
    }

    #[tokio::test]
    async fn test_load_invalid_file_is_config_error() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.toml");
        std::fs::write(&config_path, "memory = 12").unwrap();

        let err = tokio_test::assert_err!(RuntimeConfig::load(&config_path).await);
        assert!(matches!(err, BridgeError::Config(_)));
    }

    #[test]
    fn test_overrides_take_precedence() {
        let mut config = RuntimeConfig::from_static(StaticConfig::default());
        config.apply(ConfigOverrides {
            regex: Some("ttyACM".to_string()),
            memory: Some(MemoryMode::Aggressive),
            hostname: Some("bench".to_string()),
            update_url: Some("https://downloads.example.com".to_string()),
            origins: Some("https://a.example, ,https://b.example".to_string()),
            ..Default::default()
        });

        let s = config.static_config();
        assert_eq!(s.serial.filter, "ttyACM");
        assert_eq!(s.memory, MemoryMode::Aggressive);
        assert_eq!(config.hostname(), "bench");
        assert!(config.updates_enabled());
        assert_eq!(s.server.origins, vec!["https://a.example", "https://b.example"]);
    }

    #[test]
    fn test_blank_hostname_falls_back_to_os() {
        let mut config = RuntimeConfig::from_static(StaticConfig::default());
        config.apply(ConfigOverrides {
            hostname: Some("  ".to_string()),
            ..Default::default()
        });
        assert!(!config.hostname().is_empty());
        assert!(config.static_config().hostname.is_none());
    }

    #[tokio::test]
    async fn test_ensure_dirs() {
        let temp_dir = TempDir::new().unwrap();
        let config =
            RuntimeConfig::from_static(StaticConfig::with_data_dir(temp_dir.path().join("data")));
        tokio_test::assert_ok!(config.ensure_dirs().await);
        assert!(temp_dir.path().join("data").join("uploads").is_dir());
    }
}
