//! Where the bridge keeps its files
//!
//! Locations follow the platform's per-user directories (XDG on Linux) and
//! fall back to system paths for service accounts without a home. Either one
//! can be pinned through the environment.

use std::path::PathBuf;

const APP_DIR: &str = "serialbridge";

/// Overrides the configuration file location
const CONFIG_PATH_ENV: &str = "SERIALBRIDGE_CONFIG";

/// Overrides the default data directory
const DATA_DIR_ENV: &str = "SERIALBRIDGE_DATA_DIR";

/// `~/.config/serialbridge/config.toml`, or `/etc/serialbridge/config.toml`
pub fn default_config_path() -> PathBuf {
    app_dir(dirs::config_dir(), "/etc").join("config.toml")
}

/// Data directory for uploads and staged updates
///
/// `$SERIALBRIDGE_DATA_DIR` when set, else `~/.local/share/serialbridge`,
/// else `/var/lib/serialbridge`.
pub fn default_data_dir() -> PathBuf {
    env_path(DATA_DIR_ENV).unwrap_or_else(|| app_dir(dirs::data_dir(), "/var/lib"))
}

/// Configuration file to load: `flag`, then `$SERIALBRIDGE_CONFIG`, then
/// [`default_config_path`]
pub fn resolve_config_path(flag: Option<PathBuf>) -> PathBuf {
    pick_config_path(flag, env_path(CONFIG_PATH_ENV))
}

fn pick_config_path(flag: Option<PathBuf>, from_env: Option<PathBuf>) -> PathBuf {
    flag.or(from_env).unwrap_or_else(default_config_path)
}

fn app_dir(base: Option<PathBuf>, system: &str) -> PathBuf {
    base.unwrap_or_else(|| PathBuf::from(system)).join(APP_DIR)
}

fn env_path(var: &str) -> Option<PathBuf> {
    std::env::var_os(var)
        .filter(|value| !value.is_empty())
        .map(PathBuf::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_app_dir_falls_back_to_system_path() {
        assert_eq!(app_dir(None, "/etc"), PathBuf::from("/etc/serialbridge"));
        assert_eq!(
            app_dir(Some(PathBuf::from("/home/pi/.config")), "/etc"),
            PathBuf::from("/home/pi/.config/serialbridge")
        );
    }

    #[test]
    fn test_default_config_path_is_toml() {
        let path = default_config_path();
        assert!(path.ends_with("serialbridge/config.toml"));
    }

    #[test]
    fn test_config_path_precedence() {
        let flag = PathBuf::from("/tmp/flag.toml");
        let from_env = PathBuf::from("/tmp/env.toml");

        assert_eq!(
            pick_config_path(Some(flag.clone()), Some(from_env.clone())),
            flag
        );
        assert_eq!(pick_config_path(None, Some(from_env.clone())), from_env);
        assert_eq!(pick_config_path(None, None), default_config_path());
    }

    #[test]
    fn test_unset_variable_is_none() {
        assert_eq!(env_path("SERIALBRIDGE_TEST_UNSET_VARIABLE"), None);
    }
}
