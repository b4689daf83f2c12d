//! Configuration types for the serial bridge
//!
//! [`StaticConfig`] holds listener, serial, memory, update and discovery
//! settings. It is loaded once at startup from a TOML file and is
//! read-only afterwards.

mod paths;
mod static_config;

pub use paths::{default_config_path, default_data_dir, resolve_config_path};
pub use static_config::{
    DiscoveryConfig, MemoryMode, SerialConfig, ServerConfig, StaticConfig, UpdateConfig,
    DEFAULT_PORT_HIGH, DEFAULT_PORT_LOW,
};
