//! Serial Bridge Core Library
//!
//! Shared types, protocol envelopes, and configuration for the serial
//! bridge. This crate is used by the hardware and daemon crates.

pub mod api;
pub mod config;
pub mod error;
pub mod port;
pub mod protocol;

// Re-export commonly used types
pub use config::{
    default_config_path, default_data_dir, resolve_config_path, MemoryMode, StaticConfig,
    DEFAULT_PORT_HIGH, DEFAULT_PORT_LOW,
};
pub use error::*;
pub use port::{PortListing, SerialPortDescriptor, UsbIdentity};
pub use protocol::{Command, Envelope, EnvelopeKind};
