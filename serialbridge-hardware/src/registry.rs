//! Serial port enumeration with pattern filtering

use std::sync::Arc;

use regex::{Regex, RegexBuilder};
use serialbridge_core::{BridgeError, Result, SerialPortDescriptor};
use tracing::{debug, warn};

use crate::backend::SerialBackend;

/// Case-insensitive regular expression over port names
#[derive(Debug, Clone)]
pub struct PortFilter {
    regex: Regex,
}

impl PortFilter {
    /// Compile a filter. An empty pattern matches every port.
    pub fn new(pattern: &str) -> Result<Self> {
        let regex = RegexBuilder::new(pattern)
            .case_insensitive(true)
            .build()
            .map_err(|e| BridgeError::Config(format!("Invalid port filter '{}': {}", pattern, e)))?;
        Ok(Self { regex })
    }

    pub fn is_match(&self, name: &str) -> bool {
        self.regex.is_match(name)
    }

    pub fn pattern(&self) -> &str {
        self.regex.as_str()
    }
}

/// Enumerates candidate serial devices
///
/// Both calls walk the OS device tree and block; async callers run them on
/// the blocking pool.
pub struct SerialPortRegistry {
    backend: Arc<dyn SerialBackend>,
    filter: PortFilter,
}

impl SerialPortRegistry {
    pub fn new(backend: Arc<dyn SerialBackend>, filter: PortFilter) -> Self {
        Self { backend, filter }
    }

    /// Enumerate every port, flagging the ones matching `filter`
    /// (the configured filter when `None`)
    pub fn enumerate(&self, filter: Option<&PortFilter>) -> Result<Vec<SerialPortDescriptor>> {
        let filter = filter.unwrap_or(&self.filter);
        let descriptors: Vec<SerialPortDescriptor> = self
            .backend
            .available_ports()?
            .into_iter()
            .map(|port| SerialPortDescriptor {
                matches_filter: filter.is_match(&port.name),
                name: port.name,
                usb: port.usb,
            })
            .collect();

        debug!(
            "Enumerated {} serial port(s), {} matching '{}'",
            descriptors.len(),
            descriptors.iter().filter(|d| d.matches_filter).count(),
            filter.pattern()
        );
        Ok(descriptors)
    }

    /// Ports matching the filter. Enumeration failures yield an empty list.
    pub fn list(&self, filter: Option<&PortFilter>) -> Vec<SerialPortDescriptor> {
        match self.enumerate(filter) {
            Ok(descriptors) => descriptors
                .into_iter()
                .filter(|d| d.matches_filter)
                .collect(),
            Err(e) => {
                warn!("Serial port enumeration failed: {}", e);
                Vec::new()
            }
        }
    }
}
