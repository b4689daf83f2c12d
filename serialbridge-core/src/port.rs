//! Serial port descriptors

use serde::{Deserialize, Serialize};

/// USB identity of a serial device, when the OS reports one
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsbIdentity {
    pub vid: u16,
    pub pid: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serial_number: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manufacturer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub product: Option<String>,
}

/// Snapshot of one enumerated serial device
///
/// Descriptors are produced by enumeration and never mutated; a fresh
/// enumeration produces fresh descriptors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerialPortDescriptor {
    /// OS path or identifier (e.g. `/dev/ttyACM0`, `COM3`)
    pub name: String,
    /// Whether the name matched the configured filter at enumeration time
    pub matches_filter: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usb: Option<UsbIdentity>,
}

impl SerialPortDescriptor {
    /// Create a descriptor without USB information
    pub fn new(name: impl Into<String>, matches_filter: bool) -> Self {
        Self {
            name: name.into(),
            matches_filter,
            usb: None,
        }
    }
}

/// A descriptor together with the bridge's view of it, as sent to clients
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortListing {
    #[serde(flatten)]
    pub descriptor: SerialPortDescriptor,
    /// Whether the bridge holds an open connection on this port
    pub is_open: bool,
    /// Baud rate of the open connection
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub baud: Option<u32>,
}
