//! Error types for the serial bridge

use thiserror::Error;

/// Core error type for bridge operations
#[derive(Error, Debug)]
pub enum BridgeError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// The OS refused to open the serial device
    #[error("Device unavailable: {port}: {reason}")]
    DeviceUnavailable { port: String, reason: String },

    /// A connection for this port already exists (or is being opened)
    #[error("Port already open: {0}")]
    AlreadyOpen(String),

    /// No connection exists for this port
    #[error("Port not open: {0}")]
    NotOpen(String),

    /// Writing to the hardware failed
    #[error("Write failed on {port}: {reason}")]
    WriteFailed { port: String, reason: String },

    /// Device disconnected (USB unplugged, power cycle)
    #[error("Device disconnected: {0}")]
    DeviceDisconnected(String),

    /// Serial port enumeration or configuration errors
    #[error("Serial port error: {0}")]
    Serial(String),

    /// A listener could not bind to a port
    #[error("Failed to bind port {port}: {reason}")]
    BindFailed { port: u16, reason: String },

    /// Querying the update source failed
    #[error("Update check failed: {0}")]
    UpdateCheckFailed(String),

    /// Downloading, verifying, or staging an update failed
    #[error("Update apply failed: {0}")]
    UpdateApplyFailed(String),

    /// A client's outbound queue overflowed and the client was dropped
    #[error("Client queue overflow: {0}")]
    ClientQueueOverflow(String),

    /// The hub no longer accepts sessions
    #[error("Hub is shutting down")]
    ShuttingDown,

    /// A client command could not be parsed
    #[error("Invalid command: {0}")]
    InvalidCommand(String),

    /// Invalid input or arguments
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Result type alias for bridge operations
pub type Result<T> = std::result::Result<T, BridgeError>;

impl From<serde_json::Error> for BridgeError {
    fn from(err: serde_json::Error) -> Self {
        BridgeError::Serialization(err.to_string())
    }
}

impl BridgeError {
    /// Port the error refers to, when it refers to one
    pub fn port(&self) -> Option<&str> {
        match self {
            BridgeError::DeviceUnavailable { port, .. } | BridgeError::WriteFailed { port, .. } => {
                Some(port)
            }
            BridgeError::AlreadyOpen(port)
            | BridgeError::NotOpen(port)
            | BridgeError::DeviceDisconnected(port) => Some(port),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serde_json_error_conversion() {
        let json_err = serde_json::from_str::<serde_json::Value>("invalid json").unwrap_err();
        let err: BridgeError = json_err.into();

        match err {
            BridgeError::Serialization(msg) => assert!(!msg.is_empty()),
            _ => panic!("Expected Serialization error"),
        }
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::AddrInUse, "in use");
        let err: BridgeError = io_err.into();

        match err {
            BridgeError::Io(e) => assert_eq!(e.kind(), std::io::ErrorKind::AddrInUse),
            _ => panic!("Expected Io error"),
        }
    }

    #[test]
    fn test_error_display() {
        let err = BridgeError::AlreadyOpen("/dev/ttyACM0".to_string());
        assert_eq!(format!("{}", err), "Port already open: /dev/ttyACM0");

        let err = BridgeError::NotOpen("COM3".to_string());
        assert_eq!(format!("{}", err), "Port not open: COM3");

        let err = BridgeError::BindFailed {
            port: 8990,
            reason: "address in use".to_string(),
        };
        assert_eq!(format!("{}", err), "Failed to bind port 8990: address in use");

        let err = BridgeError::ShuttingDown;
        assert_eq!(format!("{}", err), "Hub is shutting down");
    }

    #[test]
    fn test_error_port() {
        let err = BridgeError::DeviceUnavailable {
            port: "/dev/ttyUSB0".to_string(),
            reason: "busy".to_string(),
        };
        assert_eq!(err.port(), Some("/dev/ttyUSB0"));
        assert_eq!(BridgeError::ShuttingDown.port(), None);
    }
}
