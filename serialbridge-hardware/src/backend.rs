//! Serial backend for low-level hardware access
//!
//! Provides port enumeration and async port handles for the serial hub.

use serialbridge_core::{BridgeError, Result, UsbIdentity};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_serial::SerialPortBuilderExt;
use tracing::{debug, error};

/// An open, bidirectional serial handle
pub trait SerialIo: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + 'static> SerialIo for T {}

/// A port as reported by the operating system, before filtering
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnumeratedPort {
    pub name: String,
    pub usb: Option<UsbIdentity>,
}

impl EnumeratedPort {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            usb: None,
        }
    }
}

/// Trait for serial backend abstraction
///
/// This trait enables testing of the serial hub without real hardware
/// by allowing mock implementations.
pub trait SerialBackend: Send + Sync {
    /// Enumerate serial ports present on the host
    fn available_ports(&self) -> Result<Vec<EnumeratedPort>>;

    /// Open a port for exclusive use
    ///
    /// Fails with [`BridgeError::DeviceUnavailable`] when the OS refuses.
    fn open(&self, path: &str, baud: u32) -> Result<Box<dyn SerialIo>>;
}

/// Serial backend talking to real hardware through `tokio-serial`
#[derive(Debug, Clone)]
pub struct TokioSerialBackend {
    timeout: Duration,
}

impl TokioSerialBackend {
    /// Create a backend
    ///
    /// # Arguments
    /// * `timeout_ms` - Timeout in milliseconds applied to the port
    pub fn new(timeout_ms: u64) -> Self {
        Self {
            timeout: Duration::from_millis(timeout_ms),
        }
    }
}

impl Default for TokioSerialBackend {
    fn default() -> Self {
        Self::new(1000)
    }
}

impl SerialBackend for TokioSerialBackend {
    fn available_ports(&self) -> Result<Vec<EnumeratedPort>> {
        let ports = tokio_serial::available_ports().map_err(|e| {
            error!("Failed to enumerate serial ports: {}", e);
            BridgeError::Serial(format!("Failed to enumerate ports: {}", e))
        })?;

        Ok(ports
            .into_iter()
            .map(|port| {
                let usb = match port.port_type {
                    tokio_serial::SerialPortType::UsbPort(info) => Some(UsbIdentity {
                        vid: info.vid,
                        pid: info.pid,
                        serial_number: info.serial_number,
                        manufacturer: info.manufacturer,
                        product: info.product,
                    }),
                    _ => None,
                };
                EnumeratedPort {
                    name: port.port_name,
                    usb,
                }
            })
            .collect())
    }

    fn open(&self, path: &str, baud: u32) -> Result<Box<dyn SerialIo>> {
        debug!("Opening serial port: {} @ {}", path, baud);

        let port = tokio_serial::new(path, baud)
            .timeout(self.timeout)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()
            .map_err(|e| {
                error!("Failed to open serial port {}: {}", path, e);
                BridgeError::DeviceUnavailable {
                    port: path.to_string(),
                    reason: e.to_string(),
                }
            })?;

        debug!("Serial port opened successfully");
        Ok(Box::new(port))
    }
}

/// Classify a raw I/O error from a serial handle
pub fn is_disconnect_io(err: &std::io::Error) -> bool {
    use std::io::ErrorKind;

    match err.kind() {
        ErrorKind::BrokenPipe
        | ErrorKind::NotConnected
        | ErrorKind::UnexpectedEof
        | ErrorKind::ConnectionReset
        | ErrorKind::ConnectionAborted => true,
        // Timeouts are typically transient, not disconnection
        ErrorKind::TimedOut | ErrorKind::WouldBlock | ErrorKind::Interrupted => false,
        _ => disconnect_message(&err.to_string()),
    }
}

fn disconnect_message(msg: &str) -> bool {
    let msg_lower = msg.to_lowercase();
    msg_lower.contains("broken pipe")
        || msg_lower.contains("no such device")
        || msg_lower.contains("device disconnected")
        || msg_lower.contains("device not configured")
        || msg_lower.contains("input/output error")
}
