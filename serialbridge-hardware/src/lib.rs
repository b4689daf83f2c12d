//! serialbridge-hardware
//!
//! Hardware abstraction crate that contains the serial backend and port
//! enumeration used by the bridge daemon.
//!
//! Public API:
//! - `backend::SerialBackend` — open and enumerate ports
//! - `backend::TokioSerialBackend` — real hardware through `tokio-serial`
//! - `registry::SerialPortRegistry` — filtered enumeration
//! - `mock::MockBackend` — in-memory ports for tests and `--mock` mode

pub mod backend;
pub mod mock;
pub mod registry;

pub use backend::{is_disconnect_io, EnumeratedPort, SerialBackend, SerialIo, TokioSerialBackend};
pub use mock::MockBackend;
pub use registry::{PortFilter, SerialPortRegistry};
