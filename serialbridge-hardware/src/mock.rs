//! In-memory serial backend
//!
//! Ports are backed by `tokio::io::duplex` pipes. Tests attach a port and
//! keep the device end to play the hardware; dropping the device end looks
//! like an unplugged cable. Loopback ports echo every write back, which is
//! what the daemon's `--mock` mode uses.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use serialbridge_core::{BridgeError, Result};
use tokio::io::DuplexStream;
use tracing::debug;

use crate::backend::{EnumeratedPort, SerialBackend, SerialIo};

const PIPE_CAPACITY: usize = 64 * 1024;

/// Serial backend without hardware
#[derive(Default)]
pub struct MockBackend {
    ports: Mutex<Vec<EnumeratedPort>>,
    attached: Mutex<HashMap<String, VecDeque<DuplexStream>>>,
    loopback: Mutex<HashSet<String>>,
    unavailable: Mutex<HashSet<String>>,
    opens: AtomicUsize,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make a port show up in enumeration
    pub fn add_port(&self, name: impl Into<String>) {
        let name = name.into();
        if let Ok(mut ports) = self.ports.lock() {
            if !ports.iter().any(|p| p.name == name) {
                ports.push(EnumeratedPort::new(name));
            }
        }
    }

    /// Remove a port from enumeration
    pub fn remove_port(&self, name: &str) {
        if let Ok(mut ports) = self.ports.lock() {
            ports.retain(|p| p.name != name);
        }
    }

    /// Prepare the next `open(name)` and return the device end of the pipe
    pub fn attach(&self, name: impl Into<String>) -> DuplexStream {
        let name = name.into();
        self.add_port(name.clone());
        let (bridge_end, device_end) = tokio::io::duplex(PIPE_CAPACITY);
        if let Ok(mut attached) = self.attached.lock() {
            attached.entry(name).or_default().push_back(bridge_end);
        }
        device_end
    }

    /// Register a port that echoes everything written to it
    pub fn add_loopback(&self, name: impl Into<String>) {
        let name = name.into();
        self.add_port(name.clone());
        if let Ok(mut loopback) = self.loopback.lock() {
            loopback.insert(name);
        }
    }

    /// Make opens of `name` fail as if the port were busy
    pub fn set_unavailable(&self, name: impl Into<String>) {
        if let Ok(mut unavailable) = self.unavailable.lock() {
            unavailable.insert(name.into());
        }
    }

    /// Number of successful opens so far
    pub fn open_count(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    fn unavailable(path: &str, reason: &str) -> BridgeError {
        BridgeError::DeviceUnavailable {
            port: path.to_string(),
            reason: reason.to_string(),
        }
    }
}

impl SerialBackend for MockBackend {
    fn available_ports(&self) -> Result<Vec<EnumeratedPort>> {
        self.ports
            .lock()
            .map(|ports| ports.clone())
            .map_err(|_| BridgeError::Serial("mock port list poisoned".to_string()))
    }

    fn open(&self, path: &str, baud: u32) -> Result<Box<dyn SerialIo>> {
        let busy = self
            .unavailable
            .lock()
            .map(|set| set.contains(path))
            .unwrap_or(false);
        if busy {
            return Err(Self::unavailable(path, "Device or resource busy"));
        }

        let queued = self
            .attached
            .lock()
            .ok()
            .and_then(|mut attached| attached.get_mut(path).and_then(|q| q.pop_front()));
        if let Some(stream) = queued {
            debug!("Mock open of {} @ {}", path, baud);
            self.opens.fetch_add(1, Ordering::SeqCst);
            return Ok(Box::new(stream));
        }

        let is_loopback = self
            .loopback
            .lock()
            .map(|set| set.contains(path))
            .unwrap_or(false);
        if is_loopback {
            let runtime = tokio::runtime::Handle::try_current()
                .map_err(|_| Self::unavailable(path, "no async runtime for loopback"))?;
            let (bridge_end, device_end) = tokio::io::duplex(PIPE_CAPACITY);
            runtime.spawn(async move {
                let (mut reader, mut writer) = tokio::io::split(device_end);
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
            });
            debug!("Mock loopback open of {} @ {}", path, baud);
            self.opens.fetch_add(1, Ordering::SeqCst);
            return Ok(Box::new(bridge_end));
        }

        Err(Self::unavailable(path, "No such file or directory"))
    }
}
