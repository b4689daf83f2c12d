//! Serial hub
//!
//! Supervises the set of open serial connections. At most one connection
//! exists per port path. A path stays reserved while it is being opened and
//! until a close has released the device, so a concurrent open of the same
//! port sees `AlreadyOpen` instead of racing on the hardware.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serialbridge_core::config::SerialConfig;
use serialbridge_core::{BridgeError, Envelope, PortListing, Result, SerialPortDescriptor};
use serialbridge_hardware::{PortFilter, SerialBackend, SerialPortRegistry};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::broadcast::Broadcaster;
use super::connection::SerialConnection;
use super::memory::ReclaimPolicy;

/// Tunables for serial connections
#[derive(Debug, Clone)]
pub struct SerialHubSettings {
    pub default_baud: u32,
    pub write_queue: usize,
    pub read_chunk: usize,
    /// How long `close` waits for each I/O task before aborting it
    pub close_timeout: Duration,
}

impl Default for SerialHubSettings {
    fn default() -> Self {
        Self::from(&SerialConfig::default())
    }
}

impl From<&SerialConfig> for SerialHubSettings {
    fn from(config: &SerialConfig) -> Self {
        Self {
            default_baud: config.default_baud,
            write_queue: config.write_queue,
            read_chunk: config.read_chunk,
            close_timeout: Duration::from_secs(2),
        }
    }
}

#[derive(Default)]
pub(crate) struct PortTable {
    pub open: HashMap<String, Arc<SerialConnection>>,
    /// Paths with an open or close in flight
    pub reserved: HashSet<String>,
}

/// State shared between the hub and its connection tasks
pub(crate) struct HubShared {
    pub table: Mutex<PortTable>,
    pub broadcaster: Arc<Broadcaster>,
    pub policy: Arc<ReclaimPolicy>,
    pub settings: SerialHubSettings,
}

/// A path held in `PortTable::reserved`
///
/// Dropping an armed reservation frees the path, so an open or close whose
/// future is cancelled mid-way does not leave the port blocked.
struct Reservation {
    shared: Arc<HubShared>,
    path: String,
    armed: bool,
}

impl Reservation {
    /// Reserve `path` in a table the caller has locked
    fn take(shared: &Arc<HubShared>, table: &mut PortTable, path: &str) -> Self {
        table.reserved.insert(path.to_string());
        Self {
            shared: Arc::clone(shared),
            path: path.to_string(),
            armed: true,
        }
    }

    /// Drop the path from a table the caller has locked
    fn clear(mut self, table: &mut PortTable) {
        table.reserved.remove(&self.path);
        self.armed = false;
    }

    async fn release(self) {
        let shared = Arc::clone(&self.shared);
        let mut table = shared.table.lock().await;
        self.clear(&mut table);
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Ok(mut table) = self.shared.table.try_lock() {
            table.reserved.remove(&self.path);
            return;
        }
        // Table busy: free the path once the current holder lets go
        let shared = Arc::clone(&self.shared);
        let path = std::mem::take(&mut self.path);
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    shared.table.lock().await.reserved.remove(&path);
                });
            }
            Err(_) => warn!("Reservation for {} leaked outside the runtime", path),
        }
    }
}

/// Supervisor of open serial connections
pub struct SerialHub {
    shared: Arc<HubShared>,
    backend: Arc<dyn SerialBackend>,
    registry: Arc<SerialPortRegistry>,
    next_id: AtomicU64,
}

impl SerialHub {
    pub fn new(
        backend: Arc<dyn SerialBackend>,
        filter: PortFilter,
        broadcaster: Arc<Broadcaster>,
        policy: Arc<ReclaimPolicy>,
        settings: SerialHubSettings,
    ) -> Self {
        Self {
            shared: Arc::new(HubShared {
                table: Mutex::new(PortTable::default()),
                broadcaster,
                policy,
                settings,
            }),
            registry: Arc::new(SerialPortRegistry::new(Arc::clone(&backend), filter)),
            backend,
            next_id: AtomicU64::new(1),
        }
    }

    pub fn policy(&self) -> &ReclaimPolicy {
        &self.shared.policy
    }

    /// Open `path`, using the configured default baud rate when `baud` is `None`
    ///
    /// Returns the baud rate the port was opened at.
    pub async fn open(&self, path: &str, baud: Option<u32>) -> Result<u32> {
        let baud = baud.unwrap_or(self.shared.settings.default_baud);
        let reservation = {
            let mut table = self.shared.table.lock().await;
            if table.open.contains_key(path) || table.reserved.contains(path) {
                return Err(BridgeError::AlreadyOpen(path.to_string()));
            }
            Reservation::take(&self.shared, &mut table, path)
        };

        let backend = Arc::clone(&self.backend);
        let target = path.to_string();
        let opened = tokio::task::spawn_blocking(move || backend.open(&target, baud))
            .await
            .map_err(|e| BridgeError::Serial(format!("open task for {} failed: {}", path, e)))
            .and_then(|opened| opened);
        let io = match opened {
            Ok(io) => io,
            Err(e) => {
                reservation.release().await;
                warn!("Failed to open {}: {}", path, e);
                return Err(e);
            }
        };

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        {
            let mut table = self.shared.table.lock().await;
            reservation.clear(&mut table);
            let conn = SerialConnection::spawn(id, path, baud, io, &self.shared);
            table.open.insert(path.to_string(), conn);
        }

        info!("Opened serial port {} @ {} baud", path, baud);
        self.shared
            .broadcaster
            .broadcast(&Envelope::Opened {
                port: path.to_string(),
                baud,
            })
            .await;
        Ok(baud)
    }

    /// Close `path`, stopping its tasks and releasing the device
    ///
    /// The path stays reserved until both tasks are gone.
    pub async fn close(&self, path: &str) -> Result<()> {
        let (conn, reservation) = {
            let mut table = self.shared.table.lock().await;
            let conn = table
                .open
                .remove(path)
                .ok_or_else(|| BridgeError::NotOpen(path.to_string()))?;
            (conn, Reservation::take(&self.shared, &mut table, path))
        };

        conn.shutdown(self.shared.settings.close_timeout).await;
        reservation.release().await;
        info!("Closed serial port {}", path);
        self.shared
            .broadcaster
            .broadcast(&Envelope::Closed {
                port: path.to_string(),
            })
            .await;
        Ok(())
    }

    /// Queue `data` for the connection on `path`
    pub async fn write(&self, path: &str, data: Bytes) -> Result<()> {
        let conn = self
            .shared
            .table
            .lock()
            .await
            .open
            .get(path)
            .cloned()
            .ok_or_else(|| BridgeError::NotOpen(path.to_string()))?;

        debug!("Queueing {} bytes for {}", data.len(), path);
        conn.enqueue(data).await
    }

    /// Every port on the host, flagged against the configured filter
    pub async fn enumerate(&self) -> Result<Vec<SerialPortDescriptor>> {
        let registry = Arc::clone(&self.registry);
        tokio::task::spawn_blocking(move || registry.enumerate(None))
            .await
            .map_err(|e| BridgeError::Serial(format!("port enumeration task failed: {}", e)))?
    }

    /// Ports matching `filter` (the configured one when `None`) with their
    /// open state
    pub async fn list(&self, filter: Option<&PortFilter>) -> Vec<PortListing> {
        let registry = Arc::clone(&self.registry);
        let filter = filter.cloned();
        let listed = tokio::task::spawn_blocking(move || registry.list(filter.as_ref())).await;
        let descriptors = listed.unwrap_or_else(|e| {
            warn!("Port enumeration task failed: {}", e);
            Vec::new()
        });

        let table = self.shared.table.lock().await;
        descriptors
            .into_iter()
            .map(|descriptor| {
                let conn = table.open.get(&descriptor.name);
                PortListing {
                    is_open: conn.is_some(),
                    baud: conn.map(|c| c.baud()),
                    descriptor,
                }
            })
            .collect()
    }

    pub async fn is_open(&self, path: &str) -> bool {
        self.shared.table.lock().await.open.contains_key(path)
    }

    /// Paths of every open connection, sorted
    pub async fn open_ports(&self) -> Vec<String> {
        let mut ports: Vec<String> = self.shared.table.lock().await.open.keys().cloned().collect();
        ports.sort();
        ports
    }

    /// Ask every open connection to release its buffers at its next hook
    ///
    /// Returns the number of open connections.
    pub async fn request_reclaim(&self) -> usize {
        self.shared.policy.request();
        self.shared.table.lock().await.open.len()
    }

    /// Close every connection, for process shutdown
    pub async fn close_all(&self) {
        let ports = self.open_ports().await;
        for port in ports {
            if let Err(e) = self.close(&port).await {
                debug!("Close during shutdown: {}", e);
            }
        }
    }
}
