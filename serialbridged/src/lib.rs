//! Serial Bridge daemon
//!
//! Bridges local serial ports to browser clients over WebSocket. The
//! binary in `main.rs` wires these modules together; they are exposed as a
//! library so integration tests can drive the hubs directly.

pub mod api;
pub mod binder;
pub mod config;
pub mod discovery;
pub mod hub;
pub mod logging;
pub mod shutdown;
pub mod update;

pub use api::{create_router, AppState};
pub use binder::{bind_in_range, BindOutcome, ListenerBinder, ListenerKind, PortRange, TcpBinder};
pub use config::{ConfigOverrides, RuntimeConfig};
pub use discovery::{Announcement, DiscoveryLoop, PeerTable};
pub use hub::{ClientHub, ClientSession, ReclaimPolicy, SerialHub, SerialHubSettings};
pub use update::{HttpUpdateSource, UpdateSource, UpdateState, Updater};
