//! Bridging engine: client sessions, serial connections, and the buffer
//! reclamation policy shared by them.

pub mod broadcast;
pub mod client_hub;
pub mod connection;
pub mod memory;
pub mod serial_hub;

pub use broadcast::{Broadcaster, ClientSession, Outbound, SessionId};
pub use client_hub::ClientHub;
pub use connection::SerialConnection;
pub use memory::{IoHook, ReclaimPolicy, ReclaimTracker};
pub use serial_hub::{SerialHub, SerialHubSettings};
