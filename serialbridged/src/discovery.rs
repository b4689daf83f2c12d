//! LAN discovery
//!
//! Every few seconds the bridge broadcasts a small JSON announcement on the
//! discovery port so IDEs and other bridges on the local network can find
//! it. A passive listener records announcements from other instances.
//! Socket failures only make this instance undiscoverable; they are logged
//! and never reach the hubs.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serialbridge_core::api::{ListenerPorts, PeerInfo};
use serialbridge_core::config::DiscoveryConfig;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::{watch, RwLock};
use tracing::{debug, info, warn};

/// Errors raised while setting up discovery sockets
#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("failed to bind discovery socket on {addr}: {source}")]
    BindFailed {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to enable broadcast: {0}")]
    Broadcast(#[source] std::io::Error),

    #[error("failed to encode announcement: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Payload broadcast by every instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Announcement {
    pub hostname: String,
    pub version: String,
    pub ports: ListenerPorts,
}

impl Announcement {
    pub fn encode(&self) -> Result<Vec<u8>, DiscoveryError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(datagram: &[u8]) -> Option<Self> {
        serde_json::from_slice(datagram).ok()
    }
}

#[derive(Debug, Clone)]
struct PeerRecord {
    hostname: String,
    address: IpAddr,
    ports: ListenerPorts,
    last_seen: Instant,
}

/// Other bridge instances heard on the network
#[derive(Debug)]
pub struct PeerTable {
    peers: RwLock<HashMap<(String, IpAddr), PeerRecord>>,
    max_age: Duration,
}

impl PeerTable {
    /// Peers not heard from within `max_age` are left out of snapshots
    pub fn new(max_age: Duration) -> Self {
        Self {
            peers: RwLock::new(HashMap::new()),
            max_age,
        }
    }

    pub async fn record(&self, announcement: Announcement, address: IpAddr) {
        let mut peers = self.peers.write().await;
        let key = (announcement.hostname.clone(), address);
        if !peers.contains_key(&key) {
            info!(
                "Discovered bridge '{}' at {}",
                announcement.hostname, address
            );
        }
        peers.insert(
            key,
            PeerRecord {
                hostname: announcement.hostname,
                address,
                ports: announcement.ports,
                last_seen: Instant::now(),
            },
        );
    }

    /// Live peers, sorted by hostname
    pub async fn snapshot(&self) -> Vec<PeerInfo> {
        let peers = self.peers.read().await;
        let mut live: Vec<PeerInfo> = peers
            .values()
            .filter(|peer| peer.last_seen.elapsed() <= self.max_age)
            .map(|peer| PeerInfo {
                hostname: peer.hostname.clone(),
                address: peer.address.to_string(),
                ports: peer.ports,
                last_seen_secs: peer.last_seen.elapsed().as_secs(),
            })
            .collect();
        live.sort_by(|a, b| a.hostname.cmp(&b.hostname).then(a.address.cmp(&b.address)));
        live
    }
}

/// Announcer and listener for one bridge instance
pub struct DiscoveryLoop {
    config: DiscoveryConfig,
    announcement: Announcement,
    peers: Arc<PeerTable>,
}

impl DiscoveryLoop {
    pub fn new(config: DiscoveryConfig, announcement: Announcement) -> Self {
        let max_age = Duration::from_secs(config.interval_secs.max(1) * 3);
        Self {
            config,
            announcement,
            peers: Arc::new(PeerTable::new(max_age)),
        }
    }

    pub fn peers(&self) -> Arc<PeerTable> {
        Arc::clone(&self.peers)
    }

    /// Run until `shutdown` flips. Never fails; setup errors are logged.
    pub async fn run(self, shutdown: watch::Receiver<bool>) {
        if !self.config.enabled {
            info!("LAN discovery disabled");
            return;
        }

        let interval = Duration::from_secs(self.config.interval_secs.max(1));
        let target = SocketAddr::new(IpAddr::V4(Ipv4Addr::BROADCAST), self.config.port);

        let announcer = async {
            match broadcast_socket().await {
                Ok(socket) => {
                    run_announcer(
                        socket,
                        target,
                        self.announcement.clone(),
                        interval,
                        shutdown.clone(),
                    )
                    .await
                }
                Err(e) => warn!("Discovery announcements disabled: {}", e),
            }
        };

        let listener = async {
            if !self.config.listen {
                return;
            }
            let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), self.config.port);
            match UdpSocket::bind(addr).await {
                Ok(socket) => {
                    run_listener(
                        socket,
                        Arc::clone(&self.peers),
                        self.announcement.clone(),
                        shutdown.clone(),
                    )
                    .await
                }
                Err(source) => warn!(
                    "Discovery listener disabled: {}",
                    DiscoveryError::BindFailed { addr, source }
                ),
            }
        };

        tokio::join!(announcer, listener);
    }
}

async fn broadcast_socket() -> Result<UdpSocket, DiscoveryError> {
    let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0);
    let socket = UdpSocket::bind(addr)
        .await
        .map_err(|source| DiscoveryError::BindFailed { addr, source })?;
    socket.set_broadcast(true).map_err(DiscoveryError::Broadcast)?;
    Ok(socket)
}

/// Send `announcement` to `target` every `interval`
pub async fn run_announcer(
    socket: UdpSocket,
    target: SocketAddr,
    announcement: Announcement,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let payload = match announcement.encode() {
        Ok(payload) => payload,
        Err(e) => {
            warn!("{}", e);
            return;
        }
    };
    info!(
        "Announcing '{}' on UDP {} every {}s",
        announcement.hostname,
        target,
        interval.as_secs()
    );

    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {
                if let Err(e) = socket.send_to(&payload, target).await {
                    debug!("Discovery announcement failed: {}", e);
                }
            }
        }
    }
    debug!("Discovery announcer stopped");
}

/// Record announcements arriving on `socket`, ignoring our own
pub async fn run_listener(
    socket: UdpSocket,
    peers: Arc<PeerTable>,
    own: Announcement,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut buf = vec![0u8; 2048];
    loop {
        let (len, src) = tokio::select! {
            _ = shutdown.changed() => break,
            received = socket.recv_from(&mut buf) => match received {
                Ok(pair) => pair,
                Err(e) => {
                    debug!("Discovery receive error: {}", e);
                    continue;
                }
            },
        };

        match Announcement::decode(&buf[..len]) {
            Some(announcement) if announcement == own => {}
            Some(announcement) => peers.record(announcement, src.ip()).await,
            None => debug!("Ignoring malformed discovery datagram from {}", src),
        }
    }
    debug!("Discovery listener stopped");
}
