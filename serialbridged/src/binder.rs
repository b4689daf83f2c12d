//! Port binding over a fixed range
//!
//! Browsers look for the bridge on a small set of well-known ports, so the
//! listeners walk `[low, high)` and keep the first port that binds. The
//! plain and TLS listeners each walk the range on their own.

use std::fmt;
use std::net::{IpAddr, SocketAddr};

use async_trait::async_trait;
use serialbridge_core::config::ServerConfig;
use serialbridge_core::{BridgeError, Result};
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

/// Half-open port range `[low, high)`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRange {
    pub low: u16,
    pub high: u16,
}

impl PortRange {
    pub fn new(low: u16, high: u16) -> Result<Self> {
        if low >= high {
            return Err(BridgeError::Config(format!(
                "empty port range {}..{}",
                low, high
            )));
        }
        Ok(Self { low, high })
    }

    pub fn from_config(config: &ServerConfig) -> Result<Self> {
        Self::new(config.port_low, config.port_high)
    }

    /// Number of ports in the range
    pub fn len(&self) -> u32 {
        u32::from(self.high.saturating_sub(self.low))
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn ports(&self) -> impl Iterator<Item = u16> {
        self.low..self.high
    }
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.low, self.high)
    }
}

/// Which listener a binder is working for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerKind {
    Plain,
    Tls,
}

impl fmt::Display for ListenerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ListenerKind::Plain => f.write_str("HTTP"),
            ListenerKind::Tls => f.write_str("HTTPS"),
        }
    }
}

/// Result of walking a port range
#[derive(Debug)]
pub enum BindOutcome<L> {
    Bound { port: u16, attempts: u32, listener: L },
    Exhausted { attempts: u32 },
}

impl<L> BindOutcome<L> {
    pub fn port(&self) -> Option<u16> {
        match self {
            BindOutcome::Bound { port, .. } => Some(*port),
            BindOutcome::Exhausted { .. } => None,
        }
    }

    pub fn attempts(&self) -> u32 {
        match self {
            BindOutcome::Bound { attempts, .. } | BindOutcome::Exhausted { attempts } => *attempts,
        }
    }
}

/// Something that can try to listen on a single port
#[async_trait]
pub trait ListenerBinder: Send + Sync {
    type Listener: Send;

    async fn bind(&self, port: u16) -> std::io::Result<Self::Listener>;
}

/// Binds TCP listeners on a fixed address
#[derive(Debug, Clone)]
pub struct TcpBinder {
    host: IpAddr,
}

impl TcpBinder {
    pub fn new(host: IpAddr) -> Self {
        Self { host }
    }

    pub fn from_config(config: &ServerConfig) -> Result<Self> {
        let host = config.bind.parse::<IpAddr>().map_err(|e| {
            BridgeError::Config(format!("invalid bind address '{}': {}", config.bind, e))
        })?;
        Ok(Self::new(host))
    }
}

#[async_trait]
impl ListenerBinder for TcpBinder {
    type Listener = TcpListener;

    async fn bind(&self, port: u16) -> std::io::Result<TcpListener> {
        TcpListener::bind(SocketAddr::new(self.host, port)).await
    }
}

/// Try every port of `range` in order until one binds
pub async fn bind_in_range<B: ListenerBinder>(
    binder: &B,
    range: PortRange,
    kind: ListenerKind,
) -> BindOutcome<B::Listener> {
    let mut attempts = 0;
    for port in range.ports() {
        attempts += 1;
        match binder.bind(port).await {
            Ok(listener) => {
                info!(
                    "{} listener bound on port {} ({} attempt(s))",
                    kind, port, attempts
                );
                return BindOutcome::Bound {
                    port,
                    attempts,
                    listener,
                };
            }
            Err(e) => {
                let err = BridgeError::BindFailed {
                    port,
                    reason: e.to_string(),
                };
                debug!("{} listener: {}", kind, err);
            }
        }
    }

    warn!(
        "{} listener: no free port in {} after {} attempts",
        kind, range, attempts
    );
    BindOutcome::Exhausted { attempts }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::io::{Error, ErrorKind};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeBinder {
        busy: HashSet<u16>,
        tried: Mutex<Vec<u16>>,
        calls: AtomicU32,
    }

    impl FakeBinder {
        fn busy(ports: impl IntoIterator<Item = u16>) -> Self {
            Self {
                busy: ports.into_iter().collect(),
                ..Default::default()
            }
        }
    }

    #[async_trait]
    impl ListenerBinder for FakeBinder {
        type Listener = u16;

        async fn bind(&self, port: u16) -> std::io::Result<u16> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.tried.lock().unwrap().push(port);
            tokio::task::yield_now().await;
            if self.busy.contains(&port) {
                Err(Error::from(ErrorKind::AddrInUse))
            } else {
                Ok(port)
            }
        }
    }

    fn default_range() -> PortRange {
        PortRange::new(8990, 9000).unwrap()
    }

    #[test]
    fn test_port_range() {
        let range = default_range();
        assert_eq!(range.len(), 10);
        assert_eq!(range.ports().next(), Some(8990));
        assert_eq!(range.ports().last(), Some(8999));
        assert_eq!(range.to_string(), "[8990, 9000)");
        assert!(PortRange::new(9000, 9000).is_err());
    }

    #[tokio::test]
    async fn test_first_free_port_wins() {
        let binder = FakeBinder::busy([8990, 8991]);
        let outcome = bind_in_range(&binder, default_range(), ListenerKind::Plain).await;
        match outcome {
            BindOutcome::Bound {
                port,
                attempts,
                listener,
            } => {
                assert_eq!(port, 8992);
                assert_eq!(attempts, 3);
                assert_eq!(listener, 8992);
            }
            other => panic!("Expected Bound, got {:?}", other),
        }
        assert_eq!(*binder.tried.lock().unwrap(), vec![8990, 8991, 8992]);
    }

    #[tokio::test]
    async fn test_exhaustion_after_range_size_attempts() {
        let binder = FakeBinder::busy(8990..9000);
        let outcome = bind_in_range(&binder, default_range(), ListenerKind::Tls).await;
        assert!(matches!(outcome, BindOutcome::Exhausted { attempts: 10 }));
        assert_eq!(binder.calls.load(Ordering::SeqCst), 10);
        assert_eq!(outcome.port(), None);
    }

    #[tokio::test]
    async fn test_kinds_bind_independently() {
        let plain = FakeBinder::busy(8990..9000);
        let tls = FakeBinder::default();

        let (plain_outcome, tls_outcome) = tokio::join!(
            bind_in_range(&plain, default_range(), ListenerKind::Plain),
            bind_in_range(&tls, default_range(), ListenerKind::Tls),
        );

        assert_eq!(plain_outcome.attempts(), 10);
        assert_eq!(plain_outcome.port(), None);
        assert_eq!(tls_outcome.port(), Some(8990));
        assert_eq!(tls_outcome.attempts(), 1);
    }

    #[tokio::test]
    async fn test_tcp_binder_skips_occupied_port() {
        let occupied = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = occupied.local_addr().unwrap().port();
        let binder = TcpBinder::new("127.0.0.1".parse().unwrap());

        let outcome = bind_in_range(
            &binder,
            PortRange::new(port, port + 1).unwrap(),
            ListenerKind::Plain,
        )
        .await;
        assert!(matches!(outcome, BindOutcome::Exhausted { attempts: 1 }));
    }

    #[test]
    fn test_tcp_binder_from_config() {
        let config = ServerConfig::default();
        assert!(TcpBinder::from_config(&config).is_ok());

        let bad = ServerConfig {
            bind: "not-an-ip".to_string(),
            ..ServerConfig::default()
        };
        assert!(matches!(
            TcpBinder::from_config(&bad),
            Err(BridgeError::Config(_))
        ));
    }
}
