//! Client session registry and fan-out
//!
//! Each connected client owns a bounded outbound queue. Broadcasting
//! serializes an envelope once and `try_send`s the shared text into every
//! queue; a client whose queue is full or closed is unregistered on the
//! spot, so one slow browser never holds up the others.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serialbridge_core::{BridgeError, Envelope, EnvelopeKind, Result};
use tokio::sync::{mpsc, RwLock};
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};
use uuid::Uuid;

/// Opaque client identity, never reused
pub type SessionId = Uuid;

/// Serialized envelope shared by every queue it is sent to
pub type Outbound = Arc<str>;

/// One connected client, as seen by the hub
#[derive(Debug)]
pub struct ClientSession {
    id: SessionId,
    tx: mpsc::Sender<Outbound>,
    log_only: AtomicBool,
}

impl ClientSession {
    /// Create a session with a fresh id and an outbound queue of `capacity`
    ///
    /// The receiver goes to the task writing to the client's socket. It
    /// yields `None` once the hub drops the session.
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let session = Self {
            id: Uuid::new_v4(),
            tx,
            log_only: AtomicBool::new(false),
        };
        (session, rx)
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn is_log_only(&self) -> bool {
        self.log_only.load(Ordering::Relaxed)
    }

    fn accepts(&self, kind: EnvelopeKind) -> bool {
        !self.is_log_only() || kind == EnvelopeKind::Log
    }
}

enum Delivery {
    Sent,
    Skipped,
    Dropped,
}

/// Registry of live client sessions
pub struct Broadcaster {
    sessions: RwLock<HashMap<SessionId, Arc<ClientSession>>>,
    shutting_down: AtomicBool,
}

impl Default for Broadcaster {
    fn default() -> Self {
        Self::new()
    }
}

impl Broadcaster {
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            shutting_down: AtomicBool::new(false),
        }
    }

    /// Add a session. Fails with [`BridgeError::ShuttingDown`] after
    /// [`Broadcaster::shutdown`].
    pub async fn register(&self, session: ClientSession) -> Result<SessionId> {
        let mut sessions = self.sessions.write().await;
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(BridgeError::ShuttingDown);
        }
        let id = session.id;
        sessions.insert(id, Arc::new(session));
        debug!("Client {} registered ({} connected)", id, sessions.len());
        Ok(id)
    }

    /// Drop a session. Returns `false` if it was already gone.
    pub async fn unregister(&self, id: SessionId) -> bool {
        let mut sessions = self.sessions.write().await;
        let removed = sessions.remove(&id).is_some();
        if removed {
            debug!("Client {} unregistered ({} connected)", id, sessions.len());
        }
        removed
    }

    /// Deliver `envelope` to every registered session
    ///
    /// Returns how many sessions received it.
    pub async fn broadcast(&self, envelope: &Envelope) -> usize {
        let text: Outbound = match envelope.to_json() {
            Ok(json) => json.into(),
            Err(e) => {
                warn!("Dropping unserializable envelope: {}", e);
                return 0;
            }
        };
        let kind = envelope.kind();

        let mut delivered = 0;
        let mut dropped = Vec::new();
        {
            let sessions = self.sessions.read().await;
            for session in sessions.values() {
                match Self::deliver(session, kind, &text) {
                    Delivery::Sent => delivered += 1,
                    Delivery::Skipped => {}
                    Delivery::Dropped => dropped.push(session.id),
                }
            }
        }

        for id in dropped {
            self.unregister(id).await;
        }
        delivered
    }

    /// Deliver `envelope` to one session, with the same overflow policy
    pub async fn send_to(&self, id: SessionId, envelope: &Envelope) -> Result<()> {
        let text: Outbound = envelope.to_json()?.into();
        let session = self.sessions.read().await.get(&id).cloned();
        let Some(session) = session else {
            return Err(BridgeError::InvalidInput(format!("unknown session {}", id)));
        };

        match Self::deliver(&session, envelope.kind(), &text) {
            Delivery::Sent | Delivery::Skipped => Ok(()),
            Delivery::Dropped => {
                self.unregister(id).await;
                Err(BridgeError::ClientQueueOverflow(id.to_string()))
            }
        }
    }

    fn deliver(session: &ClientSession, kind: EnvelopeKind, text: &Outbound) -> Delivery {
        if !session.accepts(kind) {
            return Delivery::Skipped;
        }
        match session.tx.try_send(Arc::clone(text)) {
            Ok(()) => Delivery::Sent,
            Err(TrySendError::Full(_)) => {
                warn!(
                    "{}; disconnecting",
                    BridgeError::ClientQueueOverflow(session.id.to_string())
                );
                Delivery::Dropped
            }
            Err(TrySendError::Closed(_)) => {
                debug!("Client {} went away", session.id);
                Delivery::Dropped
            }
        }
    }

    /// Restrict a session to log lines, or lift the restriction
    pub async fn set_log_only(&self, id: SessionId, log_only: bool) -> bool {
        match self.sessions.read().await.get(&id) {
            Some(session) => {
                session.log_only.store(log_only, Ordering::Relaxed);
                true
            }
            None => false,
        }
    }

    pub async fn contains(&self, id: SessionId) -> bool {
        self.sessions.read().await.contains_key(&id)
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Refuse new sessions and drop every queue
    pub async fn shutdown(&self) {
        let mut sessions = self.sessions.write().await;
        self.shutting_down.store(true, Ordering::SeqCst);
        let count = sessions.len();
        sessions.clear();
        debug!("Broadcaster shut down, {} session(s) dropped", count);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn data(text: &'static str) -> Envelope {
        Envelope::hardware_data("/dev/ttyACM0", Bytes::from_static(text.as_bytes()))
    }

    #[tokio::test]
    async fn test_broadcast_reaches_every_session() {
        let hub = Broadcaster::new();
        let mut receivers = Vec::new();
        for _ in 0..3 {
            let (session, rx) = ClientSession::new(8);
            hub.register(session).await.unwrap();
            receivers.push(rx);
        }

        assert_eq!(hub.broadcast(&data("hi")).await, 3);
        for rx in receivers.iter_mut() {
            let text = rx.recv().await.unwrap();
            assert!(text.contains("\"data\":\"hi\""));
        }
    }

    #[tokio::test]
    async fn test_serialized_once_and_shared() {
        let hub = Broadcaster::new();
        let (a, mut rx_a) = ClientSession::new(4);
        let (b, mut rx_b) = ClientSession::new(4);
        hub.register(a).await.unwrap();
        hub.register(b).await.unwrap();

        hub.broadcast(&Envelope::log("shared")).await;
        let first = rx_a.recv().await.unwrap();
        let second = rx_b.recv().await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn test_full_queue_unregisters_only_that_session() {
        let hub = Broadcaster::new();
        let (slow, _slow_rx) = ClientSession::new(1);
        let slow_id = hub.register(slow).await.unwrap();
        let (fast, mut fast_rx) = ClientSession::new(8);
        let fast_id = hub.register(fast).await.unwrap();

        hub.broadcast(&data("1")).await;
        fast_rx.recv().await.unwrap();
        hub.broadcast(&data("2")).await;

        assert!(!hub.contains(slow_id).await);
        assert!(hub.contains(fast_id).await);
        assert!(fast_rx.recv().await.unwrap().contains("\"2\""));
    }

    #[tokio::test]
    async fn test_closed_queue_unregisters() {
        let hub = Broadcaster::new();
        let (session, rx) = ClientSession::new(4);
        let id = hub.register(session).await.unwrap();
        drop(rx);

        assert_eq!(hub.broadcast(&data("x")).await, 0);
        assert!(!hub.contains(id).await);
    }

    #[tokio::test]
    async fn test_unregister_is_idempotent() {
        let hub = Broadcaster::new();
        let (session, _rx) = ClientSession::new(4);
        let id = hub.register(session).await.unwrap();
        assert!(hub.unregister(id).await);
        assert!(!hub.unregister(id).await);
        assert!(hub.is_empty().await);
    }

    #[tokio::test]
    async fn test_register_after_shutdown_fails() {
        let hub = Broadcaster::new();
        let (session, mut rx) = ClientSession::new(4);
        hub.register(session).await.unwrap();

        hub.shutdown().await;
        assert!(hub.is_shutting_down());
        assert!(rx.recv().await.is_none());

        let (late, _late_rx) = ClientSession::new(4);
        assert!(matches!(
            hub.register(late).await,
            Err(BridgeError::ShuttingDown)
        ));
    }

    #[tokio::test]
    async fn test_log_only_session_filters() {
        let hub = Broadcaster::new();
        let (session, mut rx) = ClientSession::new(8);
        let id = hub.register(session).await.unwrap();
        assert!(hub.set_log_only(id, true).await);

        hub.broadcast(&data("hidden")).await;
        hub.broadcast(&Envelope::log("visible")).await;

        let text = rx.recv().await.unwrap();
        assert!(text.contains("visible"));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_send_to_unknown_session() {
        let hub = Broadcaster::new();
        let err = hub
            .send_to(Uuid::new_v4(), &Envelope::log("nobody"))
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_send_to_overflow_disconnects() {
        let hub = Broadcaster::new();
        let (session, _rx) = ClientSession::new(1);
        let id = hub.register(session).await.unwrap();

        hub.send_to(id, &Envelope::log("one")).await.unwrap();
        let err = hub.send_to(id, &Envelope::log("two")).await.unwrap_err();
        assert!(matches!(err, BridgeError::ClientQueueOverflow(_)));
        assert!(!hub.contains(id).await);
    }
}
