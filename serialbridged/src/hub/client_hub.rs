//! Client hub
//!
//! Front door for network clients: session registration, broadcast, the
//! diagnostic log channel, and routing of client commands to the serial hub.

use std::sync::Arc;

use bytes::Bytes;
use serialbridge_core::{BridgeError, Command, Envelope, Result};
use tokio::sync::mpsc;
use tracing::{debug, info};

use super::broadcast::{Broadcaster, ClientSession, SessionId};
use super::serial_hub::SerialHub;
use crate::logging::LogSender;

/// Hub connecting browser clients to the serial hub
pub struct ClientHub {
    broadcaster: Arc<Broadcaster>,
    serial: Arc<SerialHub>,
    log: LogSender,
}

impl ClientHub {
    pub fn new(broadcaster: Arc<Broadcaster>, serial: Arc<SerialHub>, log: LogSender) -> Self {
        Self {
            broadcaster,
            serial,
            log,
        }
    }

    pub fn serial(&self) -> &Arc<SerialHub> {
        &self.serial
    }

    pub async fn register(&self, session: ClientSession) -> Result<SessionId> {
        let id = self.broadcaster.register(session).await?;
        info!("Client {} connected", id);
        Ok(id)
    }

    pub async fn unregister(&self, id: SessionId) {
        if self.broadcaster.unregister(id).await {
            info!("Client {} disconnected", id);
        }
    }

    pub async fn broadcast(&self, envelope: &Envelope) -> usize {
        self.broadcaster.broadcast(envelope).await
    }

    pub async fn send_to(&self, id: SessionId, envelope: &Envelope) -> Result<()> {
        self.broadcaster.send_to(id, envelope).await
    }

    pub async fn client_count(&self) -> usize {
        self.broadcaster.len().await
    }

    /// Handle for pushing lines onto the log channel
    pub fn log_sender(&self) -> LogSender {
        self.log.clone()
    }

    /// Broadcast every line arriving on the log channel until it closes
    pub async fn run_log_forwarder(self: Arc<Self>, mut rx: mpsc::Receiver<String>) {
        while let Some(line) = rx.recv().await {
            self.broadcaster.broadcast(&Envelope::log(line)).await;
        }
        debug!("Log forwarder stopped");
    }

    /// Execute one text frame from session `id`, replying to it directly
    pub async fn route_inbound(&self, id: SessionId, text: &str) {
        for reply in self.dispatch(Some(id), text).await {
            if let Err(e) = self.broadcaster.send_to(id, &reply).await {
                debug!("Reply to {} dropped: {}", id, e);
                break;
            }
        }
    }

    /// Execute a command outside any session, returning the direct replies
    pub async fn execute(&self, text: &str) -> Vec<Envelope> {
        self.dispatch(None, text).await
    }

    async fn dispatch(&self, session: Option<SessionId>, text: &str) -> Vec<Envelope> {
        let command = match Command::parse(text) {
            Ok(command) => command,
            Err(e) => {
                debug!("Rejected command {:?}: {}", text, e);
                return vec![Envelope::error(&e)];
            }
        };

        self.broadcaster
            .broadcast(&Envelope::Command {
                session: session
                    .map(|id| id.to_string())
                    .unwrap_or_else(|| "http".to_string()),
                command: text.trim().to_string(),
            })
            .await;

        match self.apply(session, command).await {
            Ok(replies) => replies,
            Err(e) => vec![Envelope::error(&e)],
        }
    }

    async fn apply(&self, session: Option<SessionId>, command: Command) -> Result<Vec<Envelope>> {
        match command {
            Command::Open { port, baud } => {
                self.serial.open(&port, baud).await?;
                Ok(Vec::new())
            }
            Command::Close { port } => {
                self.serial.close(&port).await?;
                Ok(Vec::new())
            }
            Command::Send { port, data } => {
                self.serial.write(&port, Bytes::from(data)).await?;
                Ok(Vec::new())
            }
            Command::List => Ok(vec![Envelope::List {
                ports: self.serial.list(None).await,
            }]),
            Command::Log { enabled } => {
                let id = session.ok_or_else(|| {
                    BridgeError::InvalidCommand(
                        "log mode applies to WebSocket sessions".to_string(),
                    )
                })?;
                self.broadcaster.set_log_only(id, !enabled).await;
                let state = if enabled { "on" } else { "off" };
                Ok(vec![Envelope::log(format!("Device data display {}", state))])
            }
            Command::Gc => {
                let open = self.serial.request_reclaim().await;
                info!("Buffer reclamation requested for {} open port(s)", open);
                Ok(vec![Envelope::log(format!(
                    "Buffer reclamation requested for {} open port(s)",
                    open
                ))])
            }
        }
    }

    /// Refuse new sessions and drop every connected client
    pub async fn shutdown(&self) {
        self.broadcaster.shutdown().await;
        info!("Client hub shut down");
    }
}
