//! Tracing setup and the log channel feeding connected clients
//!
//! [`BroadcastLogLayer`] copies INFO and above into a bounded channel that
//! the client hub drains and broadcasts as `log` envelopes. A full channel
//! drops lines rather than stalling the thread that logged them.

use std::fmt::{self, Write as _};

use tokio::sync::mpsc;
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::Context;
use tracing_subscriber::Layer;

/// Capacity of the log channel
pub const LOG_QUEUE: usize = 512;

/// Targets whose events are never forwarded; broadcasting them would feed
/// the channel from its own consumer.
const QUIET_TARGETS: &[&str] = &["serialbridged::hub::broadcast", "tower_http"];

/// Create the log channel
pub fn log_channel(capacity: usize) -> (LogSender, mpsc::Receiver<String>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (LogSender { tx }, rx)
}

/// Producer side of the log channel
#[derive(Debug, Clone)]
pub struct LogSender {
    tx: mpsc::Sender<String>,
}

impl LogSender {
    /// Queue a line; returns `false` if it was dropped
    pub fn send(&self, line: impl Into<String>) -> bool {
        self.tx.try_send(line.into()).is_ok()
    }
}

/// `tracing` layer forwarding events to the log channel
pub struct BroadcastLogLayer {
    sender: LogSender,
}

impl BroadcastLogLayer {
    pub fn new(sender: LogSender) -> Self {
        Self { sender }
    }
}

impl<S: Subscriber> Layer<S> for BroadcastLogLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let meta = event.metadata();
        if *meta.level() > Level::INFO {
            return;
        }
        if QUIET_TARGETS
            .iter()
            .any(|quiet| meta.target().starts_with(quiet))
        {
            return;
        }

        let mut line = LineVisitor::default();
        event.record(&mut line);
        self.sender.send(format!("[{}] {}", meta.level(), line.finish()));
    }
}

#[derive(Default)]
struct LineVisitor {
    message: String,
    fields: String,
}

impl LineVisitor {
    fn finish(self) -> String {
        if self.fields.is_empty() {
            self.message
        } else if self.message.is_empty() {
            self.fields.trim_start().to_string()
        } else {
            format!("{}{}", self.message, self.fields)
        }
    }
}

impl Visit for LineVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message.push_str(value);
        } else {
            let _ = write!(self.fields, " {}={}", field.name(), value);
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            let _ = write!(self.message, "{:?}", value);
        } else {
            let _ = write!(self.fields, " {}={:?}", field.name(), value);
        }
    }
}

/// Initialize the global subscriber: env filter, stdout formatter, and the
/// client log layer
pub fn init_tracing(verbose: bool, log: LogSender) {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = if verbose {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"))
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(BroadcastLogLayer::new(log))
        .init();
}
