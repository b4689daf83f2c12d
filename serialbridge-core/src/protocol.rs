//! Client/bridge message protocol
//!
//! Clients send [`Command`]s as WebSocket text frames, either as JSON
//! (`{"action":"open","port":"/dev/ttyACM0"}`) or as free text
//! (`open /dev/ttyACM0 115200`). The bridge answers and broadcasts
//! [`Envelope`]s serialized as JSON objects tagged by `kind`.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::{BridgeError, Result};
use crate::port::PortListing;

/// Event sent from the bridge to clients
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Envelope {
    /// Bytes read from a serial port, tagged with the source port
    HardwareData {
        port: String,
        #[serde(with = "utf8_lossy")]
        data: Bytes,
    },
    /// Echo of a command accepted from a client
    Command { session: String, command: String },
    /// Diagnostic or system log line
    Log { line: String },
    /// Result of a `list` command
    List { ports: Vec<PortListing> },
    /// A serial port was opened
    Opened { port: String, baud: u32 },
    /// A serial port was closed (on request or because the device went away)
    Closed { port: String },
    /// Something failed; `port` is set when the failure concerns one port
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        port: Option<String>,
        message: String,
    },
}

/// Envelope discriminant, used for per-session filtering
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvelopeKind {
    HardwareData,
    Command,
    Log,
    List,
    Opened,
    Closed,
    Error,
}

impl Envelope {
    /// Build a hardware data envelope
    pub fn hardware_data(port: impl Into<String>, data: Bytes) -> Self {
        Envelope::HardwareData {
            port: port.into(),
            data,
        }
    }

    /// Build a log line envelope
    pub fn log(line: impl Into<String>) -> Self {
        Envelope::Log { line: line.into() }
    }

    /// Build an error envelope from a bridge error
    pub fn error(err: &BridgeError) -> Self {
        Envelope::Error {
            port: err.port().map(str::to_string),
            message: err.to_string(),
        }
    }

    /// Get the envelope kind
    pub fn kind(&self) -> EnvelopeKind {
        match self {
            Envelope::HardwareData { .. } => EnvelopeKind::HardwareData,
            Envelope::Command { .. } => EnvelopeKind::Command,
            Envelope::Log { .. } => EnvelopeKind::Log,
            Envelope::List { .. } => EnvelopeKind::List,
            Envelope::Opened { .. } => EnvelopeKind::Opened,
            Envelope::Closed { .. } => EnvelopeKind::Closed,
            Envelope::Error { .. } => EnvelopeKind::Error,
        }
    }

    /// Serialize to the wire format
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Hardware data travels as text; invalid UTF-8 is replaced, not rejected.
mod utf8_lossy {
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(data: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&String::from_utf8_lossy(data))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
        let text = String::deserialize(deserializer)?;
        Ok(Bytes::from(text))
    }
}

/// Command sent from a client to the bridge
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum Command {
    /// Open a serial port
    Open {
        port: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        baud: Option<u32>,
    },
    /// Close a serial port
    Close { port: String },
    /// Write data to an open serial port
    Send { port: String, data: String },
    /// List serial ports matching the configured filter
    List,
    /// Toggle log mode; `enabled = false` limits the session to log lines
    Log { enabled: bool },
    /// Release I/O buffers on every open connection
    Gc,
}

impl Command {
    /// Parse a command from a client text frame
    ///
    /// JSON objects are decoded by their `action` field. Anything else is
    /// read as a free-text command. Text that starts with no known verb is a
    /// log toggle when it contains `log on` or `log off`.
    pub fn parse(input: &str) -> Result<Command> {
        let input = input.trim();
        if input.is_empty() {
            return Err(BridgeError::InvalidCommand("empty command".to_string()));
        }

        if input.starts_with('{') {
            return serde_json::from_str(input)
                .map_err(|e| BridgeError::InvalidCommand(format!("{}: {}", input, e)));
        }

        let (verb, rest) = split_word(input);
        match verb.to_lowercase().as_str() {
            "list" => Ok(Command::List),
            "gc" => Ok(Command::Gc),
            "open" => {
                let (port, rest) = split_word(rest);
                let port = required_port(port, input)?;
                let (baud, _) = split_word(rest);
                let baud = if baud.is_empty() {
                    None
                } else {
                    Some(baud.parse::<u32>().map_err(|_| {
                        BridgeError::InvalidCommand(format!("invalid baud rate: {}", baud))
                    })?)
                };
                Ok(Command::Open { port, baud })
            }
            "close" => {
                let (port, _) = split_word(rest);
                Ok(Command::Close {
                    port: required_port(port, input)?,
                })
            }
            "send" => {
                let (port, data) = split_word(rest);
                Ok(Command::Send {
                    port: required_port(port, input)?,
                    data: data.to_string(),
                })
            }
            _ => parse_log_toggle(input),
        }
    }
}

fn parse_log_toggle(input: &str) -> Result<Command> {
    let lowered = input.to_lowercase();
    if lowered.contains("log off") {
        Ok(Command::Log { enabled: false })
    } else if lowered.contains("log on") {
        Ok(Command::Log { enabled: true })
    } else {
        Err(BridgeError::InvalidCommand(input.to_string()))
    }
}

/// Split off the first whitespace-delimited word
fn split_word(input: &str) -> (&str, &str) {
    let input = input.trim_start();
    match input.find(char::is_whitespace) {
        Some(idx) => (&input[..idx], input[idx..].trim_start()),
        None => (input, ""),
    }
}

fn required_port(port: &str, input: &str) -> Result<String> {
    if port.is_empty() {
        return Err(BridgeError::InvalidCommand(format!(
            "missing port in '{}'",
            input
        )));
    }
    Ok(port.to_string())
}
