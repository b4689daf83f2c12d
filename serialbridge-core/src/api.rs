//! API models for the bridge HTTP surface
//!
//! This module contains request and response models for `/info`,
//! `/upload` and the one-shot command endpoint.

use serde::{Deserialize, Serialize};

/// Generic API response wrapper
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status")]
pub enum ApiResponse<T> {
    #[serde(rename = "success")]
    Success { data: T },
    #[serde(rename = "error")]
    Error { error: String },
}

impl<T> ApiResponse<T> {
    /// Create a successful response
    pub fn success(data: T) -> Self {
        Self::Success { data }
    }

    /// Create an error response
    pub fn error(error: String) -> Self {
        Self::Error { error }
    }
}

/// Ports the listeners ended up bound to
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListenerPorts {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub http: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub https: Option<u16>,
}

impl ListenerPorts {
    /// Whether at least one listener is reachable
    pub fn any(&self) -> bool {
        self.http.is_some() || self.https.is_some()
    }
}

/// Update scheduler status
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateInfo {
    pub enabled: bool,
    pub in_progress: bool,
    /// Unix timestamp (seconds) of the last completed check
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_check: Option<u64>,
    /// Version waiting in the staging directory for a restart
    #[serde(skip_serializing_if = "Option::is_none")]
    pub staged_version: Option<String>,
}

/// Another bridge instance seen on the local network
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub hostname: String,
    pub address: String,
    pub ports: ListenerPorts,
    /// Seconds since the last announcement from this peer
    pub last_seen_secs: u64,
}

/// Process and version metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InfoResponse {
    pub version: String,
    pub git_revision: String,
    pub hostname: String,
    /// Server uptime in seconds
    pub uptime: u64,
    pub ports: ListenerPorts,
    /// Serial ports currently open
    pub open_ports: Vec<String>,
    /// Connected clients
    pub clients: usize,
    pub memory_mode: String,
    /// Buffer reclamation passes since startup
    pub reclaims: u64,
    pub update: UpdateInfo,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub peers: Vec<PeerInfo>,
}

/// Result of `POST /upload`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadResponse {
    pub filename: String,
    pub size: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_response_tagging() {
        let ok: ApiResponse<u32> = ApiResponse::success(7);
        let json = serde_json::to_value(&ok).unwrap();
        assert_eq!(json["status"], "success");
        assert_eq!(json["data"], 7);

        let err: ApiResponse<()> = ApiResponse::error("nope".to_string());
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["status"], "error");
        assert_eq!(json["error"], "nope");
    }

    #[test]
    fn test_listener_ports_any() {
        assert!(!ListenerPorts::default().any());
        assert!(ListenerPorts {
            http: None,
            https: Some(8991)
        }
        .any());
    }

    #[test]
    fn test_info_response_serialization() {
        let info = InfoResponse {
            version: "1.2.3".to_string(),
            git_revision: "abcdef0".to_string(),
            hostname: "bench".to_string(),
            uptime: 60,
            ports: ListenerPorts {
                http: Some(8990),
                https: None,
            },
            open_ports: vec!["/dev/ttyACM0".to_string()],
            clients: 2,
            memory_mode: "default".to_string(),
            reclaims: 0,
            update: UpdateInfo::default(),
            peers: Vec::new(),
        };

        let json = serde_json::to_string(&info).unwrap();
        assert!(json.contains("\"version\":\"1.2.3\""));
        assert!(json.contains("\"http\":8990"));
        assert!(!json.contains("https"));
        assert!(!json.contains("peers"));
    }
}
