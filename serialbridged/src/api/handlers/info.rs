//! Process information endpoint

use crate::api::error::ApiError;
use crate::api::AppState;

use axum::{extract::State, Json};
use serialbridge_core::api::{ApiResponse, InfoResponse};
use tracing::debug;

/// Retrieve version and runtime information.
///
/// # Endpoint
///
/// `GET /info`
///
/// # Returns
///
/// - `version` - Daemon version
/// - `git_revision` - Revision baked in at build time, `unknown` otherwise
/// - `hostname` - Hostname reported to clients
/// - `uptime` - Server uptime in seconds
/// - `ports` - Listener ports in use
/// - `open_ports` - Serial ports currently open
/// - `clients` - Connected WebSocket clients
/// - `memory_mode` / `reclaims` - Buffer reclamation policy and pass count
/// - `update` - Update scheduler status
/// - `peers` - Other bridges heard on the LAN
pub(crate) async fn get_info(
    State(state): State<AppState>,
) -> Result<Json<ApiResponse<InfoResponse>>, ApiError> {
    debug!("Request: GET /info");

    let serial = state.hub.serial();
    let peers = match &state.peers {
        Some(peers) => peers.snapshot().await,
        None => Vec::new(),
    };

    let info = InfoResponse {
        version: env!("CARGO_PKG_VERSION").to_string(),
        git_revision: option_env!("SERIALBRIDGE_GIT_REV")
            .unwrap_or("unknown")
            .to_string(),
        hostname: state.hostname.clone(),
        uptime: state.start_time.elapsed().as_secs(),
        ports: state.ports,
        open_ports: serial.open_ports().await,
        clients: state.hub.client_count().await,
        memory_mode: serial.policy().mode().to_string(),
        reclaims: serial.policy().reclaims(),
        update: state.update.info(state.config.updates_enabled()),
        peers,
    };

    Ok(Json(ApiResponse::success(info)))
}
