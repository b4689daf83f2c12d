//! Program upload endpoint
//!
//! Uploads are stored under the data directory for an external flashing
//! tool to pick up. The bridge only accepts and stores them.

use crate::api::error::ApiError;
use crate::api::AppState;

use axum::{
    body::Bytes,
    extract::{Query, State},
    Json,
};
use serde::Deserialize;
use serialbridge_core::api::{ApiResponse, UploadResponse};
use serialbridge_core::{BridgeError, Result as BridgeResult};
use tokio::fs;
use tracing::{debug, info, warn};

/// Query parameters for uploads
#[derive(Debug, Deserialize)]
pub(crate) struct UploadQuery {
    filename: Option<String>,
    /// Serial port the program is meant for
    port: Option<String>,
}

/// Reject names that could escape the upload directory
fn validate_filename(name: &str) -> BridgeResult<()> {
    if name.trim().is_empty() {
        return Err(BridgeError::InvalidInput("filename cannot be empty".to_string()));
    }
    if name.contains('/') || name.contains('\\') || name.contains("..") || name.starts_with('.') {
        return Err(BridgeError::InvalidInput(format!(
            "invalid filename '{}'",
            name
        )));
    }
    Ok(())
}

/// Store an uploaded program.
///
/// # Endpoint
///
/// `POST /upload?filename=<name>[&port=<port>]`
///
/// The request body is the raw file content.
pub(crate) async fn upload(
    State(state): State<AppState>,
    Query(query): Query<UploadQuery>,
    body: Bytes,
) -> Result<Json<ApiResponse<UploadResponse>>, ApiError> {
    debug!("Request: POST /upload");

    let filename = query.filename.ok_or_else(|| {
        BridgeError::InvalidInput("missing 'filename' query parameter".to_string())
    })?;
    validate_filename(&filename)?;

    let target = state.config.static_config().upload_dir().join(&filename);
    if let Err(e) = fs::write(&target, &body).await {
        warn!("Failed to store {}: {}", target.display(), e);
        return Err(BridgeError::Io(e).into());
    }

    info!("Stored upload {} ({} bytes)", filename, body.len());
    let port_note = query
        .port
        .as_deref()
        .map(|p| format!(" for {}", p))
        .unwrap_or_default();
    state.hub.log_sender().send(format!(
        "Received upload {}{} ({} bytes)",
        filename,
        port_note,
        body.len()
    ));

    Ok(Json(ApiResponse::success(UploadResponse {
        filename,
        size: body.len(),
        port: query.port,
    })))
}
