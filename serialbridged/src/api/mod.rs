//! HTTP and WebSocket surface
//!
//! Contains the axum router, shared handler state, and error mapping.

pub(crate) mod handlers;

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    extract::DefaultBodyLimit,
    http::{header, HeaderValue, Method},
    routing::get,
    Router,
};
use serialbridge_core::api::ListenerPorts;
use tower::ServiceBuilder;
use tower_http::{
    cors::{AllowOrigin, CorsLayer},
    trace::TraceLayer,
};
use tracing::{info, warn};

use crate::config::RuntimeConfig;
use crate::discovery::PeerTable;
use crate::hub::ClientHub;
use crate::update::UpdateState;

/// Application state shared across all handlers
#[derive(Clone)]
pub struct AppState {
    pub hub: Arc<ClientHub>,
    pub config: Arc<RuntimeConfig>,
    pub update: Arc<UpdateState>,
    /// Peers heard by the discovery listener, when discovery runs
    pub peers: Option<Arc<PeerTable>>,
    /// Ports the listeners ended up on
    pub ports: ListenerPorts,
    /// Hostname reported to clients
    pub hostname: String,
    /// Server start time for uptime calculation
    pub start_time: Instant,
}

impl AppState {
    pub fn new(
        hub: Arc<ClientHub>,
        config: Arc<RuntimeConfig>,
        update: Arc<UpdateState>,
        peers: Option<Arc<PeerTable>>,
        ports: ListenerPorts,
    ) -> Self {
        let hostname = config.hostname();
        Self {
            hub,
            config,
            update,
            peers,
            ports,
            hostname,
            start_time: Instant::now(),
        }
    }
}

/// Origins allowed to call the bridge from a browser: the configured ones
/// plus `http(s)://localhost` on every port of the listener range.
pub fn allowed_origins(config: &RuntimeConfig) -> Vec<HeaderValue> {
    let server = &config.static_config().server;
    let mut origins: Vec<String> = server.origins.clone();
    for port in server.port_low..=server.port_high {
        origins.push(format!("http://localhost:{}", port));
        origins.push(format!("https://localhost:{}", port));
    }

    origins
        .into_iter()
        .filter_map(|origin| match HeaderValue::from_str(&origin) {
            Ok(value) => Some(value),
            Err(_) => {
                warn!("Ignoring invalid origin: {}", origin);
                None
            }
        })
        .collect()
}

/// Create the router with all endpoints
pub fn create_router(state: AppState) -> Router {
    info!("Setting up API router...");

    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::list(allowed_origins(&state.config)))
        .allow_methods([Method::GET, Method::PUT, Method::POST, Method::DELETE])
        .allow_headers([header::ORIGIN, header::AUTHORIZATION, header::CONTENT_TYPE])
        .allow_credentials(true)
        .max_age(Duration::from_secs(50));

    let upload_limit = state.config.static_config().server.upload_limit;
    let middleware_stack = ServiceBuilder::new()
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .layer(DefaultBodyLimit::max(upload_limit));

    Router::new()
        .route("/", get(handlers::home::home))
        .route("/info", get(handlers::info::get_info))
        .route(
            "/upload",
            axum::routing::post(handlers::upload::upload),
        )
        .route(
            "/socket.io/",
            get(handlers::socket::upgrade).post(handlers::socket::command),
        )
        .layer(middleware_stack)
        .with_state(state)
}

/// Error handling utilities
pub(crate) mod error {
    use axum::{
        http::StatusCode,
        response::{IntoResponse, Response},
        Json,
    };
    use serialbridge_core::api::ApiResponse;
    use serialbridge_core::BridgeError;
    use tracing::error;

    /// Error type for API responses
    #[derive(Debug)]
    pub struct ApiError {
        pub status_code: StatusCode,
        pub message: String,
    }

    impl ApiError {
        pub fn new(status_code: StatusCode, message: impl Into<String>) -> Self {
            Self {
                status_code,
                message: message.into(),
            }
        }

        pub fn bad_request(message: impl Into<String>) -> Self {
            Self::new(StatusCode::BAD_REQUEST, message)
        }

        pub fn internal_error(message: impl Into<String>) -> Self {
            Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
        }
    }

    impl IntoResponse for ApiError {
        fn into_response(self) -> Response {
            error!("API Error {}: {}", self.status_code, self.message);

            let response: ApiResponse<()> = ApiResponse::error(self.message);

            (self.status_code, Json(response)).into_response()
        }
    }

    impl From<BridgeError> for ApiError {
        fn from(err: BridgeError) -> Self {
            match err {
                BridgeError::InvalidCommand(_) | BridgeError::InvalidInput(_) => {
                    Self::bad_request(err.to_string())
                }
                _ => Self::internal_error(err.to_string()),
            }
        }
    }

}
