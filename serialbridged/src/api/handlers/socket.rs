//! Bidirectional protocol endpoint
//!
//! `GET /socket.io/` upgrades to a WebSocket session registered with the
//! client hub. `POST /socket.io/` runs a single command and returns its
//! direct replies.

use crate::api::AppState;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
    Json,
};
use futures_util::{SinkExt, StreamExt};
use serialbridge_core::Envelope;
use tracing::{debug, warn};

use crate::hub::ClientSession;

/// Upgrade to a WebSocket session.
///
/// # Endpoint
///
/// `GET /socket.io/`
pub(crate) async fn upgrade(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    debug!("Request: GET /socket.io/ (upgrade)");
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let capacity = state.config.static_config().server.client_queue;
    let (session, mut outbound) = ClientSession::new(capacity);
    let id = match state.hub.register(session).await {
        Ok(id) => id,
        Err(e) => {
            warn!("Refusing WebSocket client: {}", e);
            return;
        }
    };

    let (mut sink, mut stream) = socket.split();

    // Ends when the hub drops the session (overflow, shutdown) or the peer
    // stops accepting frames.
    let mut writer = tokio::spawn(async move {
        while let Some(text) = outbound.recv().await {
            if sink.send(Message::Text(text.to_string())).await.is_err() {
                break;
            }
        }
        let _ = sink.send(Message::Close(None)).await;
    });

    let hub = state.hub.clone();
    let mut reader = tokio::spawn(async move {
        while let Some(frame) = stream.next().await {
            match frame {
                Ok(Message::Text(text)) => hub.route_inbound(id, &text).await,
                Ok(Message::Binary(data)) => match String::from_utf8(data) {
                    Ok(text) => hub.route_inbound(id, &text).await,
                    Err(_) => debug!("Ignoring non-UTF-8 frame from {}", id),
                },
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(e) => {
                    debug!("WebSocket error from {}: {}", id, e);
                    break;
                }
            }
        }
    });

    tokio::select! {
        _ = &mut writer => reader.abort(),
        _ = &mut reader => writer.abort(),
    }

    state.hub.unregister(id).await;
}

/// Run one command outside a session.
///
/// # Endpoint
///
/// `POST /socket.io/`
///
/// The body is a command in JSON or free-text form. The response is the
/// JSON array of replies addressed to the caller; broadcasts still go to
/// every connected session.
pub(crate) async fn command(State(state): State<AppState>, body: String) -> Json<Vec<Envelope>> {
    debug!("Request: POST /socket.io/");
    Json(state.hub.execute(&body).await)
}

#[cfg(test)]
mod tests {
    use crate::api::test_support::{body_string, TestApp};
    use axum::{
        body::Body,
        http::{Method, Request, StatusCode},
    };
    use tower::ServiceExt;

    async fn post_command(app: &TestApp, body: &str) -> serde_json::Value {
        let response = app
            .router()
            .oneshot(
                Request::builder()
                    .method(Method::POST)
                    .uri("/socket.io/")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        serde_json::from_str(&body_string(response.into_body()).await).unwrap()
    }

    #[tokio::test]
    async fn test_post_list() {
        let app = TestApp::new();
        app.backend.add_port("/dev/ttyACM0");
        app.backend.add_port("/dev/ttyS0");

        let replies = post_command(&app, "list").await;
        let replies = replies.as_array().unwrap();
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0]["kind"], "list");

        let ports = replies[0]["ports"].as_array().unwrap();
        let acm = ports.iter().find(|p| p["name"] == "/dev/ttyACM0").unwrap();
        assert_eq!(acm["matches_filter"], true);
        assert_eq!(acm["is_open"], false);
    }

    #[tokio::test]
    async fn test_post_open_then_error() {
        let app = TestApp::new();
        app.backend.add_port("/dev/ttyACM0");
        let _device = app.backend.attach("/dev/ttyACM0");

        let replies = post_command(&app, r#"{"action":"open","port":"/dev/ttyACM0"}"#).await;
        assert_eq!(replies.as_array().unwrap().len(), 0);
        assert!(app.state.hub.serial().is_open("/dev/ttyACM0").await);

        let replies = post_command(&app, "open /dev/ttyACM0").await;
        assert_eq!(replies[0]["kind"], "error");
        assert_eq!(replies[0]["port"], "/dev/ttyACM0");

        app.state.hub.serial().close_all().await;
    }

    #[tokio::test]
    async fn test_post_garbage_is_error_reply() {
        let app = TestApp::new();
        let replies = post_command(&app, "frobnicate").await;
        assert_eq!(replies[0]["kind"], "error");
    }

    #[tokio::test]
    async fn test_get_without_upgrade_is_rejected() {
        let app = TestApp::new();
        let response = app
            .router()
            .oneshot(
                Request::builder()
                    .uri("/socket.io/")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert!(response.status().is_client_error());
    }

    #[tokio::test]
    async fn test_cors_preflight_allows_localhost_range() {
        let app = TestApp::new();
        for origin in ["http://localhost:8991", "https://ide.example.com"] {
            let response = app
                .router()
                .oneshot(
                    Request::builder()
                        .method(Method::OPTIONS)
                        .uri("/info")
                        .header("origin", origin)
                        .header("access-control-request-method", "GET")
                        .body(Body::empty())
                        .unwrap(),
                )
                .await
                .unwrap();
            assert_eq!(
                response
                    .headers()
                    .get("access-control-allow-origin")
                    .unwrap(),
                origin
            );
            assert_eq!(
                response
                    .headers()
                    .get("access-control-allow-credentials")
                    .unwrap(),
                "true"
            );
        }
    }
}
