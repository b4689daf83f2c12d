//! Console page

use axum::response::Html;
use tracing::debug;

const CONSOLE_PAGE: &str = include_str!("../../../assets/console.html");

/// Serve the embedded diagnostic console.
///
/// # Endpoint
///
/// `GET /`
pub(crate) async fn home() -> Html<&'static str> {
    debug!("Request: GET /");
    Html(CONSOLE_PAGE)
}

#[cfg(test)]
mod tests {
    use crate::api::test_support::{body_string, TestApp};
    use axum::{body::Body, http::Request, http::StatusCode};
    use tower::ServiceExt;

    #[tokio::test]
    async fn test_home_serves_console() {
        let app = TestApp::new();
        let response = app
            .router()
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let content_type = response
            .headers()
            .get("content-type")
            .unwrap()
            .to_str()
            .unwrap()
            .to_string();
        assert!(content_type.starts_with("text/html"));

        let body = body_string(response.into_body()).await;
        assert!(body.contains("/socket.io/"));
    }
}
