//! Client Entry Pages
//!
//! Serves the client bundle's entry document for `/` and `/r/{room}` and
//! applies the security headers carried by every non-WebSocket response.
//! The SFU core does not depend on any of this.

use axum::extract::{Request, State};
use axum::http::{HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{Html, IntoResponse, Response};

use crate::api::AppState;

/// Serve the client entry document, 404 when no bundle is installed.
pub async fn index(State(state): State<AppState>) -> Response {
    let path = state.config.static_dir.join("index.html");
    match tokio::fs::read_to_string(&path).await {
        Ok(html) => Html(html).into_response(),
        Err(_) => (StatusCode::NOT_FOUND, "client bundle not installed").into_response(),
    }
}

/// Security headers for non-WS responses. The CSP restricts `connect-src`
/// to self plus the STUN/TURN schemes the client dials out to.
pub async fn security_headers(req: Request, next: Next) -> Response {
    let mut res = next.run(req).await;
    let headers = res.headers_mut();

    headers.insert(
        "X-Content-Type-Options",
        HeaderValue::from_static("nosniff"),
    );
    headers.insert("X-Frame-Options", HeaderValue::from_static("DENY"));
    headers.insert("Referrer-Policy", HeaderValue::from_static("no-referrer"));
    headers.insert(
        "Permissions-Policy",
        HeaderValue::from_static("microphone=(self)"),
    );
    headers.insert(
        "Content-Security-Policy",
        HeaderValue::from_static(
            "default-src 'self'; connect-src 'self' ws: wss: stun: turn: turns:; \
             media-src 'self' blob:; img-src 'self' data:",
        ),
    );

    res
}
