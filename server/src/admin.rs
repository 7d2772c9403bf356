//! Admin Endpoint
//!
//! `GET /admin?key=K` guarded by the shared admin secret. Sub-actions via
//! `action`: `stats`, `logs`, and `ban&ip=…`.

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::json;

use crate::api::AppState;
use crate::observability;

/// Maximum log lines returned by `action=logs`.
const ADMIN_LOG_LIMIT: usize = 100;

/// Admin query params.
#[derive(Debug, Deserialize)]
pub struct AdminQuery {
    /// Shared admin secret.
    pub key: Option<String>,
    /// Sub-action: `stats`, `logs` or `ban`.
    pub action: Option<String>,
    /// Target IP for `action=ban`.
    pub ip: Option<String>,
}

/// Admin handler. 401 unless the key matches.
pub async fn handler(State(state): State<AppState>, Query(query): Query<AdminQuery>) -> Response {
    if query.key.as_deref() != Some(state.config.admin_key.as_str()) {
        return (StatusCode::UNAUTHORIZED, "unauthorized").into_response();
    }

    match query.action.as_deref() {
        Some("stats") => {
            let rooms = state.sfu.room_count().await;
            let users = state.sfu.user_count().await;
            Json(json!({
                "rooms": rooms,
                "users": users,
                "memory_rss_mb": observability::memory_rss_mb(),
                "tasks": observability::task_count(),
            }))
            .into_response()
        }
        Some("logs") => Json(state.log_ring.tail(ADMIN_LOG_LIMIT)).into_response(),
        Some("ban") => {
            let ip = query
                .ip
                .as_deref()
                .map(str::trim)
                .filter(|ip| !ip.is_empty());
            let Some(ip) = ip else {
                return (StatusCode::BAD_REQUEST, "missing ip").into_response();
            };

            state.banlist.ban(ip).await;
            state.sfu.kick_ip(ip).await;
            (StatusCode::OK, "banned").into_response()
        }
        _ => (StatusCode::BAD_REQUEST, "unknown action").into_response(),
    }
}
