//! API Router and Application State
//!
//! Central routing configuration and shared state.

use std::sync::Arc;

use axum::middleware::from_fn;
use axum::routing::get;
use axum::Router;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;

use crate::banlist::BanList;
use crate::config::Config;
use crate::observability::LogRing;
use crate::voice::SfuServer;
use crate::{admin, pages, ws};

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    /// Server configuration.
    pub config: Arc<Config>,
    /// SFU: room registry and media plumbing.
    pub sfu: Arc<SfuServer>,
    /// Banned client IPs.
    pub banlist: Arc<BanList>,
    /// Recent-logs ring served by the admin endpoint.
    pub log_ring: LogRing,
}

/// Create the main application router. Security headers cover every route
/// except the WebSocket upgrade.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(pages::index))
        .route("/r/{room}", get(pages::index))
        .nest_service("/static", ServeDir::new(&state.config.static_dir))
        .route("/admin", get(admin::handler))
        .layer(from_fn(pages::security_headers))
        .route("/ws", get(ws::handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
