//! Sotto Server - Main Entry Point
//!
//! SFU backend for anonymous voice rooms.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;
use tracing_subscriber::EnvFilter;

use sotto_server::api::{self, AppState};
use sotto_server::banlist::BanList;
use sotto_server::config::Config;
use sotto_server::observability::{LogRing, RingLayer};
use sotto_server::voice::SfuServer;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize rustls crypto provider (required for DTLS-SRTP).
    // This must happen before any WebRTC operations.
    let _ = rustls::crypto::CryptoProvider::install_default(
        rustls::crypto::ring::default_provider(),
    );

    dotenvy::dotenv().ok();
    let config = Config::parse();

    let log_ring = LogRing::new();
    init_tracing(&config, log_ring.clone())?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        "Starting Sotto Server"
    );

    let config = Arc::new(config);
    let banlist = Arc::new(BanList::load(config.ban_file()).await);
    let sfu = Arc::new(SfuServer::new(config.clone()).await?);
    let _reaper = sfu.spawn_reaper();

    let state = AppState {
        config: config.clone(),
        sfu,
        banlist,
        log_ring,
    };
    let app = api::create_router(state);

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.port)).await?;
    info!(address = %listener.local_addr()?, "Server listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    info!("Server shutdown complete");

    Ok(())
}

/// JSON-lines on stdout, the admin log ring, and optionally a log file.
fn init_tracing(config: &Config, ring: LogRing) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "sotto_server=debug,tower_http=info".into());

    let registry = tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().json())
        .with(RingLayer::new(ring));

    if let Some(path) = &config.log_file {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_ansi(false)
                    .with_writer(Arc::new(file)),
            )
            .init();
    } else {
        registry.init();
    }

    Ok(())
}

/// Resolve on SIGINT or SIGTERM: stop accepting connections and let
/// existing peers drain.
async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Received shutdown signal, closing listener");
}
