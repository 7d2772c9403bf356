//! Voice Service Errors

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;
use uuid::Uuid;

/// Errors that can occur during SFU operations.
#[derive(Debug, Error)]
pub enum VoiceError {
    /// Room not found.
    #[error("Room not found: {0}")]
    RoomNotFound(String),

    /// Peer not found.
    #[error("Peer not found: {0}")]
    PeerNotFound(Uuid),

    /// Room is at capacity.
    #[error("Room is full (max: {max_peers})")]
    RoomFull {
        /// Maximum allowed peers.
        max_peers: usize,
    },

    /// Invalid admission parameters (room id or nickname).
    #[error("Invalid request: {0}")]
    BadRequest(String),

    /// Client IP is banned.
    #[error("Banned")]
    Banned,

    /// Cross-origin upgrade rejected.
    #[error("Origin not allowed")]
    OriginDenied,

    /// WebRTC error.
    #[error("WebRTC error: {0}")]
    WebRtc(String),

    /// I/O error (RTC socket binding, ban list persistence).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Signaling error.
    #[error("Signaling error: {0}")]
    Signaling(String),
}

impl IntoResponse for VoiceError {
    fn into_response(self) -> Response {
        let status = match &self {
            Self::RoomNotFound(_) | Self::PeerNotFound(_) => StatusCode::NOT_FOUND,
            Self::RoomFull { .. } => StatusCode::CONFLICT,
            Self::BadRequest(_) | Self::Signaling(_) => StatusCode::BAD_REQUEST,
            Self::Banned | Self::OriginDenied => StatusCode::FORBIDDEN,
            Self::WebRtc(_) | Self::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        (status, self.to_string()).into_response()
    }
}

impl From<webrtc::Error> for VoiceError {
    fn from(err: webrtc::Error) -> Self {
        Self::WebRtc(err.to_string())
    }
}
