//! WebRTC Peer Connection Management
//!
//! Wraps `RTCPeerConnection` plus the per-connection signaling state for
//! each participant in a room.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::ws::Message;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use uuid::Uuid;
use webrtc::{
    api::API,
    ice_transport::ice_candidate::RTCIceCandidateInit,
    peer_connection::{configuration::RTCConfiguration, RTCPeerConnection},
    rtp_transceiver::{
        rtp_codec::RTPCodecType, rtp_transceiver_direction::RTCRtpTransceiverDirection,
        RTCRtpTransceiverInit,
    },
    track::track_local::track_local_static_rtp::TrackLocalStaticRTP,
};

use super::error::VoiceError;
use crate::ws::ServerMessage;

/// Negotiation flag block. Guarded by [`Peer::negotiation`]; never held
/// across SDP operations or network sends.
#[derive(Debug, Default)]
pub struct NegotiationState {
    /// A renegotiation has been requested and not yet carried out.
    pub pending: bool,
    /// A negotiation worker task is currently running.
    pub in_progress: bool,
    /// The worker is between `create_offer` and answer application.
    pub making_offer: bool,
    /// The next offer must carry fresh ICE credentials.
    pub ice_restart_pending: bool,
    /// When the last ICE restart was granted, for rate limiting.
    pub last_ice_restart: Option<Instant>,
}

/// One connected participant: identity, signaling channel and media endpoint.
pub struct Peer {
    /// Opaque peer id.
    pub id: Uuid,
    /// Display name (validated at admission).
    pub name: String,
    /// Derived client IP, used for ban enforcement.
    pub ip: String,
    /// Room this peer belongs to.
    pub room_id: String,
    /// The WebRTC peer connection.
    pub pc: Arc<RTCPeerConnection>,
    /// Downstream tracks forwarding other senders' audio to this peer.
    /// Map: sender peer id -> local track.
    pub outbound_tracks: RwLock<HashMap<Uuid, Arc<TrackLocalStaticRTP>>>,
    /// Negotiation flags.
    pub negotiation: Mutex<NegotiationState>,
    /// ICE candidates received before the remote description was set.
    pub pending_candidates: Mutex<Vec<RTCIceCandidateInit>>,
    /// Whether this peer reported itself muted.
    pub muted: RwLock<bool>,
    /// Admission time.
    pub joined_at: Instant,
    /// Channel into the per-connection writer task; the single consumer
    /// serializes all outbound frames.
    signal_tx: mpsc::Sender<Message>,
    /// Cancelled exactly once on teardown; observed by the ping loop, the
    /// negotiation worker and the signaling read loop.
    done: CancellationToken,
}

impl Peer {
    /// Create a new peer with a fresh WebRTC connection.
    pub async fn new(
        id: Uuid,
        name: String,
        ip: String,
        room_id: String,
        api: &API,
        config: RTCConfiguration,
        signal_tx: mpsc::Sender<Message>,
    ) -> Result<Self, VoiceError> {
        let pc = api.new_peer_connection(config).await?;

        Ok(Self {
            id,
            name,
            ip,
            room_id,
            pc: Arc::new(pc),
            outbound_tracks: RwLock::new(HashMap::new()),
            negotiation: Mutex::new(NegotiationState::default()),
            pending_candidates: Mutex::new(Vec::new()),
            muted: RwLock::new(false),
            joined_at: Instant::now(),
            signal_tx,
            done: CancellationToken::new(),
        })
    }

    /// Add a recvonly audio transceiver so the client can publish its track.
    pub async fn add_recv_transceiver(&self) -> Result<(), VoiceError> {
        self.pc
            .add_transceiver_from_kind(
                RTPCodecType::Audio,
                Some(RTCRtpTransceiverInit {
                    direction: RTCRtpTransceiverDirection::Recvonly,
                    send_encodings: vec![],
                }),
            )
            .await?;
        Ok(())
    }

    /// Serialize and enqueue a signaling frame. Transport errors are logged
    /// and the frame dropped; a dead channel means teardown is under way.
    pub async fn write(&self, msg: &ServerMessage) {
        let json = match serde_json::to_string(msg) {
            Ok(json) => json,
            Err(e) => {
                warn!(peer = %self.id, error = %e, "Failed to serialize signaling frame");
                return;
            }
        };

        if let Err(e) = self.signal_tx.send(Message::Text(json.into())).await {
            warn!(peer = %self.id, error = %e, "Failed to enqueue signaling frame");
        }
    }

    /// Signal teardown. Idempotent; cancels the ping loop and the
    /// negotiation worker at their next checkpoint.
    pub fn signal_done(&self) {
        self.done.cancel();
    }

    /// Clone of the done token for worker tasks.
    pub fn done(&self) -> CancellationToken {
        self.done.clone()
    }

    /// Whether teardown has been signalled.
    pub fn is_done(&self) -> bool {
        self.done.is_cancelled()
    }

    /// Set mute state.
    pub async fn set_muted(&self, muted: bool) {
        *self.muted.write().await = muted;
    }

    /// Get mute state.
    pub async fn is_muted(&self) -> bool {
        *self.muted.read().await
    }

    /// Close the media endpoint.
    pub async fn close(&self) -> Result<(), VoiceError> {
        self.pc.close().await?;
        Ok(())
    }
}
