//! Negotiation Driver
//!
//! Serializes renegotiations per peer: one worker task at a time, offer
//! collisions resolved without interleaving, ICE restarts rate-limited,
//! and early ICE candidates buffered until a remote description exists.

use std::sync::Arc;

use tokio::time::{sleep, Duration, Instant};
use tracing::{debug, warn};
use webrtc::{
    ice_transport::ice_candidate::RTCIceCandidateInit,
    ice_transport::ice_connection_state::RTCIceConnectionState,
    peer_connection::{
        offer_answer_options::RTCOfferOptions,
        peer_connection_state::RTCPeerConnectionState,
        sdp::session_description::RTCSessionDescription,
        signaling_state::RTCSignalingState,
    },
};

use super::error::VoiceError;
use super::peer::Peer;
use crate::ws::ServerMessage;

/// Minimum spacing between granted ICE restarts on one peer.
const MIN_ICE_RESTART_INTERVAL: Duration = Duration::from_secs(15);

/// Poll interval while waiting for stable signaling + a remote description.
const STABLE_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Backoff after a failed offer cycle.
const RETRY_BACKOFF: Duration = Duration::from_millis(100);

/// How long ICE may sit in `disconnected` before a restart is requested.
const DISCONNECT_GRACE: Duration = Duration::from_secs(5);

/// Request a renegotiation for `peer`, optionally with fresh ICE
/// credentials. If a worker is already running it picks the request up;
/// otherwise one is spawned. Restart requests inside the rate-limit window
/// are rejected outright.
pub async fn request(peer: &Arc<Peer>, ice_restart: bool) {
    {
        let mut st = peer.negotiation.lock().await;

        if ice_restart {
            if let Some(at) = st.last_ice_restart {
                if at.elapsed() < MIN_ICE_RESTART_INTERVAL {
                    debug!(peer = %peer.id, "ICE restart rate-limited");
                    return;
                }
            }
            st.last_ice_restart = Some(Instant::now());
            st.ice_restart_pending = true;
        }

        st.pending = true;
        if st.in_progress {
            return;
        }
        st.in_progress = true;
    }

    let peer = peer.clone();
    tokio::spawn(async move {
        worker(peer).await;
    });
}

/// The single negotiation worker for one peer. Runs while work is pending
/// and the endpoint is alive; `in_progress` is cleared atomically with the
/// final pending check so a concurrent request cannot be lost.
async fn worker(peer: Arc<Peer>) {
    loop {
        if peer.is_done() || peer.pc.connection_state() == RTCPeerConnectionState::Closed {
            peer.negotiation.lock().await.in_progress = false;
            return;
        }

        {
            let mut st = peer.negotiation.lock().await;
            if !st.pending {
                st.in_progress = false;
                return;
            }
        }

        // Renegotiation needs a settled exchange: stable signaling and a
        // remote description from the initial offer round.
        if peer.pc.signaling_state() != RTCSignalingState::Stable
            || peer.pc.remote_description().await.is_none()
        {
            sleep(STABLE_POLL_INTERVAL).await;
            continue;
        }

        let ice_restart = {
            let mut st = peer.negotiation.lock().await;
            st.pending = false;
            st.making_offer = true;
            st.ice_restart_pending
        };

        let result = send_offer(&peer, ice_restart).await;

        {
            let mut st = peer.negotiation.lock().await;
            st.making_offer = false;
            if result.is_ok() {
                st.ice_restart_pending = false;
            } else {
                st.pending = true;
            }
        }

        if let Err(e) = result {
            warn!(peer = %peer.id, error = %e, "Offer cycle failed, retrying");
            sleep(RETRY_BACKOFF).await;
        }
    }
}

/// Create an offer, set it locally and send it down the signaling channel.
/// Used by the worker and for the initial offer right after admission.
pub async fn send_offer(peer: &Arc<Peer>, ice_restart: bool) -> Result<(), VoiceError> {
    let options = ice_restart.then(|| RTCOfferOptions {
        voice_activity_detection: false,
        ice_restart: true,
    });

    let offer = peer.pc.create_offer(options).await?;
    peer.pc.set_local_description(offer.clone()).await?;
    peer.write(&ServerMessage::Offer { sdp: offer.sdp }).await;

    Ok(())
}

/// Apply an inbound offer.
///
/// Collisions (we are mid-offer or in `have-local-offer`) cannot be rolled
/// back by the underlying stack, so the colliding offer is dropped and a
/// fresh server offer is scheduled for when the exchange settles; browsers
/// hold the rollback side of perfect negotiation. Collision-free offers are
/// answered in place.
pub async fn handle_offer(peer: &Arc<Peer>, sdp: String) -> Result<(), VoiceError> {
    let making_offer = peer.negotiation.lock().await.making_offer;
    let collision =
        making_offer || peer.pc.signaling_state() == RTCSignalingState::HaveLocalOffer;

    if collision {
        debug!(peer = %peer.id, "Offer collision, deferring to server offer");
        request(peer, false).await;
        return Ok(());
    }

    let offer =
        RTCSessionDescription::offer(sdp).map_err(|e| VoiceError::Signaling(e.to_string()))?;
    peer.pc.set_remote_description(offer).await?;
    drain_pending_candidates(peer).await;

    let answer = peer.pc.create_answer(None).await?;
    peer.pc.set_local_description(answer.clone()).await?;
    peer.write(&ServerMessage::Answer { sdp: answer.sdp }).await;

    Ok(())
}

/// Apply an inbound answer and drain any buffered candidates.
pub async fn handle_answer(peer: &Arc<Peer>, sdp: String) -> Result<(), VoiceError> {
    let answer =
        RTCSessionDescription::answer(sdp).map_err(|e| VoiceError::Signaling(e.to_string()))?;
    peer.pc.set_remote_description(answer).await?;
    drain_pending_candidates(peer).await;

    Ok(())
}

/// Apply an inbound ICE candidate, buffering it while no remote
/// description has been set yet.
pub async fn handle_candidate(
    peer: &Arc<Peer>,
    candidate: RTCIceCandidateInit,
) -> Result<(), VoiceError> {
    if peer.pc.remote_description().await.is_none() {
        peer.pending_candidates.lock().await.push(candidate);
        return Ok(());
    }

    peer.pc.add_ice_candidate(candidate).await?;
    Ok(())
}

/// Feed buffered candidates into the endpoint in arrival order.
async fn drain_pending_candidates(peer: &Arc<Peer>) {
    let drained: Vec<RTCIceCandidateInit> = {
        let mut pending = peer.pending_candidates.lock().await;
        pending.drain(..).collect()
    };

    for candidate in drained {
        if let Err(e) = peer.pc.add_ice_candidate(candidate).await {
            warn!(peer = %peer.id, error = %e, "Failed to apply buffered ICE candidate");
        }
    }
}

/// Install the ICE / peer-connection state handlers that drive restarts:
/// `failed` restarts immediately, `disconnected` restarts after a grace
/// period if the state has not recovered.
pub fn install_restart_handlers(peer: &Arc<Peer>) {
    let weak = Arc::downgrade(peer);
    peer.pc
        .on_ice_connection_state_change(Box::new(move |state: RTCIceConnectionState| {
            let weak = weak.clone();
            Box::pin(async move {
                let Some(peer) = weak.upgrade() else { return };

                match state {
                    RTCIceConnectionState::Failed => {
                        warn!(peer = %peer.id, "ICE failed, requesting restart");
                        request(&peer, true).await;
                    }
                    RTCIceConnectionState::Disconnected => {
                        let weak = Arc::downgrade(&peer);
                        tokio::spawn(async move {
                            sleep(DISCONNECT_GRACE).await;
                            let Some(peer) = weak.upgrade() else { return };
                            if !peer.is_done()
                                && peer.pc.ice_connection_state()
                                    == RTCIceConnectionState::Disconnected
                            {
                                warn!(peer = %peer.id, "ICE still disconnected, requesting restart");
                                request(&peer, true).await;
                            }
                        });
                    }
                    _ => {}
                }
            })
        }));

    let weak = Arc::downgrade(peer);
    peer.pc
        .on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let weak = weak.clone();
            Box::pin(async move {
                if state == RTCPeerConnectionState::Failed {
                    if let Some(peer) = weak.upgrade() {
                        warn!(peer = %peer.id, "Peer connection failed, requesting ICE restart");
                        request(&peer, true).await;
                    }
                }
            })
        }));
}
