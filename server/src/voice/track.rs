//! Track Forwarding
//!
//! One [`TrackForwarder`] per publishing peer: reads RTP from the
//! publisher's upstream track once and fans the packets out to every
//! subscriber's downstream track.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, Weak};

use tokio::sync::RwLock;
use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;
use webrtc::{
    rtp_transceiver::rtp_codec::RTCRtpCodecCapability,
    track::track_local::{track_local_static_rtp::TrackLocalStaticRTP, TrackLocal, TrackLocalWriter},
    track::track_remote::TrackRemote,
};

use super::error::VoiceError;
use super::negotiation;
use super::peer::Peer;
use super::sfu::Room;

/// RTP read buffer size, one MTU.
pub(crate) const RTP_MTU: usize = 1500;

/// Minimum spacing between write-error warnings for one subscriber.
const WRITE_WARN_INTERVAL: Duration = Duration::from_secs(5);

/// A subscriber's downstream track plus its warn-throttle state.
struct Subscriber {
    track: Arc<TrackLocalStaticRTP>,
    /// Last time a non-fatal write error was logged for this subscriber.
    last_warn: StdMutex<Option<Instant>>,
}

/// Single-reader, multi-writer RTP fan-out for one publisher.
pub struct TrackForwarder {
    /// The publishing peer.
    pub sender_id: Uuid,
    upstream: Arc<TrackRemote>,
    /// Map: receiver peer id -> subscriber entry.
    subscribers: RwLock<HashMap<Uuid, Arc<Subscriber>>>,
    done: CancellationToken,
}

impl TrackForwarder {
    /// Create a forwarder for a publisher's upstream track.
    pub fn new(sender_id: Uuid, upstream: Arc<TrackRemote>) -> Self {
        Self {
            sender_id,
            upstream,
            subscribers: RwLock::new(HashMap::new()),
            done: CancellationToken::new(),
        }
    }

    /// Codec parameters of the upstream track, copied onto downstream tracks.
    pub fn upstream_codec(&self) -> RTCRtpCodecCapability {
        let capability = self.upstream.codec().capability;
        RTCRtpCodecCapability {
            mime_type: capability.mime_type,
            clock_rate: capability.clock_rate,
            channels: capability.channels,
            sdp_fmtp_line: capability.sdp_fmtp_line,
            rtcp_feedback: vec![],
        }
    }

    /// Register a subscriber. Idempotent; replaces any prior entry for the
    /// same receiver. A forwarder never subscribes its own sender.
    pub async fn subscribe(&self, receiver_id: Uuid, track: Arc<TrackLocalStaticRTP>) {
        if receiver_id == self.sender_id {
            return;
        }

        let mut subs = self.subscribers.write().await;
        subs.insert(
            receiver_id,
            Arc::new(Subscriber {
                track,
                last_warn: StdMutex::new(None),
            }),
        );

        debug!(sender = %self.sender_id, receiver = %receiver_id, "Subscribed to forwarder");
    }

    /// Remove a subscriber and its error state. Idempotent.
    pub async fn unsubscribe(&self, receiver_id: Uuid) {
        let mut subs = self.subscribers.write().await;
        if subs.remove(&receiver_id).is_some() {
            debug!(sender = %self.sender_id, receiver = %receiver_id, "Unsubscribed from forwarder");
        }
    }

    /// Number of current subscribers.
    pub async fn subscriber_count(&self) -> usize {
        self.subscribers.read().await.len()
    }

    /// Signal the read loop to terminate. Idempotent.
    pub fn stop(&self) {
        self.done.cancel();
    }

    /// Whether the forwarder has been asked to stop.
    pub fn is_stopped(&self) -> bool {
        self.done.is_cancelled()
    }

    /// Read-and-fan-out loop. Terminates on upstream read error (treated as
    /// end-of-stream) or on [`TrackForwarder::stop`].
    pub async fn run(&self) {
        let mut buf = vec![0u8; RTP_MTU];

        loop {
            tokio::select! {
                () = self.done.cancelled() => break,
                res = self.upstream.read(&mut buf) => match res {
                    Ok((packet, _attributes)) => self.fan_out(&packet).await,
                    Err(e) => {
                        debug!(sender = %self.sender_id, error = %e, "Upstream track ended");
                        break;
                    }
                },
            }
        }
    }

    /// Write one packet to every current subscriber. The subscriber map is
    /// snapshotted before writing so a concurrent mutation cannot deadlock
    /// the iteration or be skipped.
    async fn fan_out(&self, packet: &webrtc::rtp::packet::Packet) {
        let targets: Vec<(Uuid, Arc<Subscriber>)> = {
            let subs = self.subscribers.read().await;
            subs.iter().map(|(id, sub)| (*id, sub.clone())).collect()
        };

        for (receiver_id, sub) in targets {
            if let Err(e) = sub.track.write_rtp(packet).await {
                if is_closed_write_error(&e) {
                    // The subscriber's endpoint is gone; drop it now.
                    debug!(
                        sender = %self.sender_id,
                        receiver = %receiver_id,
                        "Subscriber endpoint closed, removing"
                    );
                    self.unsubscribe(receiver_id).await;
                } else if should_warn(&sub.last_warn) {
                    warn!(
                        sender = %self.sender_id,
                        receiver = %receiver_id,
                        error = %e,
                        "Failed to forward RTP packet"
                    );
                }
            }
        }
    }
}

/// Whether a write error means the subscriber's endpoint is closed.
fn is_closed_write_error(err: &webrtc::Error) -> bool {
    matches!(
        err,
        webrtc::Error::ErrClosedPipe | webrtc::Error::ErrConnectionClosed
    )
}

/// At most one warning per subscriber per [`WRITE_WARN_INTERVAL`].
fn should_warn(last_warn: &StdMutex<Option<Instant>>) -> bool {
    let Ok(mut last) = last_warn.lock() else {
        return false;
    };
    let now = Instant::now();
    match *last {
        Some(at) if now.duration_since(at) < WRITE_WARN_INTERVAL => false,
        _ => {
            *last = Some(now);
            true
        }
    }
}

/// Spawn the forwarder's read loop on a dedicated worker. When the loop
/// ends — upstream end-of-stream or an explicit stop — the forwarder is
/// removed from the room, unless it has already been replaced.
pub fn spawn_forwarder(forwarder: Arc<TrackForwarder>, room: Weak<Room>) {
    tokio::spawn(async move {
        forwarder.run().await;

        if let Some(room) = room.upgrade() {
            room.remove_forwarder_if(forwarder.sender_id, &forwarder).await;
        }

        debug!(sender = %forwarder.sender_id, "Forwarder stopped");
    });
}

/// Subscribe `peer` to `forwarder`'s stream.
///
/// Reuses the peer's existing downstream track for this sender when one
/// exists (resubscribe after a publisher restart), otherwise creates one
/// with the upstream codec, stream id = sender id, and adds it to the
/// peer's endpoint before requesting renegotiation.
pub async fn subscribe_peer(
    forwarder: &Arc<TrackForwarder>,
    peer: &Arc<Peer>,
) -> Result<(), VoiceError> {
    if peer.id == forwarder.sender_id {
        return Ok(());
    }

    // Fast path: an existing track handles races between attach-existing
    // on join and broadcast-new on publish.
    {
        let tracks = peer.outbound_tracks.read().await;
        if let Some(existing) = tracks.get(&forwarder.sender_id) {
            forwarder.subscribe(peer.id, existing.clone()).await;
            return Ok(());
        }
    }

    let track = {
        let mut tracks = peer.outbound_tracks.write().await;
        if let Some(existing) = tracks.get(&forwarder.sender_id) {
            existing.clone()
        } else {
            let track = Arc::new(TrackLocalStaticRTP::new(
                forwarder.upstream_codec(),
                format!("{}-audio", forwarder.sender_id),
                forwarder.sender_id.to_string(),
            ));

            let rtp_sender = peer
                .pc
                .add_track(track.clone() as Arc<dyn TrackLocal + Send + Sync>)
                .await?;

            // Drain RTCP on the new sender so its buffers never stall.
            tokio::spawn(async move {
                let mut rtcp_buf = vec![0u8; RTP_MTU];
                while let Ok((_, _)) = rtp_sender.read(&mut rtcp_buf).await {}
            });

            tracks.insert(forwarder.sender_id, track.clone());
            track
        }
    };

    forwarder.subscribe(peer.id, track).await;
    negotiation::request(peer, false).await;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn write_warnings_are_throttled() {
        tokio::time::pause();
        let last_warn = StdMutex::new(None);

        assert!(should_warn(&last_warn));
        assert!(!should_warn(&last_warn));

        tokio::time::advance(Duration::from_secs(4)).await;
        assert!(!should_warn(&last_warn));

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(should_warn(&last_warn));
    }

    #[test]
    fn closed_pipe_is_a_closed_write_error() {
        assert!(is_closed_write_error(&webrtc::Error::ErrClosedPipe));
        assert!(is_closed_write_error(&webrtc::Error::ErrConnectionClosed));
        assert!(!is_closed_write_error(&webrtc::Error::ErrUnknownType));
    }
}
