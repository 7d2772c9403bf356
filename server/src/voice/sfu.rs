//! Selective Forwarding Unit Implementation
//!
//! Manages ephemeral voice rooms and WebRTC peer connections. The server
//! never decodes media; each publisher's RTP stream is read once and
//! duplicated to every other subscriber in the room.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::sync::RwLock;
use tokio::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice::udp_mux::{UDPMuxDefault, UDPMuxParams};
use webrtc::ice::udp_network::UDPNetwork;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::rtp_transceiver::rtp_codec::{
    RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType,
};

use super::error::VoiceError;
use super::negotiation;
use super::peer::Peer;
use super::track::{spawn_forwarder, subscribe_peer, TrackForwarder};
use crate::config::Config;
use crate::ws::{PeerInfo, ServerMessage};

/// Reaper pass interval.
pub(crate) const REAP_INTERVAL: Duration = Duration::from_secs(60);

/// How long a room may sit empty before it is reaped.
pub(crate) const ROOM_IDLE_TIMEOUT: Duration = Duration::from_secs(2 * 60 * 60);

/// An ephemeral voice room: its peers and its per-sender forwarders.
pub struct Room {
    /// Room identifier.
    pub id: String,
    /// Connected peers.
    pub peers: RwLock<HashMap<Uuid, Arc<Peer>>>,
    /// Fan-out engines, one per publishing peer.
    pub forwarders: RwLock<HashMap<Uuid, Arc<TrackForwarder>>>,
    /// When the peer set last became empty. Initialized to creation time.
    last_empty: RwLock<Instant>,
    /// Creation time.
    pub created_at: Instant,
    /// Maximum peers allowed.
    max_peers: usize,
}

impl Room {
    /// Create a new empty room.
    #[must_use]
    pub fn new(id: String, max_peers: usize) -> Self {
        let now = Instant::now();
        Self {
            id,
            peers: RwLock::new(HashMap::new()),
            forwarders: RwLock::new(HashMap::new()),
            last_empty: RwLock::new(now),
            created_at: now,
            max_peers,
        }
    }

    /// Add a peer. The capacity check and the insert happen under one
    /// write-lock hold.
    pub async fn add_peer(&self, peer: Arc<Peer>) -> Result<(), VoiceError> {
        let mut peers = self.peers.write().await;

        if peers.len() >= self.max_peers {
            return Err(VoiceError::RoomFull {
                max_peers: self.max_peers,
            });
        }

        peers.insert(peer.id, peer);
        Ok(())
    }

    /// Remove a peer. Stamps `last_empty` when the set becomes empty.
    pub async fn remove_peer(&self, peer_id: Uuid) -> Option<Arc<Peer>> {
        let mut peers = self.peers.write().await;
        let peer = peers.remove(&peer_id);

        if peers.is_empty() {
            *self.last_empty.write().await = Instant::now();
        }

        peer
    }

    /// Get a peer by id.
    pub async fn get_peer(&self, peer_id: Uuid) -> Option<Arc<Peer>> {
        self.peers.read().await.get(&peer_id).cloned()
    }

    /// Snapshot of all peers.
    pub async fn peers_snapshot(&self) -> Vec<Arc<Peer>> {
        self.peers.read().await.values().cloned().collect()
    }

    /// Peer list for `room_state`.
    pub async fn peer_infos(&self) -> Vec<PeerInfo> {
        let peers = self.peers_snapshot().await;
        let mut infos = Vec::with_capacity(peers.len());
        for peer in peers {
            infos.push(PeerInfo {
                id: peer.id,
                name: peer.name.clone(),
                muted: peer.is_muted().await,
            });
        }
        infos
    }

    /// Peer count.
    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }

    /// Whether the room has no peers.
    pub async fn is_empty(&self) -> bool {
        self.peers.read().await.is_empty()
    }

    /// When the room last became empty.
    pub async fn last_empty(&self) -> Instant {
        *self.last_empty.read().await
    }

    /// Send a frame to every peer except `exclude`. The peer set is
    /// snapshotted under the read lock and the sends happen after release,
    /// so no room lock is ever held across I/O.
    pub async fn broadcast_except(&self, exclude: Uuid, msg: &ServerMessage) {
        let targets: Vec<Arc<Peer>> = {
            let peers = self.peers.read().await;
            peers
                .values()
                .filter(|p| p.id != exclude)
                .cloned()
                .collect()
        };

        for peer in targets {
            peer.write(msg).await;
        }
    }

    /// Install a forwarder for its sender, stopping any prior forwarder for
    /// the same sender id. At most one forwarder per sender exists at any
    /// time.
    pub async fn install_forwarder(&self, forwarder: Arc<TrackForwarder>) {
        let mut forwarders = self.forwarders.write().await;
        if let Some(prev) = forwarders.insert(forwarder.sender_id, forwarder) {
            prev.stop();
            debug!(sender = %prev.sender_id, "Replaced forwarder, stopped previous");
        }
    }

    /// Remove the sender's forwarder only if it is still this instance;
    /// a replaced forwarder's shutdown must not evict its successor.
    pub async fn remove_forwarder_if(&self, sender_id: Uuid, forwarder: &Arc<TrackForwarder>) {
        let mut forwarders = self.forwarders.write().await;
        if forwarders
            .get(&sender_id)
            .is_some_and(|f| Arc::ptr_eq(f, forwarder))
        {
            forwarders.remove(&sender_id);
        }
    }

    /// Remove and return the sender's forwarder, whatever instance it is.
    pub async fn take_forwarder(&self, sender_id: Uuid) -> Option<Arc<TrackForwarder>> {
        self.forwarders.write().await.remove(&sender_id)
    }

    /// Snapshot of all forwarders.
    pub async fn forwarders_snapshot(&self) -> Vec<Arc<TrackForwarder>> {
        self.forwarders.read().await.values().cloned().collect()
    }
}

/// SFU server: room registry, shared WebRTC API and the idle-room reaper.
pub struct SfuServer {
    /// Active rooms.
    rooms: RwLock<HashMap<String, Arc<Room>>>,
    /// WebRTC API instance shared by all endpoints.
    api: Arc<API>,
    /// Server configuration.
    config: Arc<Config>,
}

impl SfuServer {
    /// Create the SFU: Opus-only media engine, default interceptors, and a
    /// single UDP socket multiplexing ICE for every peer.
    pub async fn new(config: Arc<Config>) -> Result<Self, VoiceError> {
        let mut media_engine = MediaEngine::default();

        media_engine.register_codec(
            RTCRtpCodecParameters {
                capability: RTCRtpCodecCapability {
                    mime_type: "audio/opus".to_string(),
                    clock_rate: 48000,
                    channels: 2,
                    sdp_fmtp_line: "minptime=10;useinbandfec=1".to_string(),
                    rtcp_feedback: vec![],
                },
                payload_type: 111,
                ..Default::default()
            },
            RTPCodecType::Audio,
        )?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)?;

        // All peers share one UDP port; the client address is whatever
        // completes ICE against it.
        let socket = UdpSocket::bind(("0.0.0.0", config.rtc_udp_port)).await?;
        let local_addr = socket.local_addr()?;
        let mut setting_engine = SettingEngine::default();
        setting_engine.set_udp_network(UDPNetwork::Muxed(UDPMuxDefault::new(UDPMuxParams::new(
            socket,
        ))));

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_setting_engine(setting_engine)
            .with_interceptor_registry(registry)
            .build();

        info!(rtc_addr = %local_addr, "SFU initialized");

        Ok(Self {
            rooms: RwLock::new(HashMap::new()),
            api: Arc::new(api),
            config,
        })
    }

    /// `RTCConfiguration` with the STUN server and, when configured, TURN.
    #[must_use]
    pub fn rtc_config(&self) -> RTCConfiguration {
        let mut ice_servers = vec![RTCIceServer {
            urls: vec![self.config.stun_server.clone()],
            ..Default::default()
        }];

        if let Some(turn) = &self.config.turn_server {
            ice_servers.push(RTCIceServer {
                urls: vec![turn.clone()],
                username: self.config.turn_user.clone().unwrap_or_default(),
                credential: self.config.turn_pass.clone().unwrap_or_default(),
                ..Default::default()
            });
        }

        RTCConfiguration {
            ice_servers,
            ..Default::default()
        }
    }

    /// Atomically return the existing room or construct a fresh empty one.
    pub async fn get_or_create_room(&self, room_id: &str) -> Arc<Room> {
        let mut rooms = self.rooms.write().await;

        if let Some(room) = rooms.get(room_id) {
            return room.clone();
        }

        let room = Arc::new(Room::new(
            room_id.to_string(),
            self.config.max_room_size,
        ));
        rooms.insert(room_id.to_string(), room.clone());

        debug!(room = %room_id, "Created room");

        room
    }

    /// Get a room by id.
    pub async fn get_room(&self, room_id: &str) -> Option<Arc<Room>> {
        self.rooms.read().await.get(room_id).cloned()
    }

    /// Active room count.
    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    /// Connected peer count across all rooms.
    pub async fn user_count(&self) -> usize {
        let rooms: Vec<Arc<Room>> = self.rooms.read().await.values().cloned().collect();
        let mut total = 0;
        for room in rooms {
            total += room.peer_count().await;
        }
        total
    }

    /// Create a peer with a fresh media endpoint and its recvonly audio
    /// transceiver prepared.
    pub async fn create_peer(
        &self,
        name: String,
        ip: String,
        room_id: String,
        signal_tx: tokio::sync::mpsc::Sender<axum::extract::ws::Message>,
    ) -> Result<Arc<Peer>, VoiceError> {
        let peer = Peer::new(
            Uuid::new_v4(),
            name,
            ip,
            room_id,
            &self.api,
            self.rtc_config(),
            signal_tx,
        )
        .await?;
        peer.add_recv_transceiver().await?;

        Ok(Arc::new(peer))
    }

    /// Install the incoming-track handler: on the publisher's audio track,
    /// build a forwarder, install it (replacing any prior one for this
    /// sender), subscribe every other peer, then start the fan-out worker.
    pub fn setup_track_handler(peer: &Arc<Peer>, room: &Arc<Room>) {
        let peer_weak = Arc::downgrade(peer);
        let room_weak = Arc::downgrade(room);

        peer.pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            let pw = peer_weak.clone();
            let rw = room_weak.clone();

            Box::pin(async move {
                if track.kind() != RTPCodecType::Audio {
                    debug!(kind = ?track.kind(), "Ignoring non-audio track");
                    return;
                }

                let (peer, room) = match (pw.upgrade(), rw.upgrade()) {
                    (Some(p), Some(r)) => (p, r),
                    _ => return,
                };

                info!(
                    peer = %peer.id,
                    room = %room.id,
                    track_id = %track.id(),
                    "Received audio track from publisher"
                );

                let forwarder = Arc::new(TrackForwarder::new(peer.id, track));
                room.install_forwarder(forwarder.clone()).await;

                for other in room.peers_snapshot().await {
                    if other.id == peer.id {
                        continue;
                    }
                    if let Err(e) = subscribe_peer(&forwarder, &other).await {
                        warn!(
                            sender = %peer.id,
                            receiver = %other.id,
                            error = %e,
                            "Failed to subscribe peer to new publisher"
                        );
                    }
                }

                spawn_forwarder(forwarder, Arc::downgrade(&room));
            })
        }));
    }

    /// Install the ICE candidate handler: trickle server candidates to the
    /// client as `candidate` frames.
    pub fn setup_ice_handler(peer: &Arc<Peer>) {
        let peer_weak = Arc::downgrade(peer);

        peer.pc.on_ice_candidate(Box::new(move |candidate| {
            let pw = peer_weak.clone();

            Box::pin(async move {
                let Some(candidate) = candidate else { return };
                let Some(peer) = pw.upgrade() else { return };

                match candidate.to_json() {
                    Ok(init) => {
                        peer.write(&ServerMessage::Candidate { candidate: init }).await;
                    }
                    Err(e) => {
                        warn!(peer = %peer.id, error = %e, "Failed to serialize ICE candidate");
                    }
                }
            })
        }));

        negotiation::install_restart_handlers(peer);
    }

    /// Attach a newly admitted peer to every existing publisher.
    pub async fn attach_to_publishers(room: &Arc<Room>, peer: &Arc<Peer>) {
        for forwarder in room.forwarders_snapshot().await {
            if forwarder.sender_id == peer.id {
                continue;
            }
            if let Err(e) = subscribe_peer(&forwarder, peer).await {
                warn!(
                    sender = %forwarder.sender_id,
                    receiver = %peer.id,
                    error = %e,
                    "Failed to attach peer to existing publisher"
                );
            }
        }
    }

    /// Cancel every open peer whose client ip matches. Ban enforcement:
    /// teardown runs through each peer's normal disconnect path.
    pub async fn kick_ip(&self, ip: &str) {
        let rooms: Vec<Arc<Room>> = self.rooms.read().await.values().cloned().collect();
        for room in rooms {
            for peer in room.peers_snapshot().await {
                if peer.ip == ip {
                    info!(peer = %peer.id, room = %room.id, ip = %ip, "Disconnecting banned peer");
                    peer.signal_done();
                }
            }
        }
    }

    /// Spawn the background reaper that evicts rooms empty for longer than
    /// the idle threshold. Reaping never blocks signaling: candidates are
    /// found from a snapshot and re-checked under the registry write lock.
    pub fn spawn_reaper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let sfu = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(REAP_INTERVAL);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                sfu.reap_idle_rooms().await;
            }
        })
    }

    async fn reap_idle_rooms(&self) {
        let snapshot: Vec<(String, Arc<Room>)> = {
            let rooms = self.rooms.read().await;
            rooms.iter().map(|(id, r)| (id.clone(), r.clone())).collect()
        };

        let mut expired = Vec::new();
        for (id, room) in snapshot {
            if room.is_empty().await && room.last_empty().await.elapsed() > ROOM_IDLE_TIMEOUT {
                expired.push(id);
            }
        }

        if expired.is_empty() {
            return;
        }

        let mut rooms = self.rooms.write().await;
        for id in expired {
            let still_idle = match rooms.get(&id) {
                Some(room) => {
                    room.is_empty().await
                        && room.last_empty().await.elapsed() > ROOM_IDLE_TIMEOUT
                }
                None => false,
            };
            if still_idle {
                rooms.remove(&id);
                info!(room = %id, "Reaped idle room");
            }
        }
    }
}

#[cfg(test)]
#[path = "sfu_test.rs"]
mod sfu_test;
