//! Signaling Handler
//!
//! Owns the WebSocket channel for each peer: admission checks before the
//! upgrade, a single writer task serializing all outbound frames, the
//! keepalive ping loop, the read loop with its pong-extended deadline, and
//! the dispatch into the negotiation state machine. Teardown of a peer has
//! exactly one entry point: this module's connection handler returning.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{ConnectInfo, Query, State, WebSocketUpgrade};
use axum::http::header::{HOST, ORIGIN};
use axum::http::{HeaderMap, Uri};
use axum::response::{IntoResponse, Response};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;

use crate::api::AppState;
use crate::voice::{negotiation, Peer, Room, SfuServer, VoiceError};

/// Maximum nickname length in Unicode scalar values.
const MAX_NICKNAME_CHARS: usize = 12;

/// Transport ping interval.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// Read deadline, extended by this much on each pong.
const READ_TIMEOUT: Duration = Duration::from_secs(60);

/// Outbound frame queue depth per connection.
const WRITE_QUEUE_DEPTH: usize = 64;

/// WebSocket connection query params.
#[derive(Debug, Deserialize)]
pub struct WsQuery {
    /// Room identifier.
    pub room: String,
    /// Nickname.
    pub name: String,
}

/// A peer as seen by clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerInfo {
    /// Peer id.
    pub id: Uuid,
    /// Display name.
    pub name: String,
    /// Whether the peer reported itself muted.
    #[serde(default)]
    pub muted: bool,
}

/// Client-to-server signaling frames.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// SDP offer.
    Offer { sdp: String },
    /// SDP answer.
    Answer { sdp: String },
    /// ICE candidate description.
    Candidate { candidate: RTCIceCandidateInit },
    /// Mute state change.
    Mute { muted: bool },
}

/// Server-to-client signaling frames.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// First frame to a newly admitted peer.
    RoomState { self_id: Uuid, peers: Vec<PeerInfo> },
    /// New participant announced to others.
    PeerJoin { peer: PeerInfo },
    /// Participant departed.
    PeerLeave { peer_id: Uuid },
    /// Mute state change of a participant.
    PeerMute { peer_id: Uuid, muted: bool },
    /// SDP offer.
    Offer { sdp: String },
    /// SDP answer.
    Answer { sdp: String },
    /// ICE candidate description.
    Candidate { candidate: RTCIceCandidateInit },
    /// Terminal error; the peer should disconnect.
    Error { message: String },
}

/// WebSocket upgrade handler. All admission checks run before the upgrade:
/// invalid inputs fail with 400, banned IPs with 403, cross-origin
/// upgrades with 403.
pub async fn handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Response {
    let room_id = query.room.trim().to_string();
    let name = query.name.trim().to_string();

    if room_id.is_empty() {
        return VoiceError::BadRequest("missing room".into()).into_response();
    }
    if name.is_empty() || name.chars().count() > MAX_NICKNAME_CHARS {
        return VoiceError::BadRequest("invalid name".into()).into_response();
    }

    let ip = client_ip(addr, &headers);
    if state.banlist.is_banned(&ip) {
        info!(ip = %ip, "Rejected banned IP");
        return VoiceError::Banned.into_response();
    }

    if !origin_allowed(&headers) {
        return VoiceError::OriginDenied.into_response();
    }

    ws.on_upgrade(move |socket| handle_socket(socket, state, room_id, name, ip))
}

/// Derive the client IP. A loopback or private immediate peer is a trusted
/// proxy and may speak for the client via `X-Real-IP`, then the first valid
/// `X-Forwarded-For` entry; anything else is taken at face value.
pub(crate) fn client_ip(remote: SocketAddr, headers: &HeaderMap) -> String {
    if is_trusted_proxy(remote.ip()) {
        if let Some(real) = header_str(headers, "x-real-ip") {
            if let Ok(ip) = real.trim().parse::<IpAddr>() {
                return ip.to_string();
            }
        }
        if let Some(forwarded) = header_str(headers, "x-forwarded-for") {
            for entry in forwarded.split(',') {
                if let Ok(ip) = entry.trim().parse::<IpAddr>() {
                    return ip.to_string();
                }
            }
        }
    }

    remote.ip().to_string()
}

fn is_trusted_proxy(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_loopback() || v4.is_private(),
        IpAddr::V6(v6) => v6.is_loopback() || (v6.segments()[0] & 0xfe00) == 0xfc00,
    }
}

/// Cross-origin upgrade check. No `Origin` header passes (non-browser
/// clients); otherwise the origin's authority must match the request host
/// (`X-Forwarded-Host` preferred) and its scheme must match
/// `X-Forwarded-Proto` when that header is present.
pub(crate) fn origin_allowed(headers: &HeaderMap) -> bool {
    let Some(origin) = headers.get(ORIGIN) else {
        return true;
    };
    let Ok(origin) = origin.to_str() else {
        return false;
    };
    let Ok(origin) = origin.parse::<Uri>() else {
        return false;
    };
    let Some(origin_authority) = origin.authority() else {
        return false;
    };

    let request_host = header_str(headers, "x-forwarded-host")
        .or_else(|| headers.get(HOST).and_then(|v| v.to_str().ok()));
    let Some(request_host) = request_host else {
        return false;
    };
    if !origin_authority
        .as_str()
        .eq_ignore_ascii_case(request_host.trim())
    {
        return false;
    }

    if let Some(proto) = header_str(headers, "x-forwarded-proto") {
        let scheme = origin.scheme_str().unwrap_or_default();
        if !scheme.eq_ignore_ascii_case(proto.trim()) {
            return false;
        }
    }

    true
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// One admitted connection, upgrade to teardown.
async fn handle_socket(
    socket: WebSocket,
    state: AppState,
    room_id: String,
    name: String,
    ip: String,
) {
    let (mut ws_sender, mut ws_receiver) = socket.split();

    // Single consumer per connection: all outbound frames funnel through
    // this task, so interleaved writers can never corrupt the stream.
    let (tx, mut rx) = mpsc::channel::<Message>(WRITE_QUEUE_DEPTH);
    tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if ws_sender.send(msg).await.is_err() {
                break;
            }
        }
        let _ = ws_sender.close().await;
    });

    let room = state.sfu.get_or_create_room(&room_id).await;

    let peer = match state
        .sfu
        .create_peer(name, ip, room_id, tx.clone())
        .await
    {
        Ok(peer) => peer,
        Err(e) => {
            warn!(room = %room.id, error = %e, "Failed to create media endpoint");
            send_error(&tx, "Internal error").await;
            // Dropping the last sender lets the writer flush and close.
            return;
        }
    };

    // Capacity check and registration under the room write lock.
    if let Err(e) = room.add_peer(peer.clone()).await {
        debug!(room = %room.id, error = %e, "Admission rejected");
        send_error(&tx, "Room full").await;
        let _ = peer.close().await;
        return;
    }

    info!(room = %room.id, peer = %peer.id, name = %peer.name, ip = %peer.ip, "USER_JOIN");

    // First frame: full room state, including self.
    let peers = room.peer_infos().await;
    peer.write(&ServerMessage::RoomState {
        self_id: peer.id,
        peers,
    })
    .await;

    room.broadcast_except(
        peer.id,
        &ServerMessage::PeerJoin {
            peer: PeerInfo {
                id: peer.id,
                name: peer.name.clone(),
                muted: false,
            },
        },
    )
    .await;

    SfuServer::setup_ice_handler(&peer);
    SfuServer::setup_track_handler(&peer, &room);

    // Subscribe to everyone already publishing, then open the exchange.
    // Renegotiations after this first offer go through the driver.
    SfuServer::attach_to_publishers(&room, &peer).await;
    if let Err(e) = negotiation::send_offer(&peer, false).await {
        warn!(peer = %peer.id, error = %e, "Failed to send initial offer");
    }

    let ping_task = spawn_ping_loop(&peer, tx.clone());

    read_loop(&mut ws_receiver, &room, &peer).await;

    // Teardown, on every exit path.
    peer.signal_done();

    for forwarder in room.forwarders_snapshot().await {
        forwarder.unsubscribe(peer.id).await;
    }

    if let Some(own) = room.take_forwarder(peer.id).await {
        own.stop();
    }

    room.remove_peer(peer.id).await;

    if let Err(e) = peer.close().await {
        debug!(peer = %peer.id, error = %e, "Error closing media endpoint");
    }

    info!(room = %room.id, peer = %peer.id, ip = %peer.ip, "USER_LEAVE");
    room.broadcast_except(peer.id, &ServerMessage::PeerLeave { peer_id: peer.id })
        .await;

    let _ = ping_task.await;
}

/// Keepalive: transport ping every 30 s. A failed send means the writer is
/// gone, which is terminal for the peer.
fn spawn_ping_loop(peer: &Arc<Peer>, tx: mpsc::Sender<Message>) -> tokio::task::JoinHandle<()> {
    let done = peer.done();
    let peer = peer.clone();

    tokio::spawn(async move {
        let mut interval = tokio::time::interval(PING_INTERVAL);
        interval.tick().await;

        loop {
            tokio::select! {
                () = done.cancelled() => break,
                _ = interval.tick() => {
                    if tx.send(Message::Ping(Vec::new().into())).await.is_err() {
                        debug!(peer = %peer.id, "Ping failed, signalling teardown");
                        peer.signal_done();
                        break;
                    }
                }
            }
        }
    })
}

/// Read one frame at a time until the deadline lapses, the transport
/// fails, the client closes, or teardown is signalled.
async fn read_loop(
    ws_receiver: &mut futures::stream::SplitStream<WebSocket>,
    room: &Arc<Room>,
    peer: &Arc<Peer>,
) {
    let done = peer.done();
    let mut deadline = Instant::now() + READ_TIMEOUT;

    loop {
        let msg = tokio::select! {
            () = done.cancelled() => break,
            res = tokio::time::timeout_at(deadline, ws_receiver.next()) => match res {
                Ok(Some(Ok(msg))) => msg,
                Ok(Some(Err(e))) => {
                    debug!(peer = %peer.id, error = %e, "Signaling read error");
                    break;
                }
                Ok(None) => break,
                Err(_) => {
                    debug!(peer = %peer.id, "Read deadline expired");
                    break;
                }
            },
        };

        match msg {
            Message::Text(text) => dispatch(room, peer, &text).await,
            Message::Pong(_) => {
                deadline = Instant::now() + READ_TIMEOUT;
            }
            Message::Close(_) => break,
            _ => {}
        }
    }
}

/// Decode one JSON frame and dispatch on `type`. Malformed frames and
/// unknown types are dropped silently; handler errors are logged and the
/// connection lives on.
async fn dispatch(room: &Arc<Room>, peer: &Arc<Peer>, text: &str) {
    let Ok(msg) = serde_json::from_str::<ClientMessage>(text) else {
        debug!(peer = %peer.id, "Dropping unparseable signaling frame");
        return;
    };

    let result = match msg {
        ClientMessage::Offer { sdp } => negotiation::handle_offer(peer, sdp).await,
        ClientMessage::Answer { sdp } => negotiation::handle_answer(peer, sdp).await,
        ClientMessage::Candidate { candidate } => {
            negotiation::handle_candidate(peer, candidate).await
        }
        ClientMessage::Mute { muted } => {
            peer.set_muted(muted).await;
            room.broadcast_except(
                peer.id,
                &ServerMessage::PeerMute {
                    peer_id: peer.id,
                    muted,
                },
            )
            .await;
            Ok(())
        }
    };

    if let Err(e) = result {
        warn!(peer = %peer.id, error = %e, "Signaling dispatch error");
    }
}

/// Best-effort error frame for connections that never became a peer.
async fn send_error(tx: &mpsc::Sender<Message>, message: &str) {
    if let Ok(json) = serde_json::to_string(&ServerMessage::Error {
        message: message.to_string(),
    }) {
        let _ = tx.send(Message::Text(json.into())).await;
    }
}

#[cfg(test)]
#[path = "admission_test.rs"]
mod admission_test;
