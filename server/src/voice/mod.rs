//! Voice Service (SFU)
//!
//! WebRTC Selective Forwarding Unit for ephemeral voice rooms.
//!
//! Signaling runs over WebSocket (see `ws/mod.rs`). This module provides:
//! - the room registry with its idle-room reaper
//! - per-peer media endpoints and negotiation state
//! - per-publisher RTP fan-out

pub mod error;
pub mod negotiation;
mod peer;
pub mod sfu;
mod track;

// Re-exports
pub use error::VoiceError;
pub use peer::Peer;
pub use sfu::{Room, SfuServer};
pub use track::TrackForwarder;
