//! Sotto Server
//!
//! A lightweight Selective Forwarding Unit for anonymous, low-latency
//! voice rooms. Browsers publish one Opus track over WebRTC and subscribe
//! to every other participant in the room; the server forwards encrypted
//! RTP without ever decoding it.

pub mod admin;
pub mod api;
pub mod banlist;
pub mod config;
pub mod observability;
pub mod pages;
pub mod voice;
pub mod ws;
