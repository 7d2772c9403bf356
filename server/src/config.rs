//! Server Configuration
//!
//! Command-line flags with environment-variable fallbacks. `.env` files are
//! honored when present (loaded before parsing).

use std::path::PathBuf;

use clap::Parser;

/// Server configuration.
#[derive(Debug, Clone, Parser)]
#[command(name = "sotto-server", version, about = "SFU for anonymous voice rooms")]
pub struct Config {
    /// HTTP/WebSocket listen port.
    #[arg(long, env = "PORT", default_value_t = 8080)]
    pub port: u16,

    /// Shared secret guarding the admin endpoint.
    #[arg(long, env = "ADMIN_KEY", default_value = "change-me-123")]
    pub admin_key: String,

    /// UDP port shared by all peers for SRTP (ICE UDP mux).
    #[arg(long, env = "RTC_UDP_PORT", default_value_t = 50000)]
    pub rtc_udp_port: u16,

    /// Directory for persisted state (ban list).
    #[arg(long, env = "DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// WebRTC STUN server.
    #[arg(
        long,
        env = "STUN_SERVER",
        default_value = "stun:stun.l.google.com:19302"
    )]
    pub stun_server: String,

    /// WebRTC TURN server (optional), e.g. "turn:turn.example.com:3478".
    #[arg(long, env = "TURN_SERVER")]
    pub turn_server: Option<String>,

    /// TURN username.
    #[arg(long, env = "TURN_USER")]
    pub turn_user: Option<String>,

    /// TURN credential.
    #[arg(long, env = "TURN_PASS")]
    pub turn_pass: Option<String>,

    /// Directory holding the client bundle.
    #[arg(long, env = "STATIC_DIR", default_value = "static")]
    pub static_dir: PathBuf,

    /// Optional JSON-lines log file, in addition to stdout.
    #[arg(long, env = "LOG_FILE")]
    pub log_file: Option<PathBuf>,

    /// Maximum peers per room.
    #[arg(long, env = "MAX_ROOM_SIZE", default_value_t = 10)]
    pub max_room_size: usize,
}

impl Config {
    /// Path of the persisted ban list: `$DATA_DIR/banned_ips.json` when a
    /// data dir is configured, `banned_ips.json` otherwise.
    #[must_use]
    pub fn ban_file(&self) -> PathBuf {
        match &self.data_dir {
            Some(dir) => dir.join("banned_ips.json"),
            None => PathBuf::from("banned_ips.json"),
        }
    }

    /// Create a default configuration for testing. Port 0 binds ephemeral
    /// ports so tests never collide.
    #[must_use]
    pub fn default_for_test() -> Self {
        Self {
            port: 0,
            admin_key: "test-admin-key".into(),
            rtc_udp_port: 0,
            data_dir: None,
            stun_server: "stun:stun.l.google.com:19302".into(),
            turn_server: None,
            turn_user: None,
            turn_pass: None,
            static_dir: PathBuf::from("static"),
            log_file: None,
            max_room_size: 10,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ban_file_defaults_to_cwd() {
        let config = Config::default_for_test();
        assert_eq!(config.ban_file(), PathBuf::from("banned_ips.json"));
    }

    #[test]
    fn ban_file_honors_data_dir() {
        let config = Config {
            data_dir: Some(PathBuf::from("/var/lib/sotto")),
            ..Config::default_for_test()
        };
        assert_eq!(
            config.ban_file(),
            PathBuf::from("/var/lib/sotto/banned_ips.json")
        );
    }
}
