//! Tests for admission helpers and signaling frame encoding.

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use axum::http::{HeaderMap, HeaderValue};

    use crate::ws::{client_ip, origin_allowed, ClientMessage, ServerMessage};

    fn remote(addr: &str) -> SocketAddr {
        addr.parse().expect("socket addr")
    }

    fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(
                axum::http::HeaderName::try_from(*name).expect("header name"),
                HeaderValue::try_from(*value).expect("header value"),
            );
        }
        map
    }

    #[test]
    fn raw_remote_without_headers() {
        let ip = client_ip(remote("198.51.100.7:40000"), &HeaderMap::new());
        assert_eq!(ip, "198.51.100.7");
    }

    #[test]
    fn trusted_proxy_honors_x_real_ip() {
        let ip = client_ip(
            remote("127.0.0.1:40000"),
            &headers(&[("x-real-ip", "203.0.113.9")]),
        );
        assert_eq!(ip, "203.0.113.9");
    }

    #[test]
    fn trusted_proxy_falls_back_to_forwarded_for() {
        let ip = client_ip(
            remote("10.0.0.5:40000"),
            &headers(&[("x-forwarded-for", "not-an-ip, 203.0.113.9, 10.0.0.5")]),
        );
        assert_eq!(ip, "203.0.113.9");
    }

    #[test]
    fn untrusted_remote_ignores_forwarded_headers() {
        let ip = client_ip(
            remote("198.51.100.7:40000"),
            &headers(&[
                ("x-real-ip", "203.0.113.9"),
                ("x-forwarded-for", "203.0.113.10"),
            ]),
        );
        assert_eq!(ip, "198.51.100.7");
    }

    #[test]
    fn missing_origin_is_allowed() {
        assert!(origin_allowed(&headers(&[("host", "voice.example.com")])));
    }

    #[test]
    fn matching_origin_is_allowed() {
        assert!(origin_allowed(&headers(&[
            ("host", "voice.example.com"),
            ("origin", "https://voice.example.com"),
        ])));
    }

    #[test]
    fn mismatched_origin_is_rejected() {
        assert!(!origin_allowed(&headers(&[
            ("host", "voice.example.com"),
            ("origin", "https://evil.example.com"),
        ])));
    }

    #[test]
    fn forwarded_host_takes_precedence() {
        assert!(origin_allowed(&headers(&[
            ("host", "127.0.0.1:8080"),
            ("x-forwarded-host", "voice.example.com"),
            ("origin", "https://voice.example.com"),
        ])));
    }

    #[test]
    fn forwarded_proto_must_match_origin_scheme() {
        let base = [
            ("host", "voice.example.com"),
            ("origin", "http://voice.example.com"),
            ("x-forwarded-proto", "https"),
        ];
        assert!(!origin_allowed(&headers(&base)));

        assert!(origin_allowed(&headers(&[
            ("host", "voice.example.com"),
            ("origin", "https://voice.example.com"),
            ("x-forwarded-proto", "https"),
        ])));
    }

    #[test]
    fn server_frames_are_tagged_by_type() {
        let json = serde_json::to_value(&ServerMessage::Error {
            message: "Room full".into(),
        })
        .expect("serialize");
        assert_eq!(json["type"], "error");
        assert_eq!(json["message"], "Room full");

        let json = serde_json::to_value(&ServerMessage::PeerLeave {
            peer_id: uuid::Uuid::nil(),
        })
        .expect("serialize");
        assert_eq!(json["type"], "peer_leave");
    }

    #[test]
    fn client_frames_parse_by_type() {
        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"offer","sdp":"v=0"}"#).expect("parse");
        assert!(matches!(msg, ClientMessage::Offer { sdp } if sdp == "v=0"));

        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"mute","muted":true}"#).expect("parse");
        assert!(matches!(msg, ClientMessage::Mute { muted: true }));

        let msg: ClientMessage = serde_json::from_str(
            r#"{"type":"candidate","candidate":{"candidate":"candidate:1 1 udp 1 192.0.2.1 5000 typ host","sdpMid":"0","sdpMLineIndex":0}}"#,
        )
        .expect("parse");
        assert!(matches!(msg, ClientMessage::Candidate { .. }));
    }

    #[test]
    fn unknown_and_malformed_frames_fail_to_parse() {
        assert!(serde_json::from_str::<ClientMessage>(r#"{"type":"dance"}"#).is_err());
        assert!(serde_json::from_str::<ClientMessage>("not json at all").is_err());
    }
}
