//! Tests for the room registry, room invariants and the negotiation driver.

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::extract::ws::Message;
    use tokio::sync::mpsc;
    use tokio::time::{advance, Duration};

    use crate::config::Config;
    use crate::voice::error::VoiceError;
    use crate::voice::negotiation;
    use crate::voice::sfu::{SfuServer, ROOM_IDLE_TIMEOUT};
    use crate::voice::Peer;

    async fn test_sfu() -> Arc<SfuServer> {
        let config = Arc::new(Config::default_for_test());
        Arc::new(SfuServer::new(config).await.expect("sfu init"))
    }

    async fn test_peer(sfu: &SfuServer, name: &str) -> Arc<Peer> {
        let (tx, _rx) = mpsc::channel::<Message>(8);
        sfu.create_peer(name.to_string(), "127.0.0.1".into(), "room".into(), tx)
            .await
            .expect("create peer")
    }

    #[tokio::test]
    async fn room_capacity_is_enforced() {
        let sfu = test_sfu().await;
        let room = sfu.get_or_create_room("r3").await;

        let mut admitted = Vec::new();
        for i in 0..10 {
            let peer = test_peer(&sfu, &format!("peer{i}")).await;
            room.add_peer(peer.clone()).await.expect("within capacity");
            admitted.push(peer);
        }
        assert_eq!(room.peer_count().await, 10);

        let extra = test_peer(&sfu, "late").await;
        let err = room.add_peer(extra).await.expect_err("over capacity");
        assert!(matches!(err, VoiceError::RoomFull { max_peers: 10 }));
        assert_eq!(room.peer_count().await, 10);

        for peer in admitted {
            let _ = peer.close().await;
        }
    }

    #[tokio::test]
    async fn removing_last_peer_stamps_last_empty() {
        let sfu = test_sfu().await;
        let room = sfu.get_or_create_room("r").await;
        let created_empty_at = room.last_empty().await;

        let peer = test_peer(&sfu, "alice").await;
        room.add_peer(peer.clone()).await.expect("add");

        tokio::time::sleep(Duration::from_millis(20)).await;
        room.remove_peer(peer.id).await;

        assert!(room.is_empty().await);
        assert!(room.last_empty().await > created_empty_at);

        let _ = peer.close().await;
    }

    #[tokio::test]
    async fn get_or_create_room_returns_same_instance() {
        let sfu = test_sfu().await;
        let a = sfu.get_or_create_room("r1").await;
        let b = sfu.get_or_create_room("r1").await;
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(sfu.room_count().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn reaper_evicts_only_after_idle_threshold() {
        let sfu = test_sfu().await;
        let reaper = sfu.spawn_reaper();

        // r4 sits empty from now; r5 is created one hour later.
        sfu.get_or_create_room("r4").await;
        advance(Duration::from_secs(3600)).await;
        sfu.get_or_create_room("r5").await;

        // One hour in, nothing is reapable yet.
        assert!(sfu.get_room("r4").await.is_some());

        advance(ROOM_IDLE_TIMEOUT - Duration::from_secs(3600) + Duration::from_secs(120)).await;
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }

        assert!(sfu.get_room("r4").await.is_none(), "r4 idle past threshold");
        assert!(sfu.get_room("r5").await.is_some(), "r5 idle only ~1h");

        reaper.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn ice_restarts_are_rate_limited() {
        let sfu = test_sfu().await;
        let peer = test_peer(&sfu, "alice").await;

        negotiation::request(&peer, true).await;
        let first = {
            let st = peer.negotiation.lock().await;
            assert!(st.ice_restart_pending);
            st.last_ice_restart.expect("restart granted")
        };

        // A second request inside the window is rejected outright.
        negotiation::request(&peer, true).await;
        assert_eq!(
            peer.negotiation.lock().await.last_ice_restart,
            Some(first)
        );

        advance(Duration::from_secs(16)).await;
        negotiation::request(&peer, true).await;
        let second = peer
            .negotiation
            .lock()
            .await
            .last_ice_restart
            .expect("restart granted");
        assert!(second > first);

        peer.signal_done();
        let _ = peer.close().await;
    }

    #[tokio::test]
    async fn negotiation_worker_is_single() {
        let sfu = test_sfu().await;
        let peer = test_peer(&sfu, "alice").await;

        negotiation::request(&peer, false).await;
        negotiation::request(&peer, false).await;

        // Both requests funnel into one worker: in_progress is set and
        // pending coalesces.
        let st = peer.negotiation.lock().await;
        assert!(st.in_progress);
        drop(st);

        peer.signal_done();
        let _ = peer.close().await;
    }

    #[tokio::test]
    async fn banned_ip_kick_cancels_matching_peers() {
        let sfu = test_sfu().await;
        let room = sfu.get_or_create_room("r").await;

        let alice = test_peer(&sfu, "alice").await;
        let (tx, _rx) = mpsc::channel::<Message>(8);
        let mallory = sfu
            .create_peer("mallory".into(), "203.0.113.9".into(), "r".into(), tx)
            .await
            .expect("create peer");

        room.add_peer(alice.clone()).await.expect("add");
        room.add_peer(mallory.clone()).await.expect("add");

        sfu.kick_ip("203.0.113.9").await;

        assert!(mallory.is_done());
        assert!(!alice.is_done());

        let _ = alice.close().await;
        let _ = mallory.close().await;
    }
}
