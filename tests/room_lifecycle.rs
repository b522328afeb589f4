mod common;

use carecall::engine::{IceState, Router as _, TransportEvent, TransportTrace};
use carecall::error::RoomError;
use carecall::room::{RoomEvent, RoomRegistry};
use carecall::signaling::PeerChannel;
use common::{create_transport, eventually, opus_parameters, produce, Harness, THROTTLE_SECRET};
use serde_json::json;
use std::sync::Arc;
use tokio::sync::broadcast::error::TryRecvError;

#[tokio::test]
async fn test_leaving_peer_is_announced_and_cleaned_up() {
    let harness = Harness::new().without_capture();
    let room = harness.room("life-leave").await;
    let (alice, alice_channel) = harness.joined_peer(&room, "alice").await;
    let (bob, _) = harness.joined_peer(&room, "bob").await;
    let transport_id = create_transport(&room, &bob, true, false).await;

    room.close_peer(&bob).await;

    assert_eq!(
        alice_channel.notifications("peerClosed"),
        vec![json!({ "peerId": "bob" })]
    );
    assert!(bob.closed());
    assert!(bob.channel().closed());
    assert!(bob.media().transports.is_empty());
    assert!(harness
        .engine
        .journal()
        .contains(&format!("transport.close {}", transport_id)));
    assert!(room.peer("bob").is_none());
    assert!(!room.closed());
    assert!(!alice.closed());
}

#[tokio::test]
async fn test_unjoined_peer_leaves_silently() {
    let harness = Harness::new().without_capture();
    let room = harness.room("life-silent").await;
    let (_alice, alice_channel) = harness.joined_peer(&room, "alice").await;
    let (lurker, _) = harness.connect(&room, "lurker").await;

    room.close_peer(&lurker).await;

    assert!(alice_channel.notifications("peerClosed").is_empty());
    assert!(room.peer("lurker").is_none());
}

#[tokio::test]
async fn test_last_peer_closes_room_and_registry_forgets_it() {
    let harness = Harness::new().without_capture();
    let registry = RoomRegistry::new(harness.services.clone());
    let room = registry.get_or_create("life-last", None).await.unwrap();
    let mut events = room.subscribe();
    let router_id = room.router().id().to_string();
    let (alice, _) = harness.joined_peer(&room, "alice").await;

    room.close_peer(&alice).await;

    assert!(room.closed());
    assert_eq!(
        events.recv().await.unwrap(),
        RoomEvent::Closed {
            room_id: "life-last".to_string()
        }
    );
    assert!(harness
        .engine
        .journal()
        .contains(&format!("router.close {}", router_id)));
    assert!(eventually(|| registry.rooms().is_empty()).await);
    assert!(matches!(
        registry.get("life-last"),
        Err(RoomError::NotFound { kind: "room", .. })
    ));

    // The id can be reused for a fresh room.
    let reopened = registry.get_or_create("life-last", None).await.unwrap();
    assert!(!Arc::ptr_eq(&room, &reopened));
    assert!(!reopened.closed());
}

#[tokio::test]
async fn test_registry_shares_rooms_by_id() {
    let harness = Harness::new().without_capture();
    let registry = Arc::new(RoomRegistry::new(harness.services.clone()));

    let (first, second) = tokio::join!(
        registry.get_or_create("life-shared", Some(2)),
        registry.get_or_create("life-shared", Some(5)),
    );
    let (first, second) = (first.unwrap(), second.unwrap());
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(first.consumer_replicas(), 2);

    let other = registry.get_or_create("life-other", None).await.unwrap();
    assert_eq!(other.consumer_replicas(), 0);

    let ids: Vec<String> = registry.rooms().iter().map(|r| r.id().to_string()).collect();
    assert_eq!(ids, vec!["life-other".to_string(), "life-shared".to_string()]);

    registry.close_all().await;
    assert!(first.closed());
    assert!(other.closed());
}

#[tokio::test]
async fn test_reconnect_replaces_previous_connection() {
    let harness = Harness::new().without_capture();
    let room = harness.room("life-reconnect").await;
    let (_alice, alice_channel) = harness.joined_peer(&room, "alice").await;
    let (old_bob, old_channel) = harness.joined_peer(&room, "bob").await;

    let (new_bob, _) = harness.connect(&room, "bob").await;

    assert!(old_bob.closed());
    assert!(old_channel.closed());
    assert_eq!(
        alice_channel.notifications("peerClosed"),
        vec![json!({ "peerId": "bob" })]
    );
    assert!(Arc::ptr_eq(&room.peer("bob").unwrap(), &new_bob));

    // The stale connection ending later must not evict the new one.
    room.close_peer(&old_bob).await;
    assert!(Arc::ptr_eq(&room.peer("bob").unwrap(), &new_bob));
    assert!(!room.closed());
}

#[tokio::test]
async fn test_failed_ice_closes_peer() {
    let harness = Harness::new().without_capture();
    let room = harness.room("life-ice").await;
    let (_alice, alice_channel) = harness.joined_peer(&room, "alice").await;
    let (bob, _) = harness.joined_peer(&room, "bob").await;
    let transport_id = create_transport(&room, &bob, true, false).await;

    let router = harness
        .engine
        .routers()
        .into_iter()
        .find(|router| router.id() == room.router().id())
        .unwrap();
    router
        .transport(&transport_id)
        .unwrap()
        .emit(TransportEvent::IceStateChange(IceState::Disconnected));

    assert!(eventually(|| bob.closed()).await);
    assert!(eventually(|| !alice_channel.notifications("peerClosed").is_empty()).await);
    assert!(room.peer("bob").is_none());
}

#[tokio::test]
async fn test_outgoing_bwe_trace_is_forwarded() {
    let harness = Harness::new().without_capture();
    let room = harness.room("life-bwe").await;
    let (alice, alice_channel) = harness.joined_peer(&room, "alice").await;
    let transport_id = create_transport(&room, &alice, false, true).await;

    let router = harness
        .engine
        .routers()
        .into_iter()
        .find(|router| router.id() == room.router().id())
        .unwrap();
    router
        .transport(&transport_id)
        .unwrap()
        .emit(TransportEvent::Trace(TransportTrace {
            trace_type: "bwe".to_string(),
            direction: "out".to_string(),
            info: json!({
                "desiredBitrate": 900000,
                "effectiveDesiredBitrate": 850000,
                "availableBitrate": 600000
            }),
        }));

    assert!(eventually(|| !alice_channel.notifications("downlinkBwe").is_empty()).await);
    assert_eq!(
        alice_channel.notifications("downlinkBwe")[0],
        json!({
            "desiredBitrate": 900000,
            "effectiveDesiredBitrate": 850000,
            "availableBitrate": 600000
        })
    );
}

#[tokio::test]
async fn test_closed_room_refuses_work() {
    let harness = Harness::new().without_capture();
    let room = harness.room("life-closed").await;
    let (alice, alice_channel) = harness.joined_peer(&room, "alice").await;
    produce(&room, &alice, "audio", opus_parameters()).await;

    room.close().await;
    room.close().await;

    assert!(alice.closed());
    assert!(alice_channel.closed());
    let err = room
        .request(&alice, "getRouterRtpCapabilities", json!({}))
        .await
        .unwrap_err();
    assert!(matches!(err, RoomError::RoomClosed));

    let channel = common::FakeChannel::new(&harness.engine);
    assert!(matches!(
        room.create_peer("late", channel).await,
        Err(RoomError::RoomClosed)
    ));
    let journal = harness.engine.journal();
    assert_eq!(
        journal
            .iter()
            .filter(|entry| entry.starts_with("router.close"))
            .count(),
        1
    );
}

#[tokio::test]
async fn test_network_throttle_needs_secret() {
    let harness = Harness::new().without_capture();
    let room = harness.room("life-throttle-secret").await;
    let (alice, _) = harness.connect(&room, "alice").await;

    for body in [json!({}), json!({ "secret": "guess" })] {
        let err = room
            .request(&alice, "applyNetworkThrottle", body)
            .await
            .unwrap_err();
        assert_eq!(err.code(), 403);
    }
    let err = room
        .request(&alice, "resetNetworkThrottle", json!({ "secret": "guess" }))
        .await
        .unwrap_err();
    assert_eq!(err.code(), 403);

    assert!(harness.throttle.calls().is_empty());
    assert!(!room.throttled());
}

#[tokio::test]
async fn test_network_throttle_apply_and_reset() {
    let harness = Harness::new().without_capture();
    let room = harness.room("life-throttle").await;
    let (alice, _) = harness.connect(&room, "alice").await;

    room.request(
        &alice,
        "applyNetworkThrottle",
        json!({ "secret": THROTTLE_SECRET, "uplink": 0, "rtt": 150, "packetLoss": 2.5 }),
    )
    .await
    .unwrap();
    assert!(room.throttled());
    assert!(room.status().throttled);

    room.request(
        &alice,
        "resetNetworkThrottle",
        json!({ "secret": THROTTLE_SECRET }),
    )
    .await
    .unwrap();
    assert!(!room.throttled());

    assert_eq!(
        harness.throttle.calls(),
        vec![
            "start uplink=1000000 downlink=1000000 rtt=150 loss=2.5".to_string(),
            "stop".to_string()
        ]
    );
}

#[tokio::test]
async fn test_throttle_is_reset_when_room_closes() {
    let harness = Harness::new().without_capture();
    let room = harness.room("life-throttle-close").await;
    let (alice, _) = harness.connect(&room, "alice").await;
    room.request(
        &alice,
        "applyNetworkThrottle",
        json!({ "secret": THROTTLE_SECRET, "uplink": 200000, "downlink": 300000 }),
    )
    .await
    .unwrap();

    room.close_peer(&alice).await;

    assert!(room.closed());
    assert_eq!(
        harness.throttle.calls(),
        vec![
            "start uplink=200000 downlink=300000 rtt=0 loss=0".to_string(),
            "stop".to_string()
        ]
    );
}

#[tokio::test]
async fn test_throttle_failure_leaves_room_unthrottled() {
    let harness = Harness::new().without_capture();
    harness.throttle.fail();
    let room = harness.room("life-throttle-fail").await;
    let (alice, _) = harness.connect(&room, "alice").await;

    let err = room
        .request(
            &alice,
            "applyNetworkThrottle",
            json!({ "secret": THROTTLE_SECRET }),
        )
        .await
        .unwrap_err();
    assert_eq!(err.code(), 500);
    assert!(!room.throttled());

    room.close().await;
    assert!(harness.throttle.calls().is_empty());
}

#[tokio::test]
async fn test_status_snapshot() {
    let harness = Harness::new();
    let room = harness.room("life-status").await;
    let (_alice, _) = harness.joined_peer(&room, "alice").await;
    let (_lurker, _) = harness.connect(&room, "lurker").await;

    let status = room.status();
    assert_eq!(status.room_id, "life-status");
    assert_eq!(status.peers, vec!["alice".to_string(), "lurker".to_string()]);
    assert_eq!(status.joined_peers, 1);
    assert!(status.broadcasters.is_empty());
    assert!(!status.throttled);
    assert!(!status.closed);

    let value = serde_json::to_value(&status).unwrap();
    assert_eq!(value["joinedPeers"], 1);
    assert_eq!(value["capture"]["phase"], "idle");
}

#[tokio::test]
async fn test_concurrent_close_emits_one_event() {
    let harness = Harness::new();
    let room = harness.room("life-close-race").await;
    let mut events = room.subscribe();
    let (alice, _) = harness.joined_peer(&room, "alice").await;
    produce(&room, &alice, "audio", opus_parameters()).await;

    tokio::join!(room.close(), room.close());

    assert_eq!(
        events.recv().await.unwrap(),
        RoomEvent::Closed {
            room_id: "life-close-race".to_string()
        }
    );
    assert!(matches!(events.try_recv(), Err(TryRecvError::Empty)));
    assert_eq!(harness.transcoder.terminated(), 1);
    assert_eq!(
        harness
            .engine
            .journal()
            .iter()
            .filter(|entry| entry.starts_with("router.close"))
            .count(),
        1
    );
}
