mod common;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use carecall::api::ApiServer;
use carecall::config::ServerConfig;
use carecall::engine::{MediaKind, Router as _};
use carecall::error::RoomError;
use carecall::room::{
    CreateBroadcasterDataProducerRequest, CreateBroadcasterRequest,
    CreateBroadcasterTransportRequest, Room, RoomRegistry,
};
use common::{join, opus_parameters, produce, vp8_parameters, Harness};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

fn broadcaster_request(id: &str, with_caps: Option<Value>) -> CreateBroadcasterRequest {
    serde_json::from_value(json!({
        "id": id,
        "displayName": "Lobby camera",
        "device": { "name": "gstreamer", "version": "1.22" },
        "rtpCapabilities": with_caps
    }))
    .unwrap()
}

fn transport_request(body: Value) -> CreateBroadcasterTransportRequest {
    serde_json::from_value(body).unwrap()
}

async fn webrtc_transport(room: &Arc<Room>, broadcaster_id: &str) -> String {
    let reply = room
        .create_broadcaster_transport(broadcaster_id, transport_request(json!({ "type": "webrtc" })))
        .await
        .unwrap();
    reply["id"].as_str().unwrap().to_string()
}

#[tokio::test]
async fn test_create_broadcaster_announces_it() {
    let harness = Harness::new().without_capture();
    let room = harness.room("bc-create").await;
    let (_alice, alice_channel) = harness.joined_peer(&room, "alice").await;

    let reply = room
        .create_broadcaster(broadcaster_request("cam-1", None))
        .await
        .unwrap();
    assert_eq!(reply, json!({ "peers": [] }));

    let announced = alice_channel.notifications("newPeer");
    assert_eq!(announced.len(), 1);
    assert_eq!(
        announced[0],
        json!({
            "id": "cam-1",
            "displayName": "Lobby camera",
            "device": { "flag": "broadcaster", "name": "gstreamer", "version": "1.22" }
        })
    );
    assert_eq!(room.status().broadcasters, vec!["cam-1".to_string()]);

    let err = room
        .create_broadcaster(broadcaster_request("cam-1", None))
        .await
        .unwrap_err();
    assert_eq!(err.code(), 409);
    assert_eq!(
        err.to_string(),
        "broadcaster with id \"cam-1\" already exists"
    );
}

#[tokio::test]
async fn test_create_broadcaster_lists_consumable_producers() {
    let harness = Harness::new().without_capture();
    let room = harness.room("bc-list").await;
    let (alice, _) = harness.joined_peer(&room, "alice").await;
    let audio_id = produce(&room, &alice, "audio", opus_parameters()).await;
    produce(&room, &alice, "video", vp8_parameters()).await;

    let audio_only = json!({
        "codecs": [{ "kind": "audio", "mimeType": "audio/opus", "clockRate": 48000, "channels": 2 }]
    });
    let reply = room
        .create_broadcaster(broadcaster_request("cam-1", Some(audio_only)))
        .await
        .unwrap();

    let peers = reply["peers"].as_array().unwrap();
    assert_eq!(peers.len(), 1);
    assert_eq!(peers[0]["id"], "alice");
    assert_eq!(
        peers[0]["producers"],
        json!([{ "id": audio_id, "kind": "audio" }])
    );
}

#[tokio::test]
async fn test_broadcaster_producer_reaches_joined_peers() {
    let harness = Harness::new().without_capture();
    let room = harness.room("bc-produce").await;
    let (_alice, alice_channel) = harness.joined_peer(&room, "alice").await;
    room.create_broadcaster(broadcaster_request("cam-1", None))
        .await
        .unwrap();
    let transport_id = webrtc_transport(&room, "cam-1").await;

    let err = room
        .connect_broadcaster_transport("no-such-broadcaster", &transport_id, json!({}))
        .await
        .unwrap_err();
    assert_eq!(err.code(), 404);
    room.connect_broadcaster_transport("cam-1", &transport_id, json!({ "role": "server" }))
        .await
        .unwrap();

    let reply = room
        .create_broadcaster_producer("cam-1", &transport_id, MediaKind::Audio, opus_parameters())
        .await
        .unwrap();
    let producer_id = reply["id"].as_str().unwrap();

    // The HTTP reply waits for the handshake with every joined peer.
    let calls = alice_channel.requests("newConsumer");
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].data["peerId"], "cam-1");
    assert_eq!(calls[0].data["producerId"], producer_id);
    assert_eq!(calls[0].data["appData"]["peerId"], "cam-1");
    let consumer_id = calls[0].data["id"].as_str().unwrap();
    assert!(harness
        .engine
        .journal()
        .contains(&format!("consumer.resume {}", consumer_id)));

    let router = harness
        .engine
        .routers()
        .into_iter()
        .find(|router| router.id() == room.router().id())
        .unwrap();
    let observer = router.audio_level_observers().pop().unwrap();
    assert_eq!(observer.producer_ids(), vec![producer_id.to_string()]);
}

#[tokio::test]
async fn test_late_joiner_sees_broadcaster() {
    let harness = Harness::new().without_capture();
    let room = harness.room("bc-late").await;
    room.create_broadcaster(broadcaster_request("cam-1", None))
        .await
        .unwrap();
    let transport_id = webrtc_transport(&room, "cam-1").await;
    let producer = room
        .create_broadcaster_producer("cam-1", &transport_id, MediaKind::Video, vp8_parameters())
        .await
        .unwrap();

    let (bob, bob_channel) = harness.connect(&room, "bob").await;
    common::create_transport(&room, &bob, false, true).await;
    let reply = join(&room, &bob, "Bob").await;

    assert_eq!(reply["peers"][0]["id"], "cam-1");
    assert_eq!(reply["peers"][0]["device"]["flag"], "broadcaster");
    let calls = bob_channel.requests("newConsumer");
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].data["producerId"], producer["id"]);
    assert_eq!(calls[0].data["peerId"], "cam-1");
}

#[tokio::test]
async fn test_plain_transport_reports_tuple() {
    let harness = Harness::new().without_capture();
    let room = harness.room("bc-plain").await;
    room.create_broadcaster(broadcaster_request("cam-1", None))
        .await
        .unwrap();

    let reply = room
        .create_broadcaster_transport(
            "cam-1",
            transport_request(json!({ "type": "plain", "comedia": true })),
        )
        .await
        .unwrap();
    let port = reply["port"].as_u64().unwrap();
    assert_eq!(reply["rtcpPort"].as_u64(), Some(port + 1));
    assert!(reply["ip"].is_string());

    let transport_id = reply["id"].as_str().unwrap();
    let err = room
        .connect_broadcaster_transport("cam-1", transport_id, json!({}))
        .await
        .unwrap_err();
    assert_eq!(
        err.to_string(),
        format!("transport with id \"{}\" is not a WebRtcTransport", transport_id)
    );

    let muxed = room
        .create_broadcaster_transport(
            "cam-1",
            transport_request(json!({ "type": "plain", "rtcpMux": true })),
        )
        .await
        .unwrap();
    assert!(muxed["rtcpPort"].is_null());

    let err = room
        .create_broadcaster_transport("cam-1", transport_request(json!({ "type": "sip" })))
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "invalid type");
}

#[tokio::test]
async fn test_webrtc_transport_matches_peer_ice_consent() {
    let harness = Harness::new().without_capture();
    let room = harness.room("bc-ice").await;
    room.create_broadcaster(broadcaster_request("cam-1", None))
        .await
        .unwrap();

    let transport_id = webrtc_transport(&room, "cam-1").await;

    let router = harness
        .engine
        .routers()
        .into_iter()
        .find(|router| router.id() == room.router().id())
        .unwrap();
    assert_eq!(
        router.transport(&transport_id).unwrap().ice_consent_timeout(),
        Some(20)
    );
}

#[tokio::test]
async fn test_broadcaster_consumes_peer_media() {
    let harness = Harness::new().without_capture();
    let room = harness.room("bc-consume").await;
    let (alice, _) = harness.joined_peer(&room, "alice").await;
    let producer_id = produce(&room, &alice, "video", vp8_parameters()).await;

    room.create_broadcaster(broadcaster_request("blind", None))
        .await
        .unwrap();
    let blind_transport = webrtc_transport(&room, "blind").await;
    let err = room
        .create_broadcaster_consumer("blind", &blind_transport, &producer_id)
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "broadcaster does not have rtpCapabilities");

    room.create_broadcaster(broadcaster_request(
        "recorder",
        Some(room.router().rtp_capabilities()),
    ))
    .await
    .unwrap();
    let transport_id = webrtc_transport(&room, "recorder").await;
    let reply = room
        .create_broadcaster_consumer("recorder", &transport_id, &producer_id)
        .await
        .unwrap();

    assert_eq!(reply["producerId"], producer_id.as_str());
    assert_eq!(reply["kind"], "video");
    assert_eq!(reply["type"], "simple");
    assert_eq!(reply["rtpParameters"], vp8_parameters());
    let consumer_id = reply["id"].as_str().unwrap();
    assert!(harness.engine.journal().contains(&format!(
        "consumer.create {} producer={} paused=false",
        consumer_id, producer_id
    )));
}

#[tokio::test]
async fn test_broadcaster_data_channels() {
    let harness = Harness::new().without_capture();
    let room = harness.room("bc-data").await;
    room.create_broadcaster(broadcaster_request(
        "cam-1",
        Some(room.router().rtp_capabilities()),
    ))
    .await
    .unwrap();
    let reply = room
        .create_broadcaster_transport(
            "cam-1",
            transport_request(json!({
                "type": "webrtc",
                "sctpCapabilities": { "numStreams": { "OS": 1024, "MIS": 1024 } }
            })),
        )
        .await
        .unwrap();
    assert!(reply["sctpParameters"].is_object());
    let transport_id = reply["id"].as_str().unwrap();

    let request: CreateBroadcasterDataProducerRequest = serde_json::from_value(json!({
        "label": "chat",
        "protocol": "",
        "sctpStreamParameters": { "streamId": 0, "ordered": true }
    }))
    .unwrap();
    let produced = room
        .create_broadcaster_data_producer("cam-1", transport_id, request)
        .await
        .unwrap();
    let data_producer_id = produced["id"].as_str().unwrap();

    let consumed = room
        .create_broadcaster_data_consumer("cam-1", transport_id, data_producer_id)
        .await
        .unwrap();
    assert!(consumed["id"].is_string());
    assert_eq!(consumed["streamId"], 0);
}

#[tokio::test]
async fn test_delete_broadcaster_notifies_peers() {
    let harness = Harness::new().without_capture();
    let room = harness.room("bc-delete").await;
    let (_alice, alice_channel) = harness.joined_peer(&room, "alice").await;
    room.create_broadcaster(broadcaster_request("cam-1", None))
        .await
        .unwrap();
    let transport_id = webrtc_transport(&room, "cam-1").await;

    room.delete_broadcaster("cam-1").await.unwrap();

    assert_eq!(
        alice_channel.notifications("peerClosed"),
        vec![json!({ "peerId": "cam-1" })]
    );
    assert!(harness
        .engine
        .journal()
        .contains(&format!("transport.close {}", transport_id)));
    assert!(room.status().broadcasters.is_empty());

    let err = room.delete_broadcaster("cam-1").await.unwrap_err();
    assert_eq!(err.code(), 404);
}

fn created_transports(journal: &[String]) -> Vec<String> {
    journal
        .iter()
        .filter_map(|entry| entry.strip_prefix("transport.create "))
        .filter_map(|rest| rest.split_whitespace().next())
        .map(str::to_string)
        .collect()
}

#[tokio::test]
async fn test_transport_created_during_delete_is_closed() {
    let harness = Harness::new().without_capture();
    let room = harness.room("bc-delete-race").await;
    room.create_broadcaster(broadcaster_request("cam-1", None))
        .await
        .unwrap();
    harness
        .engine
        .delay("create_webrtc_transport", Duration::from_millis(200));

    let (created, deleted) = tokio::join!(
        room.create_broadcaster_transport("cam-1", transport_request(json!({ "type": "webrtc" }))),
        async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            room.delete_broadcaster("cam-1").await
        }
    );

    deleted.unwrap();
    assert_eq!(created.unwrap_err().code(), 404);
    let journal = harness.engine.journal();
    let transports = created_transports(&journal);
    assert_eq!(transports.len(), 1);
    assert!(journal.contains(&format!("transport.close {}", transports[0])));
}

#[tokio::test]
async fn test_transport_created_during_room_close_is_refused() {
    let harness = Harness::new().without_capture();
    let room = harness.room("bc-close-race").await;
    room.create_broadcaster(broadcaster_request("cam-1", None))
        .await
        .unwrap();
    harness
        .engine
        .delay("create_plain_transport", Duration::from_millis(200));

    let (created, _) = tokio::join!(
        room.create_broadcaster_transport("cam-1", transport_request(json!({ "type": "plain" }))),
        async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            room.close().await
        }
    );

    assert!(matches!(created, Err(RoomError::RoomClosed)));
    let journal = harness.engine.journal();
    for transport in created_transports(&journal) {
        assert!(journal.contains(&format!("transport.close {}", transport)));
    }
}

async fn send(app: axum::Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let request = Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(match body {
            Some(body) => Body::from(body.to_string()),
            None => Body::empty(),
        })
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

#[tokio::test]
async fn test_http_broadcaster_flow() {
    let harness = Harness::new().without_capture();
    let registry = Arc::new(RoomRegistry::new(harness.services.clone()));
    let room = registry.get_or_create("bc-http", None).await.unwrap();
    let app = ApiServer::new(Arc::clone(&registry), &ServerConfig::default()).router();

    let (status, body) = send(
        app.clone(),
        "POST",
        "/rooms/bc-http/broadcasters",
        Some(json!({
            "id": "cam-1",
            "displayName": "Lobby camera",
            "device": { "name": "gstreamer" }
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "peers": [] }));

    let (status, body) = send(
        app.clone(),
        "POST",
        "/rooms/bc-http/broadcasters",
        Some(json!({ "id": "cam-2" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(
        body,
        json!({ "error": true, "message": "missing body.displayName" })
    );

    let (status, body) = send(
        app.clone(),
        "POST",
        "/rooms/bc-http/broadcasters/cam-1/transports",
        Some(json!({ "type": "plain" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let transport_id = body["id"].as_str().unwrap().to_string();

    let (status, body) = send(
        app.clone(),
        "POST",
        &format!("/rooms/bc-http/broadcasters/cam-1/transports/{transport_id}/producers"),
        Some(json!({ "kind": "audio", "rtpParameters": opus_parameters() })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["id"].is_string());

    let (status, body) = send(app.clone(), "GET", "/rooms/bc-http/status", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["broadcasters"], json!(["cam-1"]));
    assert_eq!(body["routerId"], room.router().id());

    let (status, _) = send(
        app.clone(),
        "DELETE",
        "/rooms/bc-http/broadcasters/cam-1",
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = send(app.clone(), "POST", "/rooms/nowhere/broadcasters", Some(json!({})))
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], true);
    assert_eq!(body["message"], "room with id \"nowhere\" not found");

    let (status, body) = send(app, "GET", "/rooms/bc-http", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, room.router().rtp_capabilities());
}
