//! Broadcasters: participants driven over HTTP instead of signaling. They
//! never receive notifications; everything they consume is requested
//! explicitly.

use super::peer::Broadcaster;
use super::watchers::{
    watch_consumer, watch_data_consumer, watch_data_producer, watch_producer, MediaOwner,
};
use super::{Room, ICE_CONSENT_TIMEOUT};
use crate::engine::{
    ConsumeOptions, DataConsumeOptions, DataProduceOptions, MediaKind, PlainTransportOptions,
    ProduceOptions, TransportAppData, TransportConnect, TransportKind, WebRtcTransportOptions,
};
use crate::error::{RoomError, RoomResult};
use crate::signaling::Notification;
use futures::future::join_all;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CreateBroadcasterRequest {
    pub id: Option<String>,
    pub display_name: Option<String>,
    pub device: Value,
    pub rtp_capabilities: Option<Value>,
}

impl CreateBroadcasterRequest {
    fn validate(self) -> RoomResult<(String, String, Value, Option<Value>)> {
        let id = self
            .id
            .filter(|id| !id.is_empty())
            .ok_or_else(|| RoomError::InvalidArgument("missing body.id".to_string()))?;
        let display_name = self
            .display_name
            .filter(|name| !name.is_empty())
            .ok_or_else(|| RoomError::InvalidArgument("missing body.displayName".to_string()))?;
        let device_name = self
            .device
            .get("name")
            .and_then(Value::as_str)
            .filter(|name| !name.is_empty())
            .ok_or_else(|| RoomError::InvalidArgument("missing body.device.name".to_string()))?
            .to_string();
        if matches!(&self.rtp_capabilities, Some(caps) if !caps.is_object()) {
            return Err(RoomError::InvalidArgument(
                "wrong body.rtpCapabilities".to_string(),
            ));
        }

        let device = json!({
            "flag": "broadcaster",
            "name": device_name,
            "version": self.device.get("version").cloned().unwrap_or(Value::Null),
        });
        Ok((id, display_name, device, self.rtp_capabilities))
    }
}

fn default_comedia() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateBroadcasterTransportRequest {
    #[serde(rename = "type")]
    pub transport_type: String,
    #[serde(default)]
    pub rtcp_mux: bool,
    #[serde(default = "default_comedia")]
    pub comedia: bool,
    pub sctp_capabilities: Option<Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CreateBroadcasterDataProducerRequest {
    pub label: String,
    pub protocol: String,
    pub sctp_stream_parameters: Option<Value>,
    pub app_data: Value,
}

impl Room {
    fn broadcaster(&self, broadcaster_id: &str) -> RoomResult<Arc<Broadcaster>> {
        self.broadcasters
            .lock()
            .get(broadcaster_id)
            .cloned()
            .ok_or_else(|| RoomError::not_found("broadcaster", broadcaster_id))
    }

    /// Registers a broadcaster and returns the joined peers (with their
    /// producers it can consume) so it can set up consumers itself.
    pub async fn create_broadcaster(&self, request: CreateBroadcasterRequest) -> RoomResult<Value> {
        if self.closed() {
            return Err(RoomError::RoomClosed);
        }
        let (id, display_name, device, rtp_capabilities) = request.validate()?;

        let broadcaster = {
            let mut broadcasters = self.broadcasters.lock();
            if broadcasters.contains_key(&id) {
                return Err(RoomError::AlreadyExists(format!(
                    "broadcaster with id \"{id}\" already exists"
                )));
            }
            let broadcaster = Arc::new(Broadcaster::new(
                &id,
                &display_name,
                device.clone(),
                rtp_capabilities,
            ));
            broadcasters.insert(id.clone(), Arc::clone(&broadcaster));
            broadcaster
        };
        info!("broadcaster {} created in room {}", id, self.id);

        self.notify_joined(
            None,
            Notification::NewPeer {
                id: id.clone(),
                display_name: Some(display_name),
                device,
            },
        )
        .await;

        let peers: Vec<Value> = match broadcaster.rtp_capabilities() {
            Some(caps) => self
                .joined_peers(None)
                .iter()
                .map(|peer| {
                    let producers: Vec<Value> = peer
                        .media()
                        .producers
                        .values()
                        .filter(|producer| self.router.can_consume(producer.id(), caps))
                        .map(|producer| json!({ "id": producer.id(), "kind": producer.kind() }))
                        .collect();
                    let mut info = peer.info();
                    info["producers"] = Value::Array(producers);
                    info
                })
                .collect(),
            None => Vec::new(),
        };

        Ok(json!({ "peers": peers }))
    }

    pub async fn delete_broadcaster(&self, broadcaster_id: &str) -> RoomResult<()> {
        let broadcaster = self
            .broadcasters
            .lock()
            .remove(broadcaster_id)
            .ok_or_else(|| RoomError::not_found("broadcaster", broadcaster_id))?;
        broadcaster.close();
        info!("broadcaster {} deleted from room {}", broadcaster_id, self.id);

        self.notify_joined(
            None,
            Notification::PeerClosed {
                peer_id: broadcaster_id.to_string(),
            },
        )
        .await;
        Ok(())
    }

    pub async fn create_broadcaster_transport(
        &self,
        broadcaster_id: &str,
        request: CreateBroadcasterTransportRequest,
    ) -> RoomResult<Value> {
        let broadcaster = self.broadcaster(broadcaster_id)?;
        let media = &self.settings.media;

        let (transport, reply) = match request.transport_type.as_str() {
            "webrtc" => {
                let transport = self
                    .router
                    .create_webrtc_transport(WebRtcTransportOptions {
                        listen_ip: media.listen_ip.clone(),
                        announced_ip: media.announced_ip.clone(),
                        enable_udp: true,
                        enable_tcp: true,
                        prefer_udp: true,
                        initial_available_outgoing_bitrate: media
                            .initial_available_outgoing_bitrate,
                        ice_consent_timeout: ICE_CONSENT_TIMEOUT,
                        enable_sctp: request.sctp_capabilities.is_some(),
                        num_sctp_streams: request
                            .sctp_capabilities
                            .as_ref()
                            .and_then(|caps| caps.get("numStreams").cloned()),
                        app_data: TransportAppData::default(),
                    })
                    .await?;
                let reply = transport.parameters();
                (transport, reply)
            }
            "plain" => {
                let transport = self
                    .router
                    .create_plain_transport(PlainTransportOptions {
                        listen_ip: media.listen_ip.clone(),
                        announced_ip: media.announced_ip.clone(),
                        rtcp_mux: request.rtcp_mux,
                        comedia: request.comedia,
                        app_data: TransportAppData::default(),
                    })
                    .await?;
                let tuple = transport.tuple();
                let reply = json!({
                    "id": transport.id(),
                    "ip": tuple.as_ref().map(|t| t.local_ip.clone()),
                    "port": tuple.as_ref().map(|t| t.local_port),
                    "rtcpPort": transport.rtcp_tuple().map(|t| t.local_port),
                });
                (transport, reply)
            }
            _ => return Err(RoomError::InvalidArgument("invalid type".to_string())),
        };

        // The broadcaster may have been deleted or the room closed while the
        // engine was busy.
        let current = self.broadcasters.lock().get(broadcaster_id).cloned();
        let registered = current.is_some_and(|current| Arc::ptr_eq(&current, &broadcaster));
        if self.closed() || !registered {
            transport.close();
            return Err(if self.closed() {
                RoomError::RoomClosed
            } else {
                RoomError::not_found("broadcaster", broadcaster_id)
            });
        }

        broadcaster
            .media()
            .transports
            .insert(transport.id().to_string(), transport);
        Ok(reply)
    }

    pub async fn connect_broadcaster_transport(
        &self,
        broadcaster_id: &str,
        transport_id: &str,
        dtls_parameters: Value,
    ) -> RoomResult<()> {
        let broadcaster = self.broadcaster(broadcaster_id)?;
        let transport = broadcaster.media().transport(transport_id)?;
        if transport.kind() != TransportKind::WebRtc {
            return Err(RoomError::InvalidArgument(format!(
                "transport with id \"{transport_id}\" is not a WebRtcTransport"
            )));
        }
        transport
            .connect(TransportConnect::WebRtc { dtls_parameters })
            .await?;
        Ok(())
    }

    /// Creates a producer for the broadcaster and hands it to every joined
    /// peer. Returns after the consumer handshakes have completed.
    pub async fn create_broadcaster_producer(
        &self,
        broadcaster_id: &str,
        transport_id: &str,
        kind: MediaKind,
        rtp_parameters: Value,
    ) -> RoomResult<Value> {
        let broadcaster = self.broadcaster(broadcaster_id)?;
        let transport = broadcaster.media().transport(transport_id)?;

        let producer = transport
            .produce(ProduceOptions {
                kind,
                rtp_parameters,
                app_data: json!({ "peerId": broadcaster_id }),
            })
            .await?;
        broadcaster
            .media()
            .producers
            .insert(producer.id().to_string(), Arc::clone(&producer));
        watch_producer(MediaOwner::new(broadcaster.shared_media(), None), &producer);

        let peers = self.joined_peers(None);
        join_all(
            peers
                .iter()
                .map(|peer| self.create_consumer(peer, broadcaster_id, &producer)),
        )
        .await;

        if producer.kind() == MediaKind::Audio {
            self.observe_audio(&producer).await;
        }

        Ok(json!({ "id": producer.id() }))
    }

    pub async fn create_broadcaster_consumer(
        &self,
        broadcaster_id: &str,
        transport_id: &str,
        producer_id: &str,
    ) -> RoomResult<Value> {
        let broadcaster = self.broadcaster(broadcaster_id)?;
        let rtp_capabilities = broadcaster.rtp_capabilities().cloned().ok_or_else(|| {
            RoomError::InvalidState("broadcaster does not have rtpCapabilities".to_string())
        })?;
        let transport = broadcaster.media().transport(transport_id)?;

        let consumer = transport
            .consume(ConsumeOptions {
                producer_id: producer_id.to_string(),
                rtp_capabilities,
                paused: false,
                enable_rtx: false,
            })
            .await?;
        broadcaster
            .media()
            .consumers
            .insert(consumer.id().to_string(), Arc::clone(&consumer));
        watch_consumer(MediaOwner::new(broadcaster.shared_media(), None), &consumer);

        Ok(json!({
            "id": consumer.id(),
            "producerId": producer_id,
            "kind": consumer.kind(),
            "rtpParameters": consumer.rtp_parameters(),
            "type": consumer.consumer_type(),
        }))
    }

    pub async fn create_broadcaster_data_consumer(
        &self,
        broadcaster_id: &str,
        transport_id: &str,
        data_producer_id: &str,
    ) -> RoomResult<Value> {
        let broadcaster = self.broadcaster(broadcaster_id)?;
        if broadcaster.rtp_capabilities().is_none() {
            return Err(RoomError::InvalidState(
                "broadcaster does not have rtpCapabilities".to_string(),
            ));
        }
        let transport = broadcaster.media().transport(transport_id)?;

        let data_consumer = transport
            .consume_data(DataConsumeOptions {
                data_producer_id: data_producer_id.to_string(),
            })
            .await?;
        broadcaster
            .media()
            .data_consumers
            .insert(data_consumer.id().to_string(), Arc::clone(&data_consumer));
        watch_data_consumer(
            MediaOwner::new(broadcaster.shared_media(), None),
            &data_consumer,
        );

        let stream_id = data_consumer
            .sctp_stream_parameters()
            .and_then(|params| params.get("streamId").cloned())
            .unwrap_or(Value::Null);
        Ok(json!({ "id": data_consumer.id(), "streamId": stream_id }))
    }

    pub async fn create_broadcaster_data_producer(
        &self,
        broadcaster_id: &str,
        transport_id: &str,
        request: CreateBroadcasterDataProducerRequest,
    ) -> RoomResult<Value> {
        let broadcaster = self.broadcaster(broadcaster_id)?;
        let transport = broadcaster.media().transport(transport_id)?;

        let data_producer = transport
            .produce_data(DataProduceOptions {
                sctp_stream_parameters: request.sctp_stream_parameters,
                label: request.label,
                protocol: request.protocol,
                app_data: request.app_data,
            })
            .await?;
        broadcaster
            .media()
            .data_producers
            .insert(data_producer.id().to_string(), Arc::clone(&data_producer));
        watch_data_producer(
            MediaOwner::new(broadcaster.shared_media(), None),
            &data_producer,
        );

        Ok(json!({ "id": data_producer.id() }))
    }
}
