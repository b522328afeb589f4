//! Dispatch of signaling requests to room operations.

use super::bot::BOT_LABEL;
use super::cds::CdsKind;
use super::watchers::{watch_data_producer, watch_peer_transport, watch_producer, MediaOwner};
use super::{Peer, Room, ICE_CONSENT_TIMEOUT};
use crate::engine::{
    ConsumerLayers, DataProduceOptions, DataProducer, MediaKind, ProduceOptions, Producer,
    Transport, TransportAppData, TransportConnect, WebRtcTransportOptions,
};
use crate::error::{RoomError, RoomResult};
use crate::signaling::{
    ApplyNetworkThrottleRequest, CreateWebRtcTransportRequest, JoinRequest, Notification,
    PeerRequest, ProduceDataRequest, ProduceRequest, Reply, Responder,
};
use crate::throttle::{NetworkThrottle, ThrottleSettings};
use futures::future::join_all;
use serde_json::{json, Map, Value};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Work that runs after the reply has been sent.
enum FollowUp {
    None,
    Joined,
    TransportCreated(Arc<dyn Transport>),
    Produced(Arc<dyn Producer>),
    DataProduced(Arc<dyn DataProducer>),
}

impl Room {
    /// Answers one request from `peer`. Returns once the reply is sent and
    /// any follow-up work (consumer fan-out, capture start) has finished.
    pub async fn handle_request(
        self: &Arc<Self>,
        peer: &Arc<Peer>,
        request: PeerRequest,
        responder: Responder,
    ) {
        let method = request.method();
        debug!("request {} from peer {}", method, peer.id());

        match self.dispatch(peer, request).await {
            Ok((data, follow_up)) => {
                responder.accept(data);
                self.follow_up(peer, follow_up).await;
            }
            Err(err) => {
                error!(
                    "request {} from peer {} failed: {}",
                    method,
                    peer.id(),
                    err
                );
                responder.reject(err);
            }
        }
    }

    /// Parses and handles a request, returning the reply. Used where no
    /// signaling transport is involved.
    pub async fn request(self: &Arc<Self>, peer: &Arc<Peer>, method: &str, data: Value) -> Reply {
        let request = PeerRequest::parse(method, data)?;
        let (responder, reply) = Responder::channel();
        self.handle_request(peer, request, responder).await;
        reply.await.unwrap_or(Err(RoomError::RoomClosed))
    }

    async fn dispatch(
        self: &Arc<Self>,
        peer: &Arc<Peer>,
        request: PeerRequest,
    ) -> RoomResult<(Value, FollowUp)> {
        if self.closed() {
            return Err(RoomError::RoomClosed);
        }
        if request.requires_join() && !peer.joined() {
            return Err(RoomError::not_joined());
        }

        let empty = || json!({});

        let reply = match request {
            PeerRequest::GetRouterRtpCapabilities => (self.router.rtp_capabilities(), FollowUp::None),

            PeerRequest::Join(join) => (self.join(peer, join)?, FollowUp::Joined),

            PeerRequest::CreateWebRtcTransport(create) => {
                let transport = self.create_webrtc_transport(peer, create).await?;
                (transport.parameters(), FollowUp::TransportCreated(transport))
            }

            PeerRequest::ConnectWebRtcTransport(connect) => {
                let transport = peer.media().transport(&connect.transport_id)?;
                transport
                    .connect(TransportConnect::WebRtc {
                        dtls_parameters: connect.dtls_parameters,
                    })
                    .await?;
                (empty(), FollowUp::None)
            }

            PeerRequest::RestartIce(target) => {
                let transport = peer.media().transport(&target.transport_id)?;
                (transport.restart_ice().await?, FollowUp::None)
            }

            PeerRequest::Produce(produce) => {
                let producer = self.produce(peer, produce).await?;
                (json!({ "id": producer.id() }), FollowUp::Produced(producer))
            }

            PeerRequest::CloseProducer(target) => {
                let producer = peer
                    .media()
                    .producers
                    .remove(&target.producer_id)
                    .ok_or_else(|| RoomError::not_found("producer", &target.producer_id))?;
                producer.close();
                (empty(), FollowUp::None)
            }

            PeerRequest::PauseProducer(target) => {
                let producer = peer.media().producer(&target.producer_id)?;
                producer.pause().await?;
                (empty(), FollowUp::None)
            }

            PeerRequest::ResumeProducer(target) => {
                let producer = peer.media().producer(&target.producer_id)?;
                producer.resume().await?;
                (empty(), FollowUp::None)
            }

            PeerRequest::PauseConsumer(target) => {
                let consumer = peer.media().consumer(&target.consumer_id)?;
                consumer.pause().await?;
                (empty(), FollowUp::None)
            }

            PeerRequest::ResumeConsumer(target) => {
                let consumer = peer.media().consumer(&target.consumer_id)?;
                consumer.resume().await?;
                (empty(), FollowUp::None)
            }

            PeerRequest::SetConsumerPreferredLayers(layers) => {
                let consumer = peer.media().consumer(&layers.consumer_id)?;
                consumer
                    .set_preferred_layers(ConsumerLayers {
                        spatial_layer: layers.spatial_layer,
                        temporal_layer: layers.temporal_layer,
                    })
                    .await?;
                (empty(), FollowUp::None)
            }

            PeerRequest::SetConsumerPriority(priority) => {
                let consumer = peer.media().consumer(&priority.consumer_id)?;
                consumer.set_priority(priority.priority).await?;
                (empty(), FollowUp::None)
            }

            PeerRequest::RequestConsumerKeyFrame(target) => {
                let consumer = peer.media().consumer(&target.consumer_id)?;
                consumer.request_key_frame().await?;
                (empty(), FollowUp::None)
            }

            PeerRequest::ProduceData(produce) => {
                let data_producer = self.produce_data(peer, produce).await?;
                (
                    json!({ "id": data_producer.id() }),
                    FollowUp::DataProduced(data_producer),
                )
            }

            PeerRequest::ChangeDisplayName(change) => {
                let old_display_name = {
                    let mut profile = peer.profile_mut();
                    profile.display_name.replace(change.display_name.clone())
                };
                self.notify_joined(
                    Some(peer.id()),
                    Notification::PeerDisplayNameChanged {
                        peer_id: peer.id().to_string(),
                        display_name: change.display_name,
                        old_display_name,
                    },
                )
                .await;
                (empty(), FollowUp::None)
            }

            PeerRequest::GetTransportStats(target) => {
                let transport = peer.media().transport(&target.transport_id)?;
                (transport.get_stats().await?, FollowUp::None)
            }

            PeerRequest::GetProducerStats(target) => {
                let producer = peer.media().producer(&target.producer_id)?;
                (producer.get_stats().await?, FollowUp::None)
            }

            PeerRequest::GetConsumerStats(target) => {
                let consumer = peer.media().consumer(&target.consumer_id)?;
                (consumer.get_stats().await?, FollowUp::None)
            }

            PeerRequest::GetDataProducerStats(target) => {
                let data_producer = peer.media().data_producer(&target.data_producer_id)?;
                (data_producer.get_stats().await?, FollowUp::None)
            }

            PeerRequest::GetDataConsumerStats(target) => {
                let data_consumer = peer.media().data_consumer(&target.data_consumer_id)?;
                (data_consumer.get_stats().await?, FollowUp::None)
            }

            PeerRequest::GetCdsQa => (self.cds.get(CdsKind::Qa)?, FollowUp::None),
            PeerRequest::GetCdsDdx => (self.cds.get(CdsKind::Ddx)?, FollowUp::None),
            PeerRequest::GetCdsHpi => (self.cds.get(CdsKind::Hpi)?, FollowUp::None),
            PeerRequest::GetTranscript => (self.cds.get(CdsKind::Transcript)?, FollowUp::None),

            PeerRequest::ApplyNetworkThrottle(apply) => {
                self.apply_network_throttle(apply).await?;
                (empty(), FollowUp::None)
            }

            PeerRequest::ResetNetworkThrottle(reset) => {
                self.check_throttle_secret(reset.secret.as_deref())?;
                let throttle = self.network_throttle()?;
                throttle
                    .stop()
                    .await
                    .map_err(|err| RoomError::Throttle(format!("{err:#}")))?;
                self.throttled.store(false, Ordering::SeqCst);
                warn!("network throttle reset by peer {}", peer.id());
                (empty(), FollowUp::None)
            }
        };

        Ok(reply)
    }

    async fn follow_up(self: &Arc<Self>, peer: &Arc<Peer>, follow_up: FollowUp) {
        match follow_up {
            FollowUp::None => {}
            FollowUp::Joined => self.on_joined(peer).await,
            FollowUp::TransportCreated(transport) => {
                if let Some(bitrate) = self.settings.media.max_incoming_bitrate {
                    if let Err(err) = transport.set_max_incoming_bitrate(bitrate).await {
                        debug!("setMaxIncomingBitrate on {} failed: {}", transport.id(), err);
                    }
                }
            }
            FollowUp::Produced(producer) => self.on_produced(peer, producer).await,
            FollowUp::DataProduced(data_producer) => {
                self.on_data_produced(peer, data_producer).await
            }
        }
    }

    fn join(&self, peer: &Arc<Peer>, join: JoinRequest) -> RoomResult<Value> {
        {
            let mut profile = peer.profile_mut();
            if profile.joined {
                return Err(RoomError::InvalidState("Peer already joined".to_string()));
            }
            profile.joined = true;
            profile.display_name = Some(join.display_name);
            profile.device = join.device;
            profile.rtp_capabilities = join.rtp_capabilities;
            profile.sctp_capabilities = join.sctp_capabilities;
        }

        let mut peers: Vec<Value> = self
            .joined_peers(Some(peer.id()))
            .iter()
            .map(|other| other.info())
            .collect();
        peers.extend(self.broadcasters.lock().values().map(|b| b.info()));

        info!("peer {} joined room {}", peer.id(), self.id);
        Ok(json!({ "peers": peers }))
    }

    /// Subscribes a newly joined peer to everything already in the room and
    /// announces it to the others.
    async fn on_joined(self: &Arc<Self>, peer: &Arc<Peer>) {
        let mut sources: Vec<(String, Vec<Arc<dyn Producer>>, Vec<Arc<dyn DataProducer>>)> =
            self.joined_peers(Some(peer.id()))
                .iter()
                .map(|other| {
                    let media = other.media();
                    (
                        other.id().to_string(),
                        media.producers.values().cloned().collect(),
                        media.data_producers.values().cloned().collect(),
                    )
                })
                .collect();
        let broadcasters: Vec<_> = self.broadcasters.lock().values().cloned().collect();
        sources.extend(broadcasters.iter().map(|broadcaster| {
            let media = broadcaster.media();
            (
                broadcaster.id().to_string(),
                media.producers.values().cloned().collect(),
                media.data_producers.values().cloned().collect(),
            )
        }));

        let consumers = join_all(sources.iter().flat_map(|(owner, producers, _)| {
            producers
                .iter()
                .map(move |producer| self.create_consumer(peer, owner, producer))
        }));
        let data_consumers = join_all(sources.iter().flat_map(|(owner, _, data_producers)| {
            data_producers
                .iter()
                .filter(|data_producer| data_producer.label() != BOT_LABEL)
                .map(move |data_producer| {
                    self.create_data_consumer(peer, Some(owner.as_str()), data_producer)
                })
        }));
        let bot = self.create_data_consumer(peer, None, self.bot.data_producer());

        let profile = peer.profile();
        let announce = self.notify_joined(
            Some(peer.id()),
            Notification::NewPeer {
                id: peer.id().to_string(),
                display_name: profile.display_name,
                device: profile.device,
            },
        );

        tokio::join!(consumers, data_consumers, bot, announce);
    }

    async fn create_webrtc_transport(
        self: &Arc<Self>,
        peer: &Arc<Peer>,
        create: CreateWebRtcTransportRequest,
    ) -> RoomResult<Arc<dyn Transport>> {
        let media = &self.settings.media;
        let options = WebRtcTransportOptions {
            listen_ip: media.listen_ip.clone(),
            announced_ip: media.announced_ip.clone(),
            enable_udp: !create.force_tcp,
            enable_tcp: true,
            prefer_udp: !create.force_tcp,
            initial_available_outgoing_bitrate: media.initial_available_outgoing_bitrate,
            ice_consent_timeout: ICE_CONSENT_TIMEOUT,
            enable_sctp: create.sctp_capabilities.is_some(),
            num_sctp_streams: create
                .sctp_capabilities
                .as_ref()
                .and_then(|caps| caps.get("numStreams").cloned()),
            app_data: TransportAppData {
                producing: create.producing,
                consuming: create.consuming,
            },
        };

        let transport = self.router.create_webrtc_transport(options).await?;
        watch_peer_transport(Arc::downgrade(self), Arc::downgrade(peer), &transport);
        if let Err(err) = transport.enable_trace_event(vec!["bwe".to_string()]).await {
            debug!("bwe trace on {} not enabled: {}", transport.id(), err);
        }

        peer.media()
            .transports
            .insert(transport.id().to_string(), Arc::clone(&transport));

        if peer.closed() {
            peer.media().transports.remove(transport.id());
            transport.close();
            return Err(RoomError::InvalidState("peer closed".to_string()));
        }

        Ok(transport)
    }

    async fn produce(
        &self,
        peer: &Arc<Peer>,
        produce: ProduceRequest,
    ) -> RoomResult<Arc<dyn Producer>> {
        let transport = peer.media().transport(&produce.transport_id)?;

        let mut app_data = match produce.app_data {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        app_data.insert("peerId".to_string(), json!(peer.id()));

        let producer = transport
            .produce(ProduceOptions {
                kind: produce.kind,
                rtp_parameters: produce.rtp_parameters,
                app_data: Value::Object(app_data),
            })
            .await?;

        peer.media()
            .producers
            .insert(producer.id().to_string(), Arc::clone(&producer));
        watch_producer(
            MediaOwner::new(peer.shared_media(), Some(Arc::clone(peer.channel()))),
            &producer,
        );

        Ok(producer)
    }

    async fn on_produced(self: &Arc<Self>, peer: &Arc<Peer>, producer: Arc<dyn Producer>) {
        let others = self.joined_peers(Some(peer.id()));
        let fan_out = join_all(
            others
                .iter()
                .map(|other| self.create_consumer(other, peer.id(), &producer)),
        );

        let audio = async {
            if producer.kind() != MediaKind::Audio {
                return;
            }
            self.observe_audio(&producer).await;
            if let Some(capture) = &self.capture {
                if let Err(err) = capture.start(&producer).await {
                    warn!("recording not started for room {}: {}", self.id, err);
                }
            }
        };

        tokio::join!(fan_out, audio);
    }

    async fn produce_data(
        &self,
        peer: &Arc<Peer>,
        produce: ProduceDataRequest,
    ) -> RoomResult<Arc<dyn DataProducer>> {
        let transport = peer.media().transport(&produce.transport_id)?;

        let data_producer = transport
            .produce_data(DataProduceOptions {
                sctp_stream_parameters: produce.sctp_stream_parameters,
                label: produce.label,
                protocol: produce.protocol,
                app_data: produce.app_data,
            })
            .await?;

        peer.media()
            .data_producers
            .insert(data_producer.id().to_string(), Arc::clone(&data_producer));
        watch_data_producer(
            MediaOwner::new(peer.shared_media(), Some(Arc::clone(peer.channel()))),
            &data_producer,
        );

        Ok(data_producer)
    }

    async fn on_data_produced(&self, peer: &Arc<Peer>, data_producer: Arc<dyn DataProducer>) {
        match data_producer.label() {
            "chat" => {
                let others = self.joined_peers(Some(peer.id()));
                join_all(others.iter().map(|other| {
                    self.create_data_consumer(other, Some(peer.id()), &data_producer)
                }))
                .await;
            }
            BOT_LABEL => {
                if let Err(err) = self
                    .bot
                    .handle_peer_data_producer(data_producer.id(), peer)
                    .await
                {
                    warn!("bot could not consume {}: {}", data_producer.id(), err);
                }
            }
            _ => {}
        }
    }

    fn check_throttle_secret(&self, secret: Option<&str>) -> RoomResult<()> {
        match (self.settings.throttle_secret.as_deref(), secret) {
            (Some(expected), Some(given)) if !expected.is_empty() && given == expected => Ok(()),
            _ => Err(RoomError::Forbidden),
        }
    }

    fn network_throttle(&self) -> RoomResult<&Arc<dyn NetworkThrottle>> {
        self.throttle
            .as_ref()
            .ok_or_else(|| RoomError::Throttle("network throttle not available".to_string()))
    }

    async fn apply_network_throttle(&self, apply: ApplyNetworkThrottleRequest) -> RoomResult<()> {
        self.check_throttle_secret(apply.secret.as_deref())?;
        let throttle = self.network_throttle()?;

        let settings =
            ThrottleSettings::with_defaults(apply.uplink, apply.downlink, apply.rtt, apply.packet_loss);
        throttle
            .start(settings)
            .await
            .map_err(|err| RoomError::Throttle(format!("{err:#}")))?;

        self.throttled.store(true, Ordering::SeqCst);
        warn!(
            "network throttle applied in room {} [uplink:{}, downlink:{}, rtt:{}, packetLoss:{}]",
            self.id, settings.uplink, settings.downlink, settings.rtt, settings.packet_loss
        );
        Ok(())
    }
}
