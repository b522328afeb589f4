//! The consumer handshake: consumers are created paused, announced to the
//! receiving peer with `newConsumer`, and resumed once the peer acknowledges.

use super::watchers::{watch_consumer, watch_data_consumer, MediaOwner};
use super::{Peer, Room};
use crate::engine::{ConsumeOptions, DataConsumeOptions, DataProducer, Producer};
use crate::error::RoomError;
use crate::signaling::{Notification, PeerCall, SignalingError};
use futures::future::join_all;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, warn};

impl Room {
    fn owner_of(peer: &Peer) -> MediaOwner {
        MediaOwner::new(peer.shared_media(), Some(Arc::clone(peer.channel())))
    }

    async fn call_peer(&self, peer: &Peer, call: PeerCall) -> Result<Value, RoomError> {
        let timeout = self.settings.request_timeout;
        match tokio::time::timeout(timeout, peer.channel().request(call)).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(SignalingError::Timeout(timeout.as_secs()).into()),
        }
    }

    /// Creates the consumer (plus configured replicas) through which
    /// `consumer_peer` receives `producer`, owned by `producer_owner`.
    /// Failures are logged, never returned.
    pub(crate) async fn create_consumer(
        &self,
        consumer_peer: &Arc<Peer>,
        producer_owner: &str,
        producer: &Arc<dyn Producer>,
    ) {
        let Some(rtp_capabilities) = consumer_peer.rtp_capabilities() else {
            debug!(
                "peer {} has no rtpCapabilities, not consuming {}",
                consumer_peer.id(),
                producer.id()
            );
            return;
        };
        if !self.router.can_consume(producer.id(), &rtp_capabilities) {
            debug!(
                "peer {} cannot consume producer {}",
                consumer_peer.id(),
                producer.id()
            );
            return;
        }
        let Some(transport) = consumer_peer.media().consuming_transport() else {
            warn!(
                "peer {} has no consuming transport, not consuming {}",
                consumer_peer.id(),
                producer.id()
            );
            return;
        };

        let copies = 1 + self.consumer_replicas as usize;
        let transport = &transport;
        let rtp_capabilities = &rtp_capabilities;
        join_all((0..copies).map(|_| async move {
            let consumer = match transport
                .consume(ConsumeOptions {
                    producer_id: producer.id().to_string(),
                    rtp_capabilities: rtp_capabilities.clone(),
                    paused: true,
                    enable_rtx: true,
                })
                .await
            {
                Ok(consumer) => consumer,
                Err(err) => {
                    warn!("consume of {} failed: {}", producer.id(), err);
                    return;
                }
            };

            consumer_peer
                .media()
                .consumers
                .insert(consumer.id().to_string(), Arc::clone(&consumer));
            watch_consumer(Self::owner_of(consumer_peer), &consumer);

            let call = PeerCall::NewConsumer {
                peer_id: producer_owner.to_string(),
                producer_id: producer.id().to_string(),
                id: consumer.id().to_string(),
                kind: consumer.kind(),
                rtp_parameters: consumer.rtp_parameters(),
                consumer_type: consumer.consumer_type(),
                app_data: producer.app_data(),
                producer_paused: consumer.producer_paused(),
            };
            if let Err(err) = self.call_peer(consumer_peer, call).await {
                warn!(
                    "newConsumer {} to peer {} failed: {}",
                    consumer.id(),
                    consumer_peer.id(),
                    err
                );
                return;
            }

            if let Err(err) = consumer.resume().await {
                warn!("resume of consumer {} failed: {}", consumer.id(), err);
                return;
            }

            consumer_peer
                .notify(Notification::ConsumerScore {
                    consumer_id: consumer.id().to_string(),
                    score: consumer.score(),
                })
                .await;
        }))
        .await;
    }

    /// Creates the data consumer through which `consumer_peer` receives
    /// `data_producer`. `producer_owner` is `None` for the room's bot.
    pub(crate) async fn create_data_consumer(
        &self,
        consumer_peer: &Arc<Peer>,
        producer_owner: Option<&str>,
        data_producer: &Arc<dyn DataProducer>,
    ) {
        if consumer_peer.sctp_capabilities().is_none() {
            return;
        }
        let Some(transport) = consumer_peer.media().consuming_transport() else {
            warn!(
                "peer {} has no consuming transport, not consuming data {}",
                consumer_peer.id(),
                data_producer.id()
            );
            return;
        };

        let data_consumer = match transport
            .consume_data(DataConsumeOptions {
                data_producer_id: data_producer.id().to_string(),
            })
            .await
        {
            Ok(data_consumer) => data_consumer,
            Err(err) => {
                warn!("consumeData of {} failed: {}", data_producer.id(), err);
                return;
            }
        };

        consumer_peer
            .media()
            .data_consumers
            .insert(data_consumer.id().to_string(), Arc::clone(&data_consumer));
        watch_data_consumer(Self::owner_of(consumer_peer), &data_consumer);

        let call = PeerCall::NewDataConsumer {
            peer_id: producer_owner.map(str::to_string),
            data_producer_id: data_producer.id().to_string(),
            id: data_consumer.id().to_string(),
            sctp_stream_parameters: data_consumer.sctp_stream_parameters(),
            label: data_consumer.label().to_string(),
            protocol: data_consumer.protocol().to_string(),
            app_data: data_producer.app_data(),
        };
        if let Err(err) = self.call_peer(consumer_peer, call).await {
            warn!(
                "newDataConsumer {} to peer {} failed: {}",
                data_consumer.id(),
                consumer_peer.id(),
                err
            );
        }
    }
}
