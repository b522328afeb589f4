//! Background tasks that follow engine object events, keep the owner's media
//! maps in sync and forward what the remote side needs to know.

use super::peer::{PeerMedia, SharedMedia};
use super::Room;
use crate::engine::{
    Consumer, ConsumerEvent, DataConsumer, DataConsumerEvent, DataProducer, DataProducerEvent,
    Producer, ProducerEvent, Transport, TransportEvent,
};
use crate::signaling::{notify_best_effort, Notification, PeerChannel};
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, warn};

/// Where a watcher reports to: the owner's media maps and, for signaling
/// peers, their channel.
#[derive(Clone)]
pub(crate) struct MediaOwner {
    media: Weak<Mutex<PeerMedia>>,
    channel: Option<Arc<dyn PeerChannel>>,
}

impl MediaOwner {
    pub(crate) fn new(media: &SharedMedia, channel: Option<Arc<dyn PeerChannel>>) -> Self {
        Self {
            media: Arc::downgrade(media),
            channel,
        }
    }

    fn update(&self, f: impl FnOnce(&mut PeerMedia)) {
        if let Some(media) = self.media.upgrade() {
            f(&mut media.lock());
        }
    }

    async fn notify(&self, notification: Notification) {
        if let Some(channel) = &self.channel {
            notify_best_effort(channel.as_ref(), notification).await;
        }
    }
}

/// Next event, skipping lag notices. `None` once the sender is gone.
async fn next<T: Clone>(events: &mut broadcast::Receiver<T>) -> Option<T> {
    loop {
        match events.recv().await {
            Ok(event) => return Some(event),
            Err(RecvError::Lagged(skipped)) => debug!("watcher skipped {} events", skipped),
            Err(RecvError::Closed) => return None,
        }
    }
}

pub(crate) fn watch_consumer(owner: MediaOwner, consumer: &Arc<dyn Consumer>) {
    let mut events = consumer.subscribe();
    let consumer_id = consumer.id().to_string();

    tokio::spawn(async move {
        while let Some(event) = next(&mut events).await {
            match event {
                ConsumerEvent::TransportClose => {
                    owner.update(|media| {
                        media.consumers.remove(&consumer_id);
                    });
                    break;
                }
                ConsumerEvent::ProducerClose => {
                    owner.update(|media| {
                        media.consumers.remove(&consumer_id);
                    });
                    owner
                        .notify(Notification::ConsumerClosed {
                            consumer_id: consumer_id.clone(),
                        })
                        .await;
                    break;
                }
                ConsumerEvent::ProducerPause => {
                    owner
                        .notify(Notification::ConsumerPaused {
                            consumer_id: consumer_id.clone(),
                        })
                        .await;
                }
                ConsumerEvent::ProducerResume => {
                    owner
                        .notify(Notification::ConsumerResumed {
                            consumer_id: consumer_id.clone(),
                        })
                        .await;
                }
                ConsumerEvent::Score(score) => {
                    owner
                        .notify(Notification::ConsumerScore {
                            consumer_id: consumer_id.clone(),
                            score,
                        })
                        .await;
                }
                ConsumerEvent::LayersChange(layers) => {
                    owner
                        .notify(Notification::ConsumerLayersChanged {
                            consumer_id: consumer_id.clone(),
                            spatial_layer: layers.map(|l| l.spatial_layer),
                            temporal_layer: layers.and_then(|l| l.temporal_layer),
                        })
                        .await;
                }
                ConsumerEvent::Trace(trace) => {
                    debug!("consumer {} trace: {}", consumer_id, trace);
                }
            }
        }
    });
}

pub(crate) fn watch_data_consumer(owner: MediaOwner, data_consumer: &Arc<dyn DataConsumer>) {
    let mut events = data_consumer.subscribe();
    let data_consumer_id = data_consumer.id().to_string();

    tokio::spawn(async move {
        while let Some(event) = next(&mut events).await {
            match event {
                DataConsumerEvent::TransportClose => {
                    owner.update(|media| {
                        media.data_consumers.remove(&data_consumer_id);
                    });
                    break;
                }
                DataConsumerEvent::DataProducerClose => {
                    owner.update(|media| {
                        media.data_consumers.remove(&data_consumer_id);
                    });
                    owner
                        .notify(Notification::DataConsumerClosed {
                            data_consumer_id: data_consumer_id.clone(),
                        })
                        .await;
                    break;
                }
                DataConsumerEvent::Message(_) => {}
            }
        }
    });
}

/// Forwards producer scores to the owner and drops the producer from the
/// owner's map when its transport closes.
pub(crate) fn watch_producer(owner: MediaOwner, producer: &Arc<dyn Producer>) {
    let mut events = producer.subscribe();
    let producer_id = producer.id().to_string();

    tokio::spawn(async move {
        while let Some(event) = next(&mut events).await {
            match event {
                ProducerEvent::Score(score) => {
                    owner
                        .notify(Notification::ProducerScore {
                            producer_id: producer_id.clone(),
                            score,
                        })
                        .await;
                }
                ProducerEvent::VideoOrientationChange(orientation) => {
                    debug!(
                        "producer {} video orientation changed: {}",
                        producer_id, orientation
                    );
                }
                ProducerEvent::Trace(trace) => {
                    debug!("producer {} trace: {}", producer_id, trace);
                }
                ProducerEvent::TransportClose => {
                    owner.update(|media| {
                        media.producers.remove(&producer_id);
                    });
                    break;
                }
            }
        }
    });
}

pub(crate) fn watch_data_producer(owner: MediaOwner, data_producer: &Arc<dyn DataProducer>) {
    let mut events = data_producer.subscribe();
    let data_producer_id = data_producer.id().to_string();

    tokio::spawn(async move {
        while let Some(event) = next(&mut events).await {
            match event {
                DataProducerEvent::TransportClose => {
                    owner.update(|media| {
                        media.data_producers.remove(&data_producer_id);
                    });
                    break;
                }
            }
        }
    });
}

/// Closes the peer when ICE or DTLS fails and relays outgoing bandwidth
/// estimates as `downlinkBwe`.
pub(crate) fn watch_peer_transport(
    room: Weak<Room>,
    peer: Weak<super::Peer>,
    transport: &Arc<dyn Transport>,
) {
    let mut events = transport.subscribe();
    let transport_id = transport.id().to_string();

    tokio::spawn(async move {
        while let Some(event) = next(&mut events).await {
            if event.is_fatal() {
                warn!(
                    "transport {} reported {:?}, closing peer",
                    transport_id, event
                );
                if let (Some(room), Some(peer)) = (room.upgrade(), peer.upgrade()) {
                    room.close_peer(&peer).await;
                }
                break;
            }

            match event {
                TransportEvent::Trace(trace) => {
                    debug!(
                        "transport {} trace {} ({})",
                        transport_id, trace.trace_type, trace.direction
                    );
                    if trace.trace_type == "bwe" && trace.direction == "out" {
                        let Some(peer) = peer.upgrade() else { break };
                        peer.notify(Notification::DownlinkBwe {
                            desired_bitrate: trace.info["desiredBitrate"].clone(),
                            effective_desired_bitrate: trace.info["effectiveDesiredBitrate"]
                                .clone(),
                            available_bitrate: trace.info["availableBitrate"].clone(),
                        })
                        .await;
                    }
                }
                TransportEvent::SctpStateChange(state) => {
                    debug!("transport {} sctp state {}", transport_id, state);
                }
                TransportEvent::Closed => break,
                _ => {}
            }
        }
    });
}
