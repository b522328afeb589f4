//! Rooms: one router, the participants attached to it and the per-room
//! services (bot, capture machine, CDS relay link).

mod bot;
mod broadcasters;
mod cds;
mod consumers;
mod peer;
mod registry;
mod requests;
mod watchers;

pub use bot::BOT_LABEL;
pub use broadcasters::{
    CreateBroadcasterDataProducerRequest, CreateBroadcasterRequest,
    CreateBroadcasterTransportRequest,
};
pub use cds::{CdsCache, CdsKind};
pub use peer::{Broadcaster, Peer, PeerMedia, PeerProfile};
pub use registry::RoomRegistry;

use crate::capture::{CaptureEvent, CaptureMachine, CaptureServices, CaptureStatus};
use crate::config::{Config, MediaConfig};
use crate::engine::{
    ActiveSpeakerEvent, ActiveSpeakerObserver, AudioLevelEvent, AudioLevelObserver,
    AudioLevelObserverOptions, MediaEngine, Producer, Router, RouterOptions,
};
use crate::error::{RoomError, RoomResult};
use crate::relay::{CdsRelay, RelayMessage};
use crate::signaling::{Notification, PeerChannel};
use crate::throttle::NetworkThrottle;
use bot::Bot;
use futures::future::join_all;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// ICE consent timeout for WebRTC transports, in seconds.
pub(crate) const ICE_CONSENT_TIMEOUT: u8 = 20;

/// Per-room knobs taken from the service configuration.
#[derive(Debug, Clone)]
pub struct RoomSettings {
    pub media: MediaConfig,
    /// Bound on each `newConsumer` / `newDataConsumer` round trip.
    pub request_timeout: Duration,
    pub throttle_secret: Option<String>,
}

impl RoomSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            media: config.media.clone(),
            request_timeout: Duration::from_secs(config.signaling.request_timeout_secs),
            throttle_secret: config.throttle.secret.clone(),
        }
    }
}

/// Everything a room needs from the outside, shared by all rooms.
#[derive(Clone)]
pub struct RoomServices {
    pub engine: Arc<dyn MediaEngine>,
    pub capture: Option<CaptureServices>,
    pub relay: Option<Arc<dyn CdsRelay>>,
    pub throttle: Option<Arc<dyn NetworkThrottle>>,
    pub settings: RoomSettings,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoomEvent {
    Closed { room_id: String },
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomStatus {
    pub room_id: String,
    pub router_id: String,
    pub peers: Vec<String>,
    pub joined_peers: usize,
    pub broadcasters: Vec<String>,
    pub capture: Option<CaptureStatus>,
    pub throttled: bool,
    pub closed: bool,
}

pub struct Room {
    id: String,
    consumer_replicas: u32,
    settings: RoomSettings,
    engine_version: String,
    router: Arc<dyn Router>,
    audio_level_observer: Arc<dyn AudioLevelObserver>,
    active_speaker_observer: Arc<dyn ActiveSpeakerObserver>,
    bot: Bot,
    capture: Option<CaptureMachine>,
    throttle: Option<Arc<dyn NetworkThrottle>>,
    relay_outbound: Mutex<Option<mpsc::UnboundedSender<RelayMessage>>>,
    cds: CdsCache,
    peers: Mutex<HashMap<String, Arc<Peer>>>,
    broadcasters: Mutex<HashMap<String, Arc<Broadcaster>>>,
    throttled: AtomicBool,
    closed: AtomicBool,
    shutdown: CancellationToken,
    events: broadcast::Sender<RoomEvent>,
}

impl Room {
    pub async fn create(
        room_id: &str,
        consumer_replicas: u32,
        services: &RoomServices,
    ) -> RoomResult<Arc<Self>> {
        info!(
            "creating room {} (consumer replicas: {})",
            room_id, consumer_replicas
        );

        let router = services
            .engine
            .create_router(RouterOptions {
                media_codecs: services.settings.media.media_codecs.clone(),
            })
            .await?;

        let level = services.settings.media.audio_level;
        let observers = async {
            let audio_level_observer = router
                .create_audio_level_observer(AudioLevelObserverOptions {
                    max_entries: level.max_entries,
                    threshold: level.threshold,
                    interval_ms: level.interval_ms,
                })
                .await?;
            let active_speaker_observer = router.create_active_speaker_observer().await?;
            let bot = Bot::create(&router).await?;
            Ok::<_, RoomError>((audio_level_observer, active_speaker_observer, bot))
        };
        let (audio_level_observer, active_speaker_observer, bot) = match observers.await {
            Ok(parts) => parts,
            Err(err) => {
                router.close();
                return Err(err);
            }
        };

        let (capture_tx, capture_rx) = mpsc::unbounded_channel();
        let capture = services
            .capture
            .clone()
            .map(|svc| CaptureMachine::new(room_id, Arc::clone(&router), svc, capture_tx));

        let (relay_outbound, relay_inbound) = match &services.relay {
            Some(relay) => {
                let link = relay.open(room_id);
                (Some(link.outbound), Some(link.inbound))
            }
            None => (None, None),
        };

        let levels = audio_level_observer.subscribe();
        let speakers = active_speaker_observer.subscribe();
        let (events, _) = broadcast::channel(16);

        let room = Arc::new(Self {
            id: room_id.to_string(),
            consumer_replicas,
            settings: services.settings.clone(),
            engine_version: services.engine.version(),
            router,
            audio_level_observer,
            active_speaker_observer,
            bot,
            capture,
            throttle: services.throttle.clone(),
            relay_outbound: Mutex::new(relay_outbound),
            cds: CdsCache::default(),
            peers: Mutex::new(HashMap::new()),
            broadcasters: Mutex::new(HashMap::new()),
            throttled: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            events,
        });

        spawn_event_loop(
            Arc::downgrade(&room),
            room.shutdown.clone(),
            levels,
            speakers,
            relay_inbound,
            capture_rx,
        );

        Ok(room)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn router(&self) -> &Arc<dyn Router> {
        &self.router
    }

    pub fn capture(&self) -> Option<&CaptureMachine> {
        self.capture.as_ref()
    }

    pub fn cds(&self) -> &CdsCache {
        &self.cds
    }

    pub fn consumer_replicas(&self) -> u32 {
        self.consumer_replicas
    }

    pub fn closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn throttled(&self) -> bool {
        self.throttled.load(Ordering::SeqCst)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RoomEvent> {
        self.events.subscribe()
    }

    pub fn peer(&self, peer_id: &str) -> Option<Arc<Peer>> {
        self.peers.lock().get(peer_id).cloned()
    }

    pub fn status(&self) -> RoomStatus {
        let (peers, joined_peers) = {
            let peers = self.peers.lock();
            let mut ids: Vec<String> = peers.keys().cloned().collect();
            ids.sort();
            (ids, peers.values().filter(|p| p.joined()).count())
        };
        let mut broadcasters: Vec<String> = self.broadcasters.lock().keys().cloned().collect();
        broadcasters.sort();

        RoomStatus {
            room_id: self.id.clone(),
            router_id: self.router.id().to_string(),
            peers,
            joined_peers,
            broadcasters,
            capture: self.capture.as_ref().map(CaptureMachine::status),
            throttled: self.throttled(),
            closed: self.closed(),
        }
    }

    /// Joined peers other than `exclude`, snapshotted so no lock is held
    /// while they are notified.
    pub(crate) fn joined_peers(&self, exclude: Option<&str>) -> Vec<Arc<Peer>> {
        self.peers
            .lock()
            .values()
            .filter(|peer| peer.joined() && Some(peer.id()) != exclude)
            .cloned()
            .collect()
    }

    pub(crate) async fn notify_joined(&self, exclude: Option<&str>, notification: Notification) {
        let peers = self.joined_peers(exclude);
        join_all(
            peers
                .iter()
                .map(|peer| peer.notify(notification.clone())),
        )
        .await;
    }

    /// Registers a signaling peer. A peer already connected under the same id
    /// is torn down and replaced.
    pub async fn create_peer(
        &self,
        peer_id: &str,
        channel: Arc<dyn PeerChannel>,
    ) -> RoomResult<Arc<Peer>> {
        if self.closed() {
            return Err(RoomError::RoomClosed);
        }

        let peer = Arc::new(Peer::new(peer_id, channel));
        let previous = self
            .peers
            .lock()
            .insert(peer_id.to_string(), Arc::clone(&peer));

        if let Some(previous) = previous {
            warn!(
                "peer {} reconnected to room {}, closing the previous connection",
                peer_id, self.id
            );
            self.teardown_peer(&previous).await;
        }

        peer.notify(Notification::MediasoupVersion {
            version: self.engine_version.clone(),
        })
        .await;

        Ok(peer)
    }

    async fn teardown_peer(&self, peer: &Arc<Peer>) {
        let was_joined = peer.joined();
        if !peer.close() {
            return;
        }

        if was_joined && !self.closed() {
            self.notify_joined(
                Some(peer.id()),
                Notification::PeerClosed {
                    peer_id: peer.id().to_string(),
                },
            )
            .await;
        }

        peer.close_transports();
    }

    /// Removes a peer whose signaling connection ended. The room closes with
    /// its last peer.
    pub async fn close_peer(&self, peer: &Arc<Peer>) {
        let (removed, remaining) = {
            let mut peers = self.peers.lock();
            let current = matches!(peers.get(peer.id()), Some(p) if Arc::ptr_eq(p, peer));
            if current {
                peers.remove(peer.id());
            }
            (current, peers.len())
        };

        if self.closed() {
            peer.close();
            peer.close_transports();
            return;
        }

        debug!("closing peer {} in room {}", peer.id(), self.id);
        self.teardown_peer(peer).await;

        if removed && remaining == 0 {
            info!("last peer left room {}, closing it", self.id);
            self.close().await;
        }
    }

    /// Closes the room and everything in it. Only the first call has effect.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("closing room {}", self.id);

        self.shutdown.cancel();

        if let Some(capture) = &self.capture {
            capture.stop();
        }

        // Dropping the sender closes the relay connection.
        self.relay_outbound.lock().take();

        let peers: Vec<Arc<Peer>> = self.peers.lock().drain().map(|(_, p)| p).collect();
        for peer in peers {
            peer.close();
            peer.close_transports();
        }

        let broadcasters: Vec<Arc<Broadcaster>> =
            self.broadcasters.lock().drain().map(|(_, b)| b).collect();
        for broadcaster in broadcasters {
            broadcaster.close();
        }

        self.bot.close();
        self.router.close();

        if self.throttled.swap(false, Ordering::SeqCst) {
            if let Some(throttle) = &self.throttle {
                match throttle.stop().await {
                    Ok(()) => info!("network throttle reset on close of room {}", self.id),
                    Err(err) => warn!("failed to reset network throttle: {:#}", err),
                }
            }
        }

        let _ = self.events.send(RoomEvent::Closed {
            room_id: self.id.clone(),
        });
    }

    /// Registers an audio producer with both speaker observers.
    pub(crate) async fn observe_audio(&self, producer: &Arc<dyn Producer>) {
        if let Err(err) = self.audio_level_observer.add_producer(producer.id()).await {
            debug!("audio level observer rejected {}: {}", producer.id(), err);
        }
        if let Err(err) = self
            .active_speaker_observer
            .add_producer(producer.id())
            .await
        {
            debug!("active speaker observer rejected {}: {}", producer.id(), err);
        }
    }

    async fn on_audio_level(&self, event: AudioLevelEvent) {
        let notification = match event {
            AudioLevelEvent::Volumes(volumes) => {
                let Some(loudest) = volumes.first() else {
                    return;
                };
                let peer_id = loudest
                    .producer
                    .app_data()
                    .get("peerId")
                    .and_then(|id| id.as_str())
                    .map(str::to_string);
                Notification::ActiveSpeaker {
                    peer_id,
                    volume: Some(loudest.volume),
                }
            }
            AudioLevelEvent::Silence => Notification::ActiveSpeaker {
                peer_id: None,
                volume: None,
            },
        };
        self.notify_joined(None, notification).await;
    }

    fn on_relay_message(&self, message: RelayMessage) {
        let event = message.event();
        match self.cds.apply(message) {
            Some(kind) => debug!("room {} cached {}", self.id, kind.as_str()),
            None => debug!("room {} ignored relay event {}", self.id, event),
        }
    }

    fn on_capture_event(&self, event: CaptureEvent) {
        match event {
            CaptureEvent::Transcript { room_id, text } => {
                let outbound = self.relay_outbound.lock().clone();
                if let Some(outbound) = outbound {
                    let message = RelayMessage::Transcript {
                        room_id,
                        transcription: text,
                    };
                    if outbound.send(message).is_err() {
                        debug!("relay for room {} is gone, transcript dropped", self.id);
                    }
                }
            }
            CaptureEvent::Stopped { room_id } => {
                info!("capture for room {} finished", room_id);
            }
        }
    }
}

/// Next item from an optional channel. Pends forever once the channel is
/// absent or closed so the select loop simply stops polling it.
async fn next_message<T>(receiver: &mut Option<mpsc::UnboundedReceiver<T>>) -> T {
    if let Some(rx) = receiver {
        if let Some(message) = rx.recv().await {
            return message;
        }
        *receiver = None;
    }
    std::future::pending().await
}

async fn next_event<T: Clone>(receiver: &mut Option<broadcast::Receiver<T>>) -> T {
    if let Some(rx) = receiver {
        loop {
            match rx.recv().await {
                Ok(event) => return event,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!("room event loop skipped {} observer events", skipped)
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
        *receiver = None;
    }
    std::future::pending().await
}

fn spawn_event_loop(
    room: Weak<Room>,
    shutdown: CancellationToken,
    levels: broadcast::Receiver<AudioLevelEvent>,
    speakers: broadcast::Receiver<ActiveSpeakerEvent>,
    relay: Option<mpsc::UnboundedReceiver<RelayMessage>>,
    capture: mpsc::UnboundedReceiver<CaptureEvent>,
) {
    let mut levels = Some(levels);
    let mut speakers = Some(speakers);
    let mut relay = relay;
    let mut capture = Some(capture);

    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,

                event = next_event(&mut levels) => {
                    let Some(room) = room.upgrade() else { break };
                    room.on_audio_level(event).await;
                }

                event = next_event(&mut speakers) => {
                    let ActiveSpeakerEvent::DominantSpeaker { producer_id } = event;
                    debug!("dominant speaker producer {}", producer_id);
                }

                message = next_message(&mut relay) => {
                    let Some(room) = room.upgrade() else { break };
                    room.on_relay_message(message);
                }

                event = next_message(&mut capture) => {
                    let Some(room) = room.upgrade() else { break };
                    room.on_capture_event(event);
                }
            }
        }
        debug!("room event loop finished");
    });
}
