//! In-process media engine.
//!
//! Keeps the full router/transport/producer/consumer object graph, the close
//! cascades and the event streams, but never moves a single RTP packet. The
//! test-suite drives rooms through it and `carecall serve --loopback` uses it
//! to exercise signaling clients without a real SFU worker.
//!
//! Every state-changing call is appended to a journal so callers can assert on
//! ordering (for example that a consumer is resumed only after the remote
//! peer acknowledged it).

use super::{
    ActiveSpeakerEvent, ActiveSpeakerObserver, AudioLevelEvent, AudioLevelObserver,
    AudioLevelObserverOptions, AudioVolume, Consumer, ConsumeOptions, ConsumerEvent,
    ConsumerLayers, DataConsumeOptions, DataConsumer, DataConsumerEvent, DataMessage,
    DataProduceOptions, DataProducer, DataProducerEvent, EngineError, EngineResult, MediaEngine,
    MediaKind, PlainTransportOptions, ProduceOptions, Producer, ProducerEvent, Router,
    RouterOptions, Transport, TransportAppData, TransportConnect, TransportEvent, TransportKind,
    TransportTuple, WebRtcTransportOptions,
};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::debug;

const EVENT_CAPACITY: usize = 64;

#[derive(Default)]
struct Shared {
    journal: Mutex<Vec<String>>,
    failures: Mutex<HashMap<String, u32>>,
    delays: Mutex<HashMap<String, Duration>>,
    routers: Mutex<Vec<Arc<LoopbackRouter>>>,
    next_port: AtomicU16,
}

impl Shared {
    fn record(&self, entry: String) {
        debug!("loopback: {}", entry);
        self.journal.lock().push(entry);
    }

    fn check(&self, operation: &str) -> EngineResult<()> {
        let mut failures = self.failures.lock();
        if let Some(remaining) = failures.get_mut(operation) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(EngineError::new(format!("injected {operation} failure")));
            }
        }
        Ok(())
    }

    async fn stall(&self, operation: &str) {
        let delay = self.delays.lock().get(operation).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }

    fn port(&self) -> u16 {
        40000 + self.next_port.fetch_add(2, Ordering::SeqCst) % 10000
    }
}

fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

fn stats(kind: &str, id: &str) -> Value {
    json!([{
        "type": kind,
        "id": id,
        "timestamp": chrono::Utc::now().timestamp_millis(),
    }])
}

fn mime_types(value: &Value) -> Vec<String> {
    value
        .get("codecs")
        .and_then(Value::as_array)
        .map(|codecs| {
            codecs
                .iter()
                .filter_map(|codec| codec.get("mimeType").and_then(Value::as_str))
                .map(str::to_lowercase)
                .collect()
        })
        .unwrap_or_default()
}

#[derive(Clone, Default)]
pub struct LoopbackEngine {
    shared: Arc<Shared>,
}

impl LoopbackEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every recorded engine call, oldest first.
    pub fn journal(&self) -> Vec<String> {
        self.shared.journal.lock().clone()
    }

    /// Makes the next `count` calls of `operation` fail. Operation names match
    /// the trait methods: `create_router`, `produce`, `consume`, ...
    pub fn fail_next(&self, operation: &str, count: u32) {
        self.shared
            .failures
            .lock()
            .insert(operation.to_string(), count);
    }

    /// Makes every call of `operation` sleep for `delay` before completing.
    pub fn delay(&self, operation: &str, delay: Duration) {
        self.shared
            .delays
            .lock()
            .insert(operation.to_string(), delay);
    }

    pub fn routers(&self) -> Vec<Arc<LoopbackRouter>> {
        self.shared.routers.lock().clone()
    }
}

#[async_trait]
impl MediaEngine for LoopbackEngine {
    fn version(&self) -> String {
        format!("loopback-{}", env!("CARGO_PKG_VERSION"))
    }

    async fn create_router(&self, options: RouterOptions) -> EngineResult<Arc<dyn Router>> {
        self.shared.check("create_router")?;

        let router = Arc::new_cyclic(|weak| LoopbackRouter {
            id: new_id(),
            this: weak.clone(),
            shared: Arc::clone(&self.shared),
            rtp_capabilities: json!({
                "codecs": options.media_codecs,
                "headerExtensions": [],
            }),
            closed: AtomicBool::new(false),
            inner: Mutex::new(RouterInner::default()),
        });

        self.shared.record(format!("router.create {}", router.id));
        self.shared.routers.lock().push(Arc::clone(&router));
        Ok(router)
    }
}

#[derive(Default)]
struct RouterInner {
    transports: Vec<Arc<LoopbackTransport>>,
    producers: HashMap<String, Weak<LoopbackProducer>>,
    data_producers: HashMap<String, Weak<LoopbackDataProducer>>,
    audio_level_observers: Vec<Arc<LoopbackAudioLevelObserver>>,
    active_speaker_observers: Vec<Arc<LoopbackActiveSpeakerObserver>>,
}

pub struct LoopbackRouter {
    id: String,
    this: Weak<LoopbackRouter>,
    shared: Arc<Shared>,
    rtp_capabilities: Value,
    closed: AtomicBool,
    inner: Mutex<RouterInner>,
}

impl LoopbackRouter {
    pub fn transport(&self, id: &str) -> Option<Arc<LoopbackTransport>> {
        self.inner
            .lock()
            .transports
            .iter()
            .find(|t| t.id == id)
            .cloned()
    }

    pub fn transports(&self) -> Vec<Arc<LoopbackTransport>> {
        self.inner.lock().transports.clone()
    }

    pub fn producer(&self, id: &str) -> Option<Arc<LoopbackProducer>> {
        self.inner.lock().producers.get(id).and_then(Weak::upgrade)
    }

    pub fn data_producer(&self, id: &str) -> Option<Arc<LoopbackDataProducer>> {
        self.inner
            .lock()
            .data_producers
            .get(id)
            .and_then(Weak::upgrade)
    }

    pub fn audio_level_observers(&self) -> Vec<Arc<LoopbackAudioLevelObserver>> {
        self.inner.lock().audio_level_observers.clone()
    }

    pub fn active_speaker_observers(&self) -> Vec<Arc<LoopbackActiveSpeakerObserver>> {
        self.inner.lock().active_speaker_observers.clone()
    }

    fn live_producer(&self, id: &str) -> Option<Arc<LoopbackProducer>> {
        self.producer(id).filter(|p| !p.closed())
    }

    fn unregister_producer(&self, id: &str) {
        self.inner.lock().producers.remove(id);
    }

    fn unregister_data_producer(&self, id: &str) {
        self.inner.lock().data_producers.remove(id);
    }

    fn new_transport(
        &self,
        kind: TransportKind,
        app_data: TransportAppData,
        parameters: impl FnOnce(&str) -> Value,
        tuple: Option<TransportTuple>,
        rtcp_tuple: Option<TransportTuple>,
    ) -> Arc<LoopbackTransport> {
        let id = new_id();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let transport = Arc::new(LoopbackTransport {
            parameters: parameters(&id),
            id,
            kind,
            app_data,
            shared: Arc::clone(&self.shared),
            router: self.this.clone(),
            closed: AtomicBool::new(false),
            events,
            inner: Mutex::new(TransportInner {
                tuple,
                rtcp_tuple,
                ..TransportInner::default()
            }),
        });

        self.inner.lock().transports.push(Arc::clone(&transport));
        self.shared
            .record(format!("transport.create {} {:?}", transport.id, kind));
        transport
    }

    fn ensure_open(&self) -> EngineResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(EngineError::new("router closed"));
        }
        Ok(())
    }
}

#[async_trait]
impl Router for LoopbackRouter {
    fn id(&self) -> &str {
        &self.id
    }

    fn rtp_capabilities(&self) -> Value {
        self.rtp_capabilities.clone()
    }

    fn can_consume(&self, producer_id: &str, rtp_capabilities: &Value) -> bool {
        let Some(producer) = self.live_producer(producer_id) else {
            return false;
        };
        let accepted = mime_types(rtp_capabilities);
        mime_types(&producer.rtp_parameters)
            .iter()
            .any(|mime| accepted.contains(mime))
    }

    async fn create_webrtc_transport(
        &self,
        options: WebRtcTransportOptions,
    ) -> EngineResult<Arc<dyn Transport>> {
        self.ensure_open()?;
        self.shared.check("create_webrtc_transport")?;
        self.shared.stall("create_webrtc_transport").await;

        let ip = options
            .announced_ip
            .clone()
            .unwrap_or_else(|| options.listen_ip.clone());
        let port = self.shared.port();
        let protocol = if options.enable_udp { "udp" } else { "tcp" };
        let enable_sctp = options.enable_sctp;

        let transport = self.new_transport(
            TransportKind::WebRtc,
            options.app_data,
            |id| {
                json!({
                    "id": id,
                    "iceParameters": {
                        "usernameFragment": &id[..8],
                        "password": id.replace('-', ""),
                        "iceLite": true,
                    },
                    "iceCandidates": [{
                        "foundation": format!("{protocol}candidate"),
                        "ip": ip,
                        "port": port,
                        "priority": 1076302079u32,
                        "protocol": protocol,
                        "type": "host",
                    }],
                    "dtlsParameters": {
                        "role": "auto",
                        "fingerprints": [{ "algorithm": "sha-256", "value": "00:11:22:33" }],
                    },
                    "sctpParameters": if enable_sctp {
                        json!({ "port": 5000, "OS": 1024, "MIS": 1024, "maxMessageSize": 262144 })
                    } else {
                        Value::Null
                    },
                })
            },
            None,
            None,
        );
        transport.inner.lock().ice_consent_timeout = Some(options.ice_consent_timeout);
        Ok(transport)
    }

    async fn create_plain_transport(
        &self,
        options: PlainTransportOptions,
    ) -> EngineResult<Arc<dyn Transport>> {
        self.ensure_open()?;
        self.shared.check("create_plain_transport")?;
        self.shared.stall("create_plain_transport").await;

        let ip = options
            .announced_ip
            .clone()
            .unwrap_or_else(|| options.listen_ip.clone());
        let port = self.shared.port();
        let tuple = TransportTuple {
            local_ip: ip.clone(),
            local_port: port,
            remote_ip: None,
            remote_port: None,
            protocol: "udp".to_string(),
        };
        let rtcp_tuple = (!options.rtcp_mux).then(|| TransportTuple {
            local_port: port + 1,
            ..tuple.clone()
        });
        let rtcp_port = rtcp_tuple.as_ref().map(|t| t.local_port);

        let transport = self.new_transport(
            TransportKind::Plain,
            options.app_data,
            |id| json!({ "id": id, "ip": ip, "port": port, "rtcpPort": rtcp_port }),
            Some(tuple),
            rtcp_tuple,
        );
        Ok(transport)
    }

    async fn create_direct_transport(&self) -> EngineResult<Arc<dyn Transport>> {
        self.ensure_open()?;
        self.shared.check("create_direct_transport")?;

        let transport = self.new_transport(
            TransportKind::Direct,
            TransportAppData::default(),
            |id| json!({ "id": id }),
            None,
            None,
        );
        Ok(transport)
    }

    async fn create_audio_level_observer(
        &self,
        options: AudioLevelObserverOptions,
    ) -> EngineResult<Arc<dyn AudioLevelObserver>> {
        self.ensure_open()?;
        self.shared.check("create_audio_level_observer")?;

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let observer = Arc::new(LoopbackAudioLevelObserver {
            router: self.this.clone(),
            options,
            producers: Mutex::new(Vec::new()),
            events,
        });
        self.inner
            .lock()
            .audio_level_observers
            .push(Arc::clone(&observer));
        Ok(observer)
    }

    async fn create_active_speaker_observer(&self) -> EngineResult<Arc<dyn ActiveSpeakerObserver>> {
        self.ensure_open()?;
        self.shared.check("create_active_speaker_observer")?;

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let observer = Arc::new(LoopbackActiveSpeakerObserver {
            producers: Mutex::new(Vec::new()),
            events,
        });
        self.inner
            .lock()
            .active_speaker_observers
            .push(Arc::clone(&observer));
        Ok(observer)
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let transports = std::mem::take(&mut self.inner.lock().transports);
        for transport in transports {
            transport.close();
        }
        self.shared.record(format!("router.close {}", self.id));
    }

    fn closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
struct TransportInner {
    tuple: Option<TransportTuple>,
    rtcp_tuple: Option<TransportTuple>,
    max_incoming_bitrate: Option<u32>,
    ice_consent_timeout: Option<u8>,
    trace_types: Vec<String>,
    producers: Vec<Arc<LoopbackProducer>>,
    consumers: Vec<Arc<LoopbackConsumer>>,
    data_producers: Vec<Arc<LoopbackDataProducer>>,
    data_consumers: Vec<Arc<LoopbackDataConsumer>>,
}

pub struct LoopbackTransport {
    id: String,
    kind: TransportKind,
    app_data: TransportAppData,
    parameters: Value,
    shared: Arc<Shared>,
    router: Weak<LoopbackRouter>,
    closed: AtomicBool,
    events: broadcast::Sender<TransportEvent>,
    inner: Mutex<TransportInner>,
}

impl LoopbackTransport {
    /// Publishes an event as if the engine had raised it.
    pub fn emit(&self, event: TransportEvent) {
        let _ = self.events.send(event);
    }

    pub fn max_incoming_bitrate(&self) -> Option<u32> {
        self.inner.lock().max_incoming_bitrate
    }

    pub fn ice_consent_timeout(&self) -> Option<u8> {
        self.inner.lock().ice_consent_timeout
    }

    pub fn trace_types(&self) -> Vec<String> {
        self.inner.lock().trace_types.clone()
    }

    fn router(&self) -> EngineResult<Arc<LoopbackRouter>> {
        self.router
            .upgrade()
            .ok_or_else(|| EngineError::new("router gone"))
    }

    fn ensure_open(&self) -> EngineResult<()> {
        if self.closed() {
            return Err(EngineError::new(format!("transport {} closed", self.id)));
        }
        Ok(())
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> TransportKind {
        self.kind
    }

    fn app_data(&self) -> TransportAppData {
        self.app_data
    }

    fn parameters(&self) -> Value {
        self.parameters.clone()
    }

    fn tuple(&self) -> Option<TransportTuple> {
        self.inner.lock().tuple.clone()
    }

    fn rtcp_tuple(&self) -> Option<TransportTuple> {
        self.inner.lock().rtcp_tuple.clone()
    }

    async fn connect(&self, params: TransportConnect) -> EngineResult<()> {
        self.ensure_open()?;
        self.shared.check("connect")?;

        match (self.kind, params) {
            (TransportKind::WebRtc, TransportConnect::WebRtc { .. }) => {}
            (TransportKind::Plain, TransportConnect::Plain { ip, port, rtcp_port }) => {
                let mut inner = self.inner.lock();
                if let Some(tuple) = inner.tuple.as_mut() {
                    tuple.remote_ip = Some(ip.clone());
                    tuple.remote_port = Some(port);
                }
                if let (Some(tuple), Some(rtcp_port)) = (inner.rtcp_tuple.as_mut(), rtcp_port) {
                    tuple.remote_ip = Some(ip);
                    tuple.remote_port = Some(rtcp_port);
                }
            }
            (kind, _) => {
                return Err(EngineError::new(format!(
                    "connect parameters do not match {kind:?} transport"
                )))
            }
        }

        self.shared.record(format!("transport.connect {}", self.id));
        Ok(())
    }

    async fn restart_ice(&self) -> EngineResult<Value> {
        self.ensure_open()?;
        if self.kind != TransportKind::WebRtc {
            return Err(EngineError::new("restartIce requires a WebRTC transport"));
        }
        let fresh = new_id();
        Ok(json!({
            "usernameFragment": &fresh[..8],
            "password": fresh.replace('-', ""),
            "iceLite": true,
        }))
    }

    async fn set_max_incoming_bitrate(&self, bitrate: u32) -> EngineResult<()> {
        self.ensure_open()?;
        self.inner.lock().max_incoming_bitrate = Some(bitrate);
        Ok(())
    }

    async fn enable_trace_event(&self, types: Vec<String>) -> EngineResult<()> {
        self.ensure_open()?;
        self.inner.lock().trace_types = types;
        Ok(())
    }

    async fn get_stats(&self) -> EngineResult<Value> {
        self.ensure_open()?;
        Ok(stats("transport", &self.id))
    }

    async fn produce(&self, options: ProduceOptions) -> EngineResult<Arc<dyn Producer>> {
        self.ensure_open()?;
        self.shared.check("produce")?;
        let router = self.router()?;

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let producer = Arc::new(LoopbackProducer {
            id: new_id(),
            kind: options.kind,
            rtp_parameters: options.rtp_parameters,
            app_data: options.app_data,
            shared: Arc::clone(&self.shared),
            router: self.router.clone(),
            paused: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            events,
            consumers: Mutex::new(Vec::new()),
        });

        router
            .inner
            .lock()
            .producers
            .insert(producer.id.clone(), Arc::downgrade(&producer));
        self.inner.lock().producers.push(Arc::clone(&producer));
        self.shared.record(format!(
            "producer.create {} {}",
            producer.id,
            producer.kind.as_str()
        ));
        Ok(producer)
    }

    async fn consume(&self, options: ConsumeOptions) -> EngineResult<Arc<dyn Consumer>> {
        self.ensure_open()?;
        self.shared.check("consume")?;
        let router = self.router()?;

        let producer = router.live_producer(&options.producer_id).ok_or_else(|| {
            EngineError::new(format!("producer {} not found", options.producer_id))
        })?;
        if !router.can_consume(&producer.id, &options.rtp_capabilities) {
            return Err(EngineError::new("cannot consume with given rtpCapabilities"));
        }

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let consumer = Arc::new(LoopbackConsumer {
            id: new_id(),
            producer_id: producer.id.clone(),
            kind: producer.kind,
            rtp_parameters: producer.rtp_parameters.clone(),
            shared: Arc::clone(&self.shared),
            paused: AtomicBool::new(options.paused),
            producer_paused: AtomicBool::new(producer.paused()),
            closed: AtomicBool::new(false),
            priority: AtomicU8::new(1),
            preferred_layers: Mutex::new(None),
            events,
        });

        producer.consumers.lock().push(Arc::downgrade(&consumer));
        self.inner.lock().consumers.push(Arc::clone(&consumer));
        self.shared.record(format!(
            "consumer.create {} producer={} paused={}",
            consumer.id, producer.id, options.paused
        ));
        Ok(consumer)
    }

    async fn produce_data(
        &self,
        options: DataProduceOptions,
    ) -> EngineResult<Arc<dyn DataProducer>> {
        self.ensure_open()?;
        self.shared.check("produce_data")?;
        let router = self.router()?;

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let data_producer = Arc::new(LoopbackDataProducer {
            id: new_id(),
            label: options.label,
            protocol: options.protocol,
            app_data: options.app_data,
            sctp_stream_parameters: options.sctp_stream_parameters,
            shared: Arc::clone(&self.shared),
            router: self.router.clone(),
            closed: AtomicBool::new(false),
            events,
            consumers: Mutex::new(Vec::new()),
        });

        router
            .inner
            .lock()
            .data_producers
            .insert(data_producer.id.clone(), Arc::downgrade(&data_producer));
        self.inner
            .lock()
            .data_producers
            .push(Arc::clone(&data_producer));
        self.shared.record(format!(
            "data_producer.create {} label={}",
            data_producer.id, data_producer.label
        ));
        Ok(data_producer)
    }

    async fn consume_data(
        &self,
        options: DataConsumeOptions,
    ) -> EngineResult<Arc<dyn DataConsumer>> {
        self.ensure_open()?;
        self.shared.check("consume_data")?;
        let router = self.router()?;

        let data_producer = router
            .data_producer(&options.data_producer_id)
            .filter(|dp| !dp.closed())
            .ok_or_else(|| {
                EngineError::new(format!(
                    "data producer {} not found",
                    options.data_producer_id
                ))
            })?;

        let stream_id = self.inner.lock().data_consumers.len() as u16;
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let data_consumer = Arc::new(LoopbackDataConsumer {
            id: new_id(),
            data_producer_id: data_producer.id.clone(),
            label: data_producer.label.clone(),
            protocol: data_producer.protocol.clone(),
            sctp_stream_parameters: (self.kind != TransportKind::Direct)
                .then(|| json!({ "streamId": stream_id, "ordered": true })),
            closed: AtomicBool::new(false),
            events,
        });

        data_producer
            .consumers
            .lock()
            .push(Arc::downgrade(&data_consumer));
        self.inner
            .lock()
            .data_consumers
            .push(Arc::clone(&data_consumer));
        self.shared.record(format!(
            "data_consumer.create {} data_producer={}",
            data_consumer.id, data_producer.id
        ));
        Ok(data_consumer)
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let inner = std::mem::take(&mut *self.inner.lock());
        for consumer in inner.consumers {
            consumer.close_with(ConsumerEvent::TransportClose);
        }
        for data_consumer in inner.data_consumers {
            data_consumer.close_with(DataConsumerEvent::TransportClose);
        }
        for producer in inner.producers {
            let _ = producer.events.send(ProducerEvent::TransportClose);
            producer.close();
        }
        for data_producer in inner.data_producers {
            let _ = data_producer.events.send(DataProducerEvent::TransportClose);
            data_producer.close();
        }

        if let Some(router) = self.router.upgrade() {
            router.inner.lock().transports.retain(|t| t.id != self.id);
        }

        self.emit(TransportEvent::Closed);
        self.shared.record(format!("transport.close {}", self.id));
    }

    fn closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }
}

pub struct LoopbackProducer {
    id: String,
    kind: MediaKind,
    rtp_parameters: Value,
    app_data: Value,
    shared: Arc<Shared>,
    router: Weak<LoopbackRouter>,
    paused: AtomicBool,
    closed: AtomicBool,
    events: broadcast::Sender<ProducerEvent>,
    consumers: Mutex<Vec<Weak<LoopbackConsumer>>>,
}

impl LoopbackProducer {
    pub fn emit(&self, event: ProducerEvent) {
        let _ = self.events.send(event);
    }

    fn live_consumers(&self) -> Vec<Arc<LoopbackConsumer>> {
        self.consumers
            .lock()
            .iter()
            .filter_map(Weak::upgrade)
            .filter(|c| !c.closed())
            .collect()
    }
}

#[async_trait]
impl Producer for LoopbackProducer {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn rtp_parameters(&self) -> Value {
        self.rtp_parameters.clone()
    }

    fn app_data(&self) -> Value {
        self.app_data.clone()
    }

    fn paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    async fn pause(&self) -> EngineResult<()> {
        if self.closed() {
            return Err(EngineError::new("producer closed"));
        }
        if !self.paused.swap(true, Ordering::SeqCst) {
            for consumer in self.live_consumers() {
                consumer.producer_paused.store(true, Ordering::SeqCst);
                let _ = consumer.events.send(ConsumerEvent::ProducerPause);
            }
        }
        self.shared.record(format!("producer.pause {}", self.id));
        Ok(())
    }

    async fn resume(&self) -> EngineResult<()> {
        if self.closed() {
            return Err(EngineError::new("producer closed"));
        }
        if self.paused.swap(false, Ordering::SeqCst) {
            for consumer in self.live_consumers() {
                consumer.producer_paused.store(false, Ordering::SeqCst);
                let _ = consumer.events.send(ConsumerEvent::ProducerResume);
            }
        }
        self.shared.record(format!("producer.resume {}", self.id));
        Ok(())
    }

    async fn enable_trace_event(&self, _types: Vec<String>) -> EngineResult<()> {
        Ok(())
    }

    async fn get_stats(&self) -> EngineResult<Value> {
        Ok(stats("inbound-rtp", &self.id))
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(router) = self.router.upgrade() {
            router.unregister_producer(&self.id);
        }
        for consumer in self.live_consumers() {
            consumer.close_with(ConsumerEvent::ProducerClose);
        }
        self.shared.record(format!("producer.close {}", self.id));
    }

    fn closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn subscribe(&self) -> broadcast::Receiver<ProducerEvent> {
        self.events.subscribe()
    }
}

pub struct LoopbackConsumer {
    id: String,
    producer_id: String,
    kind: MediaKind,
    rtp_parameters: Value,
    shared: Arc<Shared>,
    paused: AtomicBool,
    producer_paused: AtomicBool,
    closed: AtomicBool,
    priority: AtomicU8,
    preferred_layers: Mutex<Option<ConsumerLayers>>,
    events: broadcast::Sender<ConsumerEvent>,
}

impl LoopbackConsumer {
    pub fn emit(&self, event: ConsumerEvent) {
        let _ = self.events.send(event);
    }

    pub fn priority(&self) -> u8 {
        self.priority.load(Ordering::SeqCst)
    }

    pub fn preferred_layers(&self) -> Option<ConsumerLayers> {
        *self.preferred_layers.lock()
    }

    fn close_with(&self, event: ConsumerEvent) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.events.send(event);
        self.shared.record(format!("consumer.close {}", self.id));
    }

    fn ensure_open(&self) -> EngineResult<()> {
        if self.closed() {
            return Err(EngineError::new(format!("consumer {} closed", self.id)));
        }
        Ok(())
    }
}

#[async_trait]
impl Consumer for LoopbackConsumer {
    fn id(&self) -> &str {
        &self.id
    }

    fn producer_id(&self) -> &str {
        &self.producer_id
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn rtp_parameters(&self) -> Value {
        self.rtp_parameters.clone()
    }

    fn consumer_type(&self) -> String {
        "simple".to_string()
    }

    fn paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    fn producer_paused(&self) -> bool {
        self.producer_paused.load(Ordering::SeqCst)
    }

    fn score(&self) -> Value {
        json!({ "score": 10, "producerScore": 10, "producerScores": [10] })
    }

    async fn pause(&self) -> EngineResult<()> {
        self.ensure_open()?;
        self.paused.store(true, Ordering::SeqCst);
        self.shared.record(format!("consumer.pause {}", self.id));
        Ok(())
    }

    async fn resume(&self) -> EngineResult<()> {
        self.ensure_open()?;
        self.shared.check("resume")?;
        self.paused.store(false, Ordering::SeqCst);
        self.shared.record(format!("consumer.resume {}", self.id));
        Ok(())
    }

    async fn set_preferred_layers(&self, layers: ConsumerLayers) -> EngineResult<()> {
        self.ensure_open()?;
        *self.preferred_layers.lock() = Some(layers);
        let _ = self.events.send(ConsumerEvent::LayersChange(Some(layers)));
        Ok(())
    }

    async fn set_priority(&self, priority: u8) -> EngineResult<()> {
        self.ensure_open()?;
        self.priority.store(priority, Ordering::SeqCst);
        Ok(())
    }

    async fn request_key_frame(&self) -> EngineResult<()> {
        self.ensure_open()?;
        self.shared.record(format!("consumer.key_frame {}", self.id));
        Ok(())
    }

    async fn get_stats(&self) -> EngineResult<Value> {
        self.ensure_open()?;
        Ok(stats("outbound-rtp", &self.id))
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shared.record(format!("consumer.close {}", self.id));
    }

    fn closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn subscribe(&self) -> broadcast::Receiver<ConsumerEvent> {
        self.events.subscribe()
    }
}

pub struct LoopbackDataProducer {
    id: String,
    label: String,
    protocol: String,
    app_data: Value,
    sctp_stream_parameters: Option<Value>,
    shared: Arc<Shared>,
    router: Weak<LoopbackRouter>,
    closed: AtomicBool,
    events: broadcast::Sender<DataProducerEvent>,
    consumers: Mutex<Vec<Weak<LoopbackDataConsumer>>>,
}

impl LoopbackDataProducer {
    fn live_consumers(&self) -> Vec<Arc<LoopbackDataConsumer>> {
        self.consumers
            .lock()
            .iter()
            .filter_map(Weak::upgrade)
            .filter(|c| !c.closed())
            .collect()
    }
}

#[async_trait]
impl DataProducer for LoopbackDataProducer {
    fn id(&self) -> &str {
        &self.id
    }

    fn label(&self) -> &str {
        &self.label
    }

    fn protocol(&self) -> &str {
        &self.protocol
    }

    fn app_data(&self) -> Value {
        self.app_data.clone()
    }

    fn sctp_stream_parameters(&self) -> Option<Value> {
        self.sctp_stream_parameters.clone()
    }

    async fn send_text(&self, text: &str) -> EngineResult<()> {
        if self.closed() {
            return Err(EngineError::new("data producer closed"));
        }
        let message = DataMessage {
            payload: Bytes::copy_from_slice(text.as_bytes()),
            ppid: DataMessage::PPID_STRING,
        };
        for consumer in self.live_consumers() {
            let _ = consumer
                .events
                .send(DataConsumerEvent::Message(message.clone()));
        }
        self.shared
            .record(format!("data_producer.send {} {}", self.id, text));
        Ok(())
    }

    async fn get_stats(&self) -> EngineResult<Value> {
        Ok(stats("data-producer", &self.id))
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(router) = self.router.upgrade() {
            router.unregister_data_producer(&self.id);
        }
        for consumer in self.live_consumers() {
            consumer.close_with(DataConsumerEvent::DataProducerClose);
        }
        self.shared
            .record(format!("data_producer.close {}", self.id));
    }

    fn closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn subscribe(&self) -> broadcast::Receiver<DataProducerEvent> {
        self.events.subscribe()
    }
}

pub struct LoopbackDataConsumer {
    id: String,
    data_producer_id: String,
    label: String,
    protocol: String,
    sctp_stream_parameters: Option<Value>,
    closed: AtomicBool,
    events: broadcast::Sender<DataConsumerEvent>,
}

impl LoopbackDataConsumer {
    fn close_with(&self, event: DataConsumerEvent) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.events.send(event);
    }
}

#[async_trait]
impl DataConsumer for LoopbackDataConsumer {
    fn id(&self) -> &str {
        &self.id
    }

    fn data_producer_id(&self) -> &str {
        &self.data_producer_id
    }

    fn label(&self) -> &str {
        &self.label
    }

    fn protocol(&self) -> &str {
        &self.protocol
    }

    fn sctp_stream_parameters(&self) -> Option<Value> {
        self.sctp_stream_parameters.clone()
    }

    async fn get_stats(&self) -> EngineResult<Value> {
        Ok(stats("data-consumer", &self.id))
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn subscribe(&self) -> broadcast::Receiver<DataConsumerEvent> {
        self.events.subscribe()
    }
}

pub struct LoopbackAudioLevelObserver {
    router: Weak<LoopbackRouter>,
    options: AudioLevelObserverOptions,
    producers: Mutex<Vec<String>>,
    events: broadcast::Sender<AudioLevelEvent>,
}

impl LoopbackAudioLevelObserver {
    pub fn producer_ids(&self) -> Vec<String> {
        self.producers.lock().clone()
    }

    /// Reports `producer_id` as the loudest producer, or silence when the
    /// volume is under the configured threshold.
    pub fn emit_volume(&self, producer_id: &str, volume: i8) {
        let producer = self
            .router
            .upgrade()
            .and_then(|router| router.producer(producer_id));

        let event = match producer {
            Some(producer) if volume >= self.options.threshold => {
                AudioLevelEvent::Volumes(vec![AudioVolume { producer, volume }])
            }
            _ => AudioLevelEvent::Silence,
        };
        let _ = self.events.send(event);
    }
}

#[async_trait]
impl AudioLevelObserver for LoopbackAudioLevelObserver {
    async fn add_producer(&self, producer_id: &str) -> EngineResult<()> {
        self.producers.lock().push(producer_id.to_string());
        Ok(())
    }

    async fn remove_producer(&self, producer_id: &str) -> EngineResult<()> {
        self.producers.lock().retain(|id| id != producer_id);
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<AudioLevelEvent> {
        self.events.subscribe()
    }
}

pub struct LoopbackActiveSpeakerObserver {
    producers: Mutex<Vec<String>>,
    events: broadcast::Sender<ActiveSpeakerEvent>,
}

impl LoopbackActiveSpeakerObserver {
    pub fn producer_ids(&self) -> Vec<String> {
        self.producers.lock().clone()
    }

    pub fn emit_dominant(&self, producer_id: &str) {
        let _ = self.events.send(ActiveSpeakerEvent::DominantSpeaker {
            producer_id: producer_id.to_string(),
        });
    }
}

#[async_trait]
impl ActiveSpeakerObserver for LoopbackActiveSpeakerObserver {
    async fn add_producer(&self, producer_id: &str) -> EngineResult<()> {
        self.producers.lock().push(producer_id.to_string());
        Ok(())
    }

    async fn remove_producer(&self, producer_id: &str) -> EngineResult<()> {
        self.producers.lock().retain(|id| id != producer_id);
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<ActiveSpeakerEvent> {
        self.events.subscribe()
    }
}
