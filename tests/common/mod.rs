//! Fakes shared by the integration tests.
#![allow(dead_code)]

use anyhow::{bail, Result};
use async_trait::async_trait;
use bytes::Bytes;
use carecall::capture::{
    CaptureServices, PortAllocator, ProcessControl, RecognitionConfig, RecognitionStream,
    RecordingRegistry, SpeechRecognizer, TranscodeRequest, Transcoder, TranscoderProcess,
    TranscriptSegment,
};
use carecall::config::{CaptureConfig, MediaConfig};
use carecall::engine::LoopbackEngine;
use carecall::relay::{CdsRelay, RelayLink};
use carecall::room::{Peer, Room, RoomServices, RoomSettings};
use carecall::signaling::{Notification, PeerCall, PeerChannel, SignalingError};
use carecall::throttle::{NetworkThrottle, ThrottleSettings};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWriteExt, DuplexStream};
use tokio::sync::mpsc;

pub const THROTTLE_SECRET: &str = "letmein";

/// One message the server sent to a fake peer.
#[derive(Debug, Clone)]
pub struct Sent {
    pub request: bool,
    pub method: String,
    pub data: Value,
    /// Engine journal at the moment the message was sent.
    pub journal: Vec<String>,
}

/// Records everything sent to the peer. Requests are accepted with `{}`
/// unless their method was rejected or a delay was configured.
pub struct FakeChannel {
    engine: LoopbackEngine,
    sent: Mutex<Vec<Sent>>,
    rejected: Mutex<HashSet<String>>,
    delay: Mutex<Option<Duration>>,
    closed: AtomicBool,
}

impl FakeChannel {
    pub fn new(engine: &LoopbackEngine) -> Arc<Self> {
        Arc::new(Self {
            engine: engine.clone(),
            sent: Mutex::new(Vec::new()),
            rejected: Mutex::new(HashSet::new()),
            delay: Mutex::new(None),
            closed: AtomicBool::new(false),
        })
    }

    pub fn reject(&self, method: &str) {
        self.rejected.lock().insert(method.to_string());
    }

    pub fn delay_requests(&self, delay: Duration) {
        *self.delay.lock() = Some(delay);
    }

    pub fn sent(&self) -> Vec<Sent> {
        self.sent.lock().clone()
    }

    pub fn notifications(&self, method: &str) -> Vec<Value> {
        self.sent
            .lock()
            .iter()
            .filter(|sent| !sent.request && sent.method == method)
            .map(|sent| sent.data.clone())
            .collect()
    }

    pub fn requests(&self, method: &str) -> Vec<Sent> {
        self.sent
            .lock()
            .iter()
            .filter(|sent| sent.request && sent.method == method)
            .cloned()
            .collect()
    }

    pub fn methods(&self) -> Vec<String> {
        self.sent.lock().iter().map(|sent| sent.method.clone()).collect()
    }

    fn push(&self, request: bool, (method, data): (String, Value)) -> String {
        self.sent.lock().push(Sent {
            request,
            method: method.clone(),
            data,
            journal: self.engine.journal(),
        });
        method
    }
}

#[async_trait]
impl PeerChannel for FakeChannel {
    async fn notify(&self, notification: Notification) -> Result<(), SignalingError> {
        if self.closed() {
            return Err(SignalingError::Closed);
        }
        self.push(false, notification.into_parts());
        Ok(())
    }

    async fn request(&self, call: PeerCall) -> Result<Value, SignalingError> {
        if self.closed() {
            return Err(SignalingError::Closed);
        }
        let method = self.push(true, call.into_parts());

        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.rejected.lock().contains(&method) {
            return Err(SignalingError::Rejected {
                code: 500,
                reason: format!("{method} refused"),
            });
        }
        Ok(json!({}))
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Transcoder whose PCM output is written by the test.
#[derive(Default)]
pub struct FakeTranscoder {
    writers: Mutex<Vec<DuplexStream>>,
    requests: Mutex<Vec<TranscodeRequest>>,
    terminated: Arc<AtomicUsize>,
    fail: AtomicBool,
}

struct FakeControl {
    terminated: Arc<AtomicUsize>,
}

impl ProcessControl for FakeControl {
    fn terminate(self: Box<Self>) {
        self.terminated.fetch_add(1, Ordering::SeqCst);
    }
}

impl FakeTranscoder {
    pub fn failing() -> Self {
        let transcoder = Self::default();
        transcoder.fail.store(true, Ordering::SeqCst);
        transcoder
    }

    pub fn spawned(&self) -> usize {
        self.requests.lock().len()
    }

    pub fn requests(&self) -> Vec<TranscodeRequest> {
        self.requests.lock().clone()
    }

    pub fn terminated(&self) -> usize {
        self.terminated.load(Ordering::SeqCst)
    }

    /// Writes `pcm` to the newest transcoder's output.
    pub async fn emit(&self, pcm: &[u8]) {
        let writer = self.writers.lock().pop();
        if let Some(mut writer) = writer {
            writer.write_all(pcm).await.expect("transcoder output closed");
            writer.flush().await.expect("flush transcoder output");
            self.writers.lock().push(writer);
        }
    }

    /// Ends the newest transcoder's output, as if the process exited.
    pub fn exit(&self) {
        self.writers.lock().pop();
    }
}

#[async_trait]
impl Transcoder for FakeTranscoder {
    async fn spawn(&self, request: &TranscodeRequest) -> Result<TranscoderProcess> {
        self.requests.lock().push(request.clone());
        if self.fail.load(Ordering::SeqCst) {
            bail!("transcoder failed to start");
        }

        let (writer, reader) = tokio::io::duplex(4096);
        self.writers.lock().push(writer);
        Ok(TranscoderProcess {
            output: Box::new(reader),
            control: Box::new(FakeControl {
                terminated: Arc::clone(&self.terminated),
            }),
        })
    }
}

/// Recognizer that turns every audio chunk into one final segment holding
/// the chunk as UTF-8 text.
#[derive(Default)]
pub struct EchoRecognizer {
    configs: Mutex<Vec<RecognitionConfig>>,
}

impl EchoRecognizer {
    pub fn configs(&self) -> Vec<RecognitionConfig> {
        self.configs.lock().clone()
    }
}

#[async_trait]
impl SpeechRecognizer for EchoRecognizer {
    async fn open_stream(&self, config: RecognitionConfig) -> Result<RecognitionStream> {
        self.configs.lock().push(config);

        let (audio, mut audio_rx) = mpsc::channel::<Bytes>(16);
        let (segments_tx, segments) = mpsc::channel(16);
        tokio::spawn(async move {
            while let Some(chunk) = audio_rx.recv().await {
                let segment = TranscriptSegment {
                    text: String::from_utf8_lossy(&chunk).into_owned(),
                    is_final: true,
                    confidence: Some(0.9),
                };
                if segments_tx.send(Ok(segment)).await.is_err() {
                    break;
                }
            }
        });

        Ok(RecognitionStream { audio, segments })
    }
}

/// In-process relay; the test holds the remote end of every link.
#[derive(Default)]
pub struct FakeRelay {
    remotes: Mutex<Vec<(String, RelayLink)>>,
}

impl FakeRelay {
    pub fn take_remote(&self, room_id: &str) -> Option<RelayLink> {
        let mut remotes = self.remotes.lock();
        let index = remotes.iter().position(|(id, _)| id == room_id)?;
        Some(remotes.remove(index).1)
    }
}

impl CdsRelay for FakeRelay {
    fn open(&self, room_id: &str) -> RelayLink {
        let (room_end, remote_end) = RelayLink::pair();
        self.remotes.lock().push((room_id.to_string(), remote_end));
        room_end
    }
}

#[derive(Default)]
pub struct FakeThrottle {
    calls: Mutex<Vec<String>>,
    fail: AtomicBool,
}

impl FakeThrottle {
    pub fn fail(&self) {
        self.fail.store(true, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl NetworkThrottle for FakeThrottle {
    async fn start(&self, settings: ThrottleSettings) -> Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            bail!("throttle command exited with status 1");
        }
        self.calls.lock().push(format!(
            "start uplink={} downlink={} rtt={} loss={}",
            settings.uplink, settings.downlink, settings.rtt, settings.packet_loss
        ));
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            bail!("throttle command exited with status 1");
        }
        self.calls.lock().push("stop".to_string());
        Ok(())
    }
}

/// Everything a test needs to build rooms and poke at their collaborators.
pub struct Harness {
    pub engine: LoopbackEngine,
    pub transcoder: Arc<FakeTranscoder>,
    pub recognizer: Arc<EchoRecognizer>,
    pub relay: Arc<FakeRelay>,
    pub throttle: Arc<FakeThrottle>,
    pub services: RoomServices,
    pub work_dir: tempfile::TempDir,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_transcoder(FakeTranscoder::default())
    }

    pub fn with_transcoder(transcoder: FakeTranscoder) -> Self {
        let engine = LoopbackEngine::new();
        let transcoder = Arc::new(transcoder);
        let recognizer = Arc::new(EchoRecognizer::default());
        let relay = Arc::new(FakeRelay::default());
        let throttle = Arc::new(FakeThrottle::default());
        let work_dir = tempfile::tempdir().expect("create work dir");

        let capture_config = CaptureConfig {
            start_delay_ms: 0,
            port_min: 46000,
            port_max: 47999,
            work_dir: Some(work_dir.path().to_path_buf()),
            ..CaptureConfig::default()
        };
        let capture = CaptureServices {
            transcoder: transcoder.clone(),
            recognizer: recognizer.clone(),
            ports: PortAllocator::new(
                IpAddr::V4(Ipv4Addr::LOCALHOST),
                capture_config.port_min,
                capture_config.port_max,
                capture_config.max_port_attempts,
            )
            .expect("port allocator"),
            registry: RecordingRegistry::default(),
            config: capture_config,
            work_dir: work_dir.path().to_path_buf(),
        };

        let services = RoomServices {
            engine: Arc::new(engine.clone()),
            capture: Some(capture),
            relay: Some(relay.clone()),
            throttle: Some(throttle.clone()),
            settings: RoomSettings {
                media: MediaConfig::default(),
                request_timeout: Duration::from_secs(2),
                throttle_secret: Some(THROTTLE_SECRET.to_string()),
            },
        };

        Self {
            engine,
            transcoder,
            recognizer,
            relay,
            throttle,
            services,
            work_dir,
        }
    }

    pub fn without_capture(mut self) -> Self {
        self.services.capture = None;
        self
    }

    pub fn work_dir(&self) -> &Path {
        self.work_dir.path()
    }

    pub async fn room(&self, room_id: &str) -> Arc<Room> {
        self.room_with_replicas(room_id, 0).await
    }

    pub async fn room_with_replicas(&self, room_id: &str, replicas: u32) -> Arc<Room> {
        Room::create(room_id, replicas, &self.services)
            .await
            .expect("create room")
    }

    pub async fn connect(&self, room: &Arc<Room>, peer_id: &str) -> (Arc<Peer>, Arc<FakeChannel>) {
        let channel = FakeChannel::new(&self.engine);
        let peer = room
            .create_peer(peer_id, channel.clone())
            .await
            .expect("create peer");
        (peer, channel)
    }

    /// Connects a peer, joins it with the router's capabilities and gives it
    /// a consuming transport first, so fan-out to it can succeed.
    pub async fn joined_peer(
        &self,
        room: &Arc<Room>,
        peer_id: &str,
    ) -> (Arc<Peer>, Arc<FakeChannel>) {
        let (peer, channel) = self.connect(room, peer_id).await;
        create_transport(room, &peer, false, true).await;
        join(room, &peer, peer_id).await;
        (peer, channel)
    }
}

pub fn opus_parameters() -> Value {
    json!({
        "mid": "0",
        "codecs": [{
            "mimeType": "audio/opus",
            "payloadType": 111,
            "clockRate": 48000,
            "channels": 2,
            "parameters": { "useinbandfec": 1 }
        }],
        "encodings": [{ "ssrc": 1111 }]
    })
}

pub fn vp8_parameters() -> Value {
    json!({
        "mid": "1",
        "codecs": [{
            "mimeType": "video/VP8",
            "payloadType": 96,
            "clockRate": 90000
        }],
        "encodings": [{ "ssrc": 2222 }]
    })
}

pub async fn join(room: &Arc<Room>, peer: &Arc<Peer>, display_name: &str) -> Value {
    room.request(
        peer,
        "join",
        json!({
            "displayName": display_name,
            "device": { "name": "test" },
            "rtpCapabilities": room.router().rtp_capabilities(),
            "sctpCapabilities": { "numStreams": { "OS": 1024, "MIS": 1024 } }
        }),
    )
    .await
    .expect("join")
}

pub async fn create_transport(
    room: &Arc<Room>,
    peer: &Arc<Peer>,
    producing: bool,
    consuming: bool,
) -> String {
    let reply = room
        .request(
            peer,
            "createWebRtcTransport",
            json!({
                "producing": producing,
                "consuming": consuming,
                "sctpCapabilities": { "numStreams": { "OS": 1024, "MIS": 1024 } }
            }),
        )
        .await
        .expect("createWebRtcTransport");
    reply["id"].as_str().expect("transport id").to_string()
}

pub async fn produce(room: &Arc<Room>, peer: &Arc<Peer>, kind: &str, rtp_parameters: Value) -> String {
    let transport_id = create_transport(room, peer, true, false).await;
    let reply = room
        .request(
            peer,
            "produce",
            json!({
                "transportId": transport_id,
                "kind": kind,
                "rtpParameters": rtp_parameters,
                "appData": { "source": kind }
            }),
        )
        .await
        .expect("produce");
    reply["id"].as_str().expect("producer id").to_string()
}

/// Polls `check` until it holds or a second has passed.
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
