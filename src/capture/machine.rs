//! Per-room capture session lifecycle.
//!
//! Idle → Allocating → Running → Stopping → Idle
//!
//! A session taps one audio producer through a plain transport, lets the
//! transcoder turn the RTP stream into PCM and streams that PCM into the
//! speech recognizer. Transcript segments come back to the room as
//! [`CaptureEvent`]s.

use super::ports::{PortAllocator, PortLease};
use super::recognizer::{RecognitionConfig, RecognitionStream, SpeechRecognizer};
use super::sdp::audio_sdp;
use super::transcoder::{ProcessControl, TranscodeRequest, Transcoder};
use crate::config::CaptureConfig;
use crate::engine::{
    CodecInfo, ConsumeOptions, Consumer, MediaKind, PlainTransportOptions, Producer, Router,
    Transport, TransportAppData, TransportConnect,
};
use crate::error::{RoomError, RoomResult};
use futures::StreamExt;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::io::ReaderStream;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CapturePhase {
    Idle,
    Allocating,
    Running,
    Stopping,
}

impl CapturePhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Allocating => "allocating",
            Self::Running => "running",
            Self::Stopping => "stopping",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CaptureEvent {
    Transcript { room_id: String, text: String },
    Stopped { room_id: String },
}

/// Room ids that currently own a capture session, shared by every room in
/// the process.
#[derive(Clone, Default)]
pub struct RecordingRegistry {
    rooms: Arc<Mutex<HashSet<String>>>,
}

impl RecordingRegistry {
    /// Returns false if the room already holds the claim.
    pub fn claim(&self, room_id: &str) -> bool {
        self.rooms.lock().insert(room_id.to_string())
    }

    pub fn release(&self, room_id: &str) {
        self.rooms.lock().remove(room_id);
    }
}

/// Collaborators shared by every room's capture machine.
#[derive(Clone)]
pub struct CaptureServices {
    pub transcoder: Arc<dyn Transcoder>,
    pub recognizer: Arc<dyn SpeechRecognizer>,
    pub ports: PortAllocator,
    pub registry: RecordingRegistry,
    pub config: CaptureConfig,
    pub work_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize)]
pub struct CaptureStatus {
    pub phase: CapturePhase,
    pub producer_id: Option<String>,
    pub audio_port: Option<u16>,
    pub rtcp_port: Option<u16>,
    pub last_error: Option<String>,
}

struct CaptureSession {
    producer_id: String,
    tap: Arc<dyn Transport>,
    _tap_consumer: Arc<dyn Consumer>,
    ports: PortLease,
    control: Option<Box<dyn ProcessControl>>,
    pump: Option<JoinHandle<()>>,
}

impl CaptureSession {
    fn shutdown(mut self, abort_pump: bool) {
        if let Some(control) = self.control.take() {
            control.terminate();
        }
        if abort_pump {
            if let Some(pump) = self.pump.take() {
                pump.abort();
            }
        }
        self.tap.close();
    }
}

struct MachineState {
    phase: CapturePhase,
    generation: u64,
    session: Option<CaptureSession>,
    transcript: String,
    last_error: Option<String>,
}

pub struct CaptureMachine {
    room_id: String,
    router: Arc<dyn Router>,
    services: CaptureServices,
    events: mpsc::UnboundedSender<CaptureEvent>,
    state: Arc<Mutex<MachineState>>,
}

impl CaptureMachine {
    pub fn new(
        room_id: &str,
        router: Arc<dyn Router>,
        services: CaptureServices,
        events: mpsc::UnboundedSender<CaptureEvent>,
    ) -> Self {
        Self {
            room_id: room_id.to_string(),
            router,
            services,
            events,
            state: Arc::new(Mutex::new(MachineState {
                phase: CapturePhase::Idle,
                generation: 0,
                session: None,
                transcript: String::new(),
                last_error: None,
            })),
        }
    }

    pub fn phase(&self) -> CapturePhase {
        self.state.lock().phase
    }

    /// Transcript text accumulated over every session of this room.
    pub fn transcript(&self) -> String {
        self.state.lock().transcript.clone()
    }

    pub fn status(&self) -> CaptureStatus {
        let state = self.state.lock();
        let session = state.session.as_ref();
        CaptureStatus {
            phase: state.phase,
            producer_id: session.map(|s| s.producer_id.clone()),
            audio_port: session.map(|s| s.ports.audio_port),
            rtcp_port: session.map(|s| s.ports.rtcp_port),
            last_error: state.last_error.clone(),
        }
    }

    /// Starts capturing `producer`. Fails with `AlreadyRecording` while any
    /// session for this room exists, whoever started it.
    pub async fn start(&self, producer: &Arc<dyn Producer>) -> RoomResult<()> {
        if producer.kind() != MediaKind::Audio {
            return Err(RoomError::InvalidArgument(
                "only audio producers can be captured".to_string(),
            ));
        }

        let generation = {
            let mut state = self.state.lock();
            if state.phase != CapturePhase::Idle {
                return Err(RoomError::AlreadyRecording(self.room_id.clone()));
            }
            if !self.services.registry.claim(&self.room_id) {
                return Err(RoomError::AlreadyRecording(self.room_id.clone()));
            }
            state.phase = CapturePhase::Allocating;
            state.generation += 1;
            state.last_error = None;
            state.generation
        };

        info!(
            "starting capture for room {} (producer {})",
            self.room_id,
            producer.id()
        );

        let opened = self.open_session(producer, generation).await;

        let mut state = self.state.lock();
        match opened {
            Ok(session) if state.phase == CapturePhase::Allocating => {
                info!(
                    "capture running for room {} on ports {}/{}",
                    self.room_id, session.ports.audio_port, session.ports.rtcp_port
                );
                state.phase = CapturePhase::Running;
                state.session = Some(session);
                Ok(())
            }
            Ok(session) => {
                // stop() arrived while we were allocating.
                session.shutdown(true);
                state.phase = CapturePhase::Idle;
                self.services.registry.release(&self.room_id);
                Err(RoomError::Capture("capture stopped while starting".to_string()))
            }
            Err(err) => {
                state.phase = CapturePhase::Idle;
                state.last_error = Some(err.to_string());
                self.services.registry.release(&self.room_id);
                Err(err)
            }
        }
    }

    /// Stops the running session. Calling it while idle only logs.
    pub fn stop(&self) {
        let session = {
            let mut state = self.state.lock();
            match state.phase {
                CapturePhase::Idle | CapturePhase::Stopping => {
                    debug!("capture for room {} is not running", self.room_id);
                    return;
                }
                CapturePhase::Allocating => {
                    state.phase = CapturePhase::Stopping;
                    return;
                }
                CapturePhase::Running => {
                    state.phase = CapturePhase::Stopping;
                    state.session.take()
                }
            }
        };

        if let Some(session) = session {
            session.shutdown(true);
        }

        self.services.registry.release(&self.room_id);
        self.state.lock().phase = CapturePhase::Idle;
        info!("capture stopped for room {}", self.room_id);
    }

    async fn open_session(
        &self,
        producer: &Arc<dyn Producer>,
        generation: u64,
    ) -> RoomResult<CaptureSession> {
        let config = &self.services.config;
        if config.start_delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(config.start_delay_ms)).await;
        }

        let tap = self
            .router
            .create_plain_transport(PlainTransportOptions {
                listen_ip: config.listen_ip.clone(),
                announced_ip: None,
                rtcp_mux: false,
                comedia: false,
                app_data: TransportAppData::default(),
            })
            .await?;

        match self.wire_session(&tap, producer, generation).await {
            Ok(session) => Ok(session),
            Err(err) => {
                tap.close();
                Err(err)
            }
        }
    }

    async fn wire_session(
        &self,
        tap: &Arc<dyn Transport>,
        producer: &Arc<dyn Producer>,
        generation: u64,
    ) -> RoomResult<CaptureSession> {
        let config = &self.services.config;
        let ports = self.services.ports.allocate_even_pair()?;

        tap.connect(TransportConnect::Plain {
            ip: config.listen_ip.clone(),
            port: ports.audio_port,
            rtcp_port: Some(ports.rtcp_port),
        })
        .await?;

        let tap_consumer = tap
            .consume(ConsumeOptions {
                producer_id: producer.id().to_string(),
                rtp_capabilities: self.router.rtp_capabilities(),
                paused: false,
                enable_rtx: false,
            })
            .await?;

        let codec = CodecInfo::from_rtp_parameters(MediaKind::Audio, &tap_consumer.rtp_parameters())?;
        let sdp = audio_sdp(&config.listen_ip, ports.audio_port, &codec);

        let work_dir = &self.services.work_dir;
        tokio::fs::create_dir_all(work_dir)
            .await
            .map_err(|err| RoomError::Capture(format!("cannot create {:?}: {}", work_dir, err)))?;
        let sdp_path = work_dir.join(format!("{}.sdp", self.room_id));
        tokio::fs::write(&sdp_path, sdp)
            .await
            .map_err(|err| RoomError::Capture(format!("cannot write {:?}: {}", sdp_path, err)))?;

        let process = self
            .services
            .transcoder
            .spawn(&TranscodeRequest {
                room_id: self.room_id.clone(),
                sdp_path,
                sample_rate: config.sample_rate,
                channels: config.channels,
            })
            .await
            .map_err(|err| RoomError::Capture(format!("{:#}", err)))?;

        let stream = match self
            .services
            .recognizer
            .open_stream(RecognitionConfig::linear16(
                config.sample_rate,
                config.channels,
                &config.language,
            ))
            .await
        {
            Ok(stream) => stream,
            Err(err) => {
                process.control.terminate();
                return Err(RoomError::Capture(format!("{:#}", err)));
            }
        };

        let pump = tokio::spawn(pump(PumpContext {
            room_id: self.room_id.clone(),
            transcript_path: work_dir.join(format!("{}.txt", self.room_id)),
            events: self.events.clone(),
            state: Arc::clone(&self.state),
            registry: self.services.registry.clone(),
            generation,
            output: process.output,
            stream,
        }));

        Ok(CaptureSession {
            producer_id: producer.id().to_string(),
            tap: Arc::clone(tap),
            _tap_consumer: tap_consumer,
            ports,
            control: Some(process.control),
            pump: Some(pump),
        })
    }
}

struct PumpContext {
    room_id: String,
    transcript_path: PathBuf,
    events: mpsc::UnboundedSender<CaptureEvent>,
    state: Arc<Mutex<MachineState>>,
    registry: RecordingRegistry,
    generation: u64,
    output: Box<dyn AsyncRead + Send + Unpin>,
    stream: RecognitionStream,
}

/// Moves transcoder output into the recognizer and recognizer output back to
/// the room until the transcoder exits.
async fn pump(ctx: PumpContext) {
    let PumpContext {
        room_id,
        transcript_path,
        events,
        state,
        registry,
        generation,
        output,
        stream,
    } = ctx;
    let RecognitionStream {
        audio,
        mut segments,
    } = stream;

    let forward = {
        let room_id = room_id.clone();
        async move {
            let mut chunks = ReaderStream::new(output);
            while let Some(chunk) = chunks.next().await {
                match chunk {
                    Ok(bytes) => {
                        if audio.send(bytes).await.is_err() {
                            warn!("recognizer stopped accepting audio for room {}", room_id);
                            break;
                        }
                    }
                    Err(err) => {
                        warn!("transcoder output error for room {}: {}", room_id, err);
                        break;
                    }
                }
            }
            // `audio` drops here, which ends the recognition request.
        }
    };

    let collect = async {
        while let Some(segment) = segments.recv().await {
            match segment {
                Ok(segment) if !segment.text.trim().is_empty() => {
                    info!("room {} transcript: {}", room_id, segment.text);
                    if let Err(err) = append_transcript(&transcript_path, &segment.text).await {
                        warn!("failed to append transcript: {}", err);
                    }
                    {
                        let mut state = state.lock();
                        if !state.transcript.is_empty() {
                            state.transcript.push(' ');
                        }
                        state.transcript.push_str(segment.text.trim());
                    }
                    let _ = events.send(CaptureEvent::Transcript {
                        room_id: room_id.clone(),
                        text: segment.text,
                    });
                }
                Ok(_) => debug!("room {} empty transcript segment", room_id),
                Err(err) => warn!("recognition error for room {}: {:#}", room_id, err),
            }
        }
    };

    tokio::join!(forward, collect);

    // The transcoder exited on its own. If this session is still the current
    // one, tear it down and go back to idle.
    let finished = {
        let mut state = state.lock();
        if state.generation != generation {
            None
        } else if state.phase == CapturePhase::Running {
            state.phase = CapturePhase::Idle;
            registry.release(&room_id);
            state.session.take()
        } else {
            // Exited before start() stored the session; start() cleans up.
            if state.phase == CapturePhase::Allocating {
                state.phase = CapturePhase::Stopping;
            }
            None
        }
    };

    if let Some(mut session) = finished {
        session.pump.take();
        session.shutdown(false);
        info!("transcoder for room {} exited", room_id);
        let _ = events.send(CaptureEvent::Stopped { room_id });
    }
}

async fn append_transcript(path: &Path, text: &str) -> std::io::Result<()> {
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    file.write_all(text.as_bytes()).await?;
    file.write_all(b"\n").await
}
