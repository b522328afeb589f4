//! Media engine collaborator.
//!
//! The SFU core (ICE/DTLS, RTP forwarding, codec handling) lives outside this
//! crate. Everything the session layer needs from it is expressed by the traits
//! below. Engine objects publish their events over `tokio::sync::broadcast`
//! channels so the room can consume them from ordinary tasks.

pub mod events;
pub mod loopback;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;

pub use events::{
    ActiveSpeakerEvent, AudioLevelEvent, AudioVolume, ConsumerEvent, DataConsumerEvent,
    DataProducerEvent, DtlsState, IceState, ProducerEvent, TransportEvent, TransportTrace,
};
pub use loopback::LoopbackEngine;

/// Opaque failure reported by the media engine.
#[derive(Debug, Clone, Error)]
#[error("media engine: {0}")]
pub struct EngineError(pub String);

impl EngineError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

pub type EngineResult<T> = Result<T, EngineError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

impl MediaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Audio => "audio",
            MediaKind::Video => "video",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    WebRtc,
    Plain,
    Direct,
}

/// Application tags attached to a transport at creation time. The consumer
/// graph picks the receiving transport by `consuming`, never by id.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportAppData {
    pub producing: bool,
    pub consuming: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportTuple {
    pub local_ip: String,
    pub local_port: u16,
    pub remote_ip: Option<String>,
    pub remote_port: Option<u16>,
    pub protocol: String,
}

#[derive(Debug, Clone)]
pub struct RouterOptions {
    pub media_codecs: Vec<Value>,
}

#[derive(Debug, Clone)]
pub struct WebRtcTransportOptions {
    pub listen_ip: String,
    pub announced_ip: Option<String>,
    pub enable_udp: bool,
    pub enable_tcp: bool,
    pub prefer_udp: bool,
    pub initial_available_outgoing_bitrate: u32,
    pub ice_consent_timeout: u8,
    pub enable_sctp: bool,
    pub num_sctp_streams: Option<Value>,
    pub app_data: TransportAppData,
}

#[derive(Debug, Clone)]
pub struct PlainTransportOptions {
    pub listen_ip: String,
    pub announced_ip: Option<String>,
    pub rtcp_mux: bool,
    pub comedia: bool,
    pub app_data: TransportAppData,
}

#[derive(Debug, Clone)]
pub enum TransportConnect {
    WebRtc { dtls_parameters: Value },
    Plain { ip: String, port: u16, rtcp_port: Option<u16> },
}

#[derive(Debug, Clone)]
pub struct ProduceOptions {
    pub kind: MediaKind,
    pub rtp_parameters: Value,
    pub app_data: Value,
}

#[derive(Debug, Clone)]
pub struct ConsumeOptions {
    pub producer_id: String,
    pub rtp_capabilities: Value,
    pub paused: bool,
    pub enable_rtx: bool,
}

#[derive(Debug, Clone, Default)]
pub struct DataProduceOptions {
    pub sctp_stream_parameters: Option<Value>,
    pub label: String,
    pub protocol: String,
    pub app_data: Value,
}

#[derive(Debug, Clone)]
pub struct DataConsumeOptions {
    pub data_producer_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerLayers {
    pub spatial_layer: u8,
    pub temporal_layer: Option<u8>,
}

#[derive(Debug, Clone, Copy)]
pub struct AudioLevelObserverOptions {
    pub max_entries: u16,
    pub threshold: i8,
    pub interval_ms: u16,
}

#[async_trait]
pub trait MediaEngine: Send + Sync {
    fn version(&self) -> String;

    async fn create_router(&self, options: RouterOptions) -> EngineResult<Arc<dyn Router>>;
}

#[async_trait]
pub trait Router: Send + Sync {
    fn id(&self) -> &str;

    fn rtp_capabilities(&self) -> Value;

    /// Whether an endpoint advertising `rtp_capabilities` can receive the
    /// given producer.
    fn can_consume(&self, producer_id: &str, rtp_capabilities: &Value) -> bool;

    async fn create_webrtc_transport(
        &self,
        options: WebRtcTransportOptions,
    ) -> EngineResult<Arc<dyn Transport>>;

    async fn create_plain_transport(
        &self,
        options: PlainTransportOptions,
    ) -> EngineResult<Arc<dyn Transport>>;

    async fn create_direct_transport(&self) -> EngineResult<Arc<dyn Transport>>;

    async fn create_audio_level_observer(
        &self,
        options: AudioLevelObserverOptions,
    ) -> EngineResult<Arc<dyn AudioLevelObserver>>;

    async fn create_active_speaker_observer(&self) -> EngineResult<Arc<dyn ActiveSpeakerObserver>>;

    fn close(&self);

    fn closed(&self) -> bool;
}

#[async_trait]
pub trait Transport: Send + Sync {
    fn id(&self) -> &str;

    fn kind(&self) -> TransportKind;

    fn app_data(&self) -> TransportAppData;

    /// Parameters returned to whoever asked for the transport: ICE/DTLS/SCTP
    /// parameters for WebRTC transports, local tuple for plain ones.
    fn parameters(&self) -> Value;

    fn tuple(&self) -> Option<TransportTuple>;

    fn rtcp_tuple(&self) -> Option<TransportTuple>;

    async fn connect(&self, params: TransportConnect) -> EngineResult<()>;

    async fn restart_ice(&self) -> EngineResult<Value>;

    async fn set_max_incoming_bitrate(&self, bitrate: u32) -> EngineResult<()>;

    async fn enable_trace_event(&self, types: Vec<String>) -> EngineResult<()>;

    async fn get_stats(&self) -> EngineResult<Value>;

    async fn produce(&self, options: ProduceOptions) -> EngineResult<Arc<dyn Producer>>;

    async fn consume(&self, options: ConsumeOptions) -> EngineResult<Arc<dyn Consumer>>;

    async fn produce_data(
        &self,
        options: DataProduceOptions,
    ) -> EngineResult<Arc<dyn DataProducer>>;

    async fn consume_data(
        &self,
        options: DataConsumeOptions,
    ) -> EngineResult<Arc<dyn DataConsumer>>;

    /// Closes the transport and, transitively, every producer and consumer
    /// created on it.
    fn close(&self);

    fn closed(&self) -> bool;

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent>;
}

#[async_trait]
pub trait Producer: Send + Sync {
    fn id(&self) -> &str;

    fn kind(&self) -> MediaKind;

    fn rtp_parameters(&self) -> Value;

    fn app_data(&self) -> Value;

    fn paused(&self) -> bool;

    async fn pause(&self) -> EngineResult<()>;

    async fn resume(&self) -> EngineResult<()>;

    async fn enable_trace_event(&self, types: Vec<String>) -> EngineResult<()>;

    async fn get_stats(&self) -> EngineResult<Value>;

    fn close(&self);

    fn closed(&self) -> bool;

    fn subscribe(&self) -> broadcast::Receiver<ProducerEvent>;
}

#[async_trait]
pub trait Consumer: Send + Sync {
    fn id(&self) -> &str;

    fn producer_id(&self) -> &str;

    fn kind(&self) -> MediaKind;

    fn rtp_parameters(&self) -> Value;

    /// `simple`, `simulcast`, `svc` or `pipe`.
    fn consumer_type(&self) -> String;

    fn paused(&self) -> bool;

    fn producer_paused(&self) -> bool;

    fn score(&self) -> Value;

    async fn pause(&self) -> EngineResult<()>;

    async fn resume(&self) -> EngineResult<()>;

    async fn set_preferred_layers(&self, layers: ConsumerLayers) -> EngineResult<()>;

    async fn set_priority(&self, priority: u8) -> EngineResult<()>;

    async fn request_key_frame(&self) -> EngineResult<()>;

    async fn get_stats(&self) -> EngineResult<Value>;

    fn close(&self);

    fn closed(&self) -> bool;

    fn subscribe(&self) -> broadcast::Receiver<ConsumerEvent>;
}

#[async_trait]
pub trait DataProducer: Send + Sync {
    fn id(&self) -> &str;

    fn label(&self) -> &str;

    fn protocol(&self) -> &str;

    fn app_data(&self) -> Value;

    fn sctp_stream_parameters(&self) -> Option<Value>;

    /// Sends a text message (SCTP PPID 51) to every data consumer.
    async fn send_text(&self, text: &str) -> EngineResult<()>;

    async fn get_stats(&self) -> EngineResult<Value>;

    fn close(&self);

    fn closed(&self) -> bool;

    fn subscribe(&self) -> broadcast::Receiver<DataProducerEvent>;
}

#[async_trait]
pub trait DataConsumer: Send + Sync {
    fn id(&self) -> &str;

    fn data_producer_id(&self) -> &str;

    fn label(&self) -> &str;

    fn protocol(&self) -> &str;

    fn sctp_stream_parameters(&self) -> Option<Value>;

    async fn get_stats(&self) -> EngineResult<Value>;

    fn close(&self);

    fn closed(&self) -> bool;

    fn subscribe(&self) -> broadcast::Receiver<DataConsumerEvent>;
}

#[async_trait]
pub trait AudioLevelObserver: Send + Sync {
    async fn add_producer(&self, producer_id: &str) -> EngineResult<()>;

    async fn remove_producer(&self, producer_id: &str) -> EngineResult<()>;

    fn subscribe(&self) -> broadcast::Receiver<AudioLevelEvent>;
}

#[async_trait]
pub trait ActiveSpeakerObserver: Send + Sync {
    async fn add_producer(&self, producer_id: &str) -> EngineResult<()>;

    async fn remove_producer(&self, producer_id: &str) -> EngineResult<()>;

    fn subscribe(&self) -> broadcast::Receiver<ActiveSpeakerEvent>;
}

/// Binary payload plus SCTP PPID, as delivered to data consumers.
#[derive(Debug, Clone)]
pub struct DataMessage {
    pub payload: Bytes,
    pub ppid: u32,
}

impl DataMessage {
    pub const PPID_STRING: u32 = 51;

    pub fn text(&self) -> Option<String> {
        if self.ppid != Self::PPID_STRING {
            return None;
        }
        Some(String::from_utf8_lossy(&self.payload).into_owned())
    }
}

/// Codec summary taken from the first codec/encoding of a consumer's RTP
/// parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodecInfo {
    pub payload_type: u8,
    pub codec_name: String,
    pub clock_rate: u32,
    pub channels: Option<u8>,
    pub ssrc: Option<u32>,
}

impl CodecInfo {
    pub fn from_rtp_parameters(kind: MediaKind, rtp_parameters: &Value) -> EngineResult<Self> {
        let codec = rtp_parameters
            .get("codecs")
            .and_then(|codecs| codecs.get(0))
            .ok_or_else(|| EngineError::new("rtpParameters has no codecs"))?;

        let payload_type = codec
            .get("payloadType")
            .and_then(Value::as_u64)
            .ok_or_else(|| EngineError::new("codec has no payloadType"))?;
        let mime_type = codec
            .get("mimeType")
            .and_then(Value::as_str)
            .ok_or_else(|| EngineError::new("codec has no mimeType"))?;
        let clock_rate = codec
            .get("clockRate")
            .and_then(Value::as_u64)
            .ok_or_else(|| EngineError::new("codec has no clockRate"))?;

        let prefix = format!("{}/", kind.as_str());
        let codec_name = mime_type
            .strip_prefix(&prefix)
            .unwrap_or(mime_type)
            .to_string();

        let channels = match kind {
            MediaKind::Audio => codec
                .get("channels")
                .and_then(Value::as_u64)
                .map(|c| c as u8),
            MediaKind::Video => None,
        };

        let ssrc = rtp_parameters
            .get("encodings")
            .and_then(|encodings| encodings.get(0))
            .and_then(|encoding| encoding.get("ssrc"))
            .and_then(Value::as_u64)
            .map(|s| s as u32);

        Ok(Self {
            payload_type: payload_type as u8,
            codec_name,
            clock_rate: clock_rate as u32,
            channels,
            ssrc,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_codec_info_from_opus_parameters() {
        let params = json!({
            "codecs": [{
                "mimeType": "audio/opus",
                "payloadType": 100,
                "clockRate": 48000,
                "channels": 2
            }],
            "encodings": [{ "ssrc": 1234 }]
        });

        let info = CodecInfo::from_rtp_parameters(MediaKind::Audio, &params).unwrap();
        assert_eq!(info.payload_type, 100);
        assert_eq!(info.codec_name, "opus");
        assert_eq!(info.clock_rate, 48000);
        assert_eq!(info.channels, Some(2));
        assert_eq!(info.ssrc, Some(1234));
    }

    #[test]
    fn test_codec_info_requires_codecs() {
        let err = CodecInfo::from_rtp_parameters(MediaKind::Audio, &json!({})).unwrap_err();
        assert!(err.to_string().contains("no codecs"));
    }

    #[test]
    fn test_data_message_text_only_for_string_ppid() {
        let text = DataMessage {
            payload: Bytes::from_static(b"hello"),
            ppid: DataMessage::PPID_STRING,
        };
        let binary = DataMessage {
            payload: Bytes::from_static(b"hello"),
            ppid: 53,
        };
        assert_eq!(text.text().as_deref(), Some("hello"));
        assert!(binary.text().is_none());
    }
}
