//! Signaling collaborator.
//!
//! A connected peer is reached through a [`PeerChannel`]: fire-and-forget
//! notifications plus awaited requests. Incoming requests are parsed into the
//! closed [`PeerRequest`] enum and answered through a [`Responder`].

pub mod ws;

use crate::engine::MediaKind;
use crate::error::{RoomError, RoomResult};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::debug;

#[derive(Debug, Clone, Error)]
pub enum SignalingError {
    #[error("peer channel closed")]
    Closed,

    #[error("request timed out after {0}s")]
    Timeout(u64),

    #[error("remote rejected request ({code}): {reason}")]
    Rejected { code: u16, reason: String },

    #[error("signaling transport error: {0}")]
    Transport(String),
}

/// Server → peer notifications.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(
    tag = "method",
    content = "data",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum Notification {
    #[serde(rename = "mediasoup-version")]
    MediasoupVersion { version: String },
    NewPeer {
        id: String,
        display_name: Option<String>,
        device: Value,
    },
    PeerClosed { peer_id: String },
    PeerDisplayNameChanged {
        peer_id: String,
        display_name: String,
        old_display_name: Option<String>,
    },
    DownlinkBwe {
        desired_bitrate: Value,
        effective_desired_bitrate: Value,
        available_bitrate: Value,
    },
    ProducerScore { producer_id: String, score: Value },
    ConsumerClosed { consumer_id: String },
    ConsumerPaused { consumer_id: String },
    ConsumerResumed { consumer_id: String },
    ConsumerScore { consumer_id: String, score: Value },
    ConsumerLayersChanged {
        consumer_id: String,
        spatial_layer: Option<u8>,
        temporal_layer: Option<u8>,
    },
    DataConsumerClosed { data_consumer_id: String },
    ActiveSpeaker {
        peer_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        volume: Option<i8>,
    },
}

/// Server → peer requests that expect an acknowledgement.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(
    tag = "method",
    content = "data",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum PeerCall {
    NewConsumer {
        peer_id: String,
        producer_id: String,
        id: String,
        kind: MediaKind,
        rtp_parameters: Value,
        #[serde(rename = "type")]
        consumer_type: String,
        app_data: Value,
        producer_paused: bool,
    },
    NewDataConsumer {
        /// `None` for the room's bot data producer.
        peer_id: Option<String>,
        data_producer_id: String,
        id: String,
        sctp_stream_parameters: Option<Value>,
        label: String,
        protocol: String,
        app_data: Value,
    },
}

/// Splits a tagged message into its `method` and `data` parts.
fn into_parts<T: Serialize>(message: &T) -> (String, Value) {
    let mut value = serde_json::to_value(message).unwrap_or(Value::Null);
    let method = value
        .get("method")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let data = value
        .get_mut("data")
        .map(Value::take)
        .unwrap_or_else(|| json!({}));
    (method, data)
}

impl Notification {
    pub fn into_parts(&self) -> (String, Value) {
        into_parts(self)
    }
}

impl PeerCall {
    pub fn into_parts(&self) -> (String, Value) {
        into_parts(self)
    }
}

#[async_trait]
pub trait PeerChannel: Send + Sync {
    async fn notify(&self, notification: Notification) -> Result<(), SignalingError>;

    async fn request(&self, call: PeerCall) -> Result<Value, SignalingError>;

    /// Drops the underlying connection. Must be idempotent.
    fn close(&self);

    fn closed(&self) -> bool;
}

/// Sends a notification and discards any failure after logging it.
pub async fn notify_best_effort(channel: &dyn PeerChannel, notification: Notification) {
    let method = notification.into_parts().0;
    if let Err(err) = channel.notify(notification).await {
        debug!("notification {} not delivered: {}", method, err);
    }
}

pub type Reply = RoomResult<Value>;

/// One-shot answer to an incoming request.
pub struct Responder {
    respond: Box<dyn FnOnce(Reply) + Send>,
}

impl Responder {
    pub fn new(respond: impl FnOnce(Reply) + Send + 'static) -> Self {
        Self {
            respond: Box::new(respond),
        }
    }

    /// Responder backed by a oneshot channel.
    pub fn channel() -> (Self, oneshot::Receiver<Reply>) {
        let (tx, rx) = oneshot::channel();
        let responder = Self::new(move |reply| {
            let _ = tx.send(reply);
        });
        (responder, rx)
    }

    pub fn accept(self, data: Value) {
        (self.respond)(Ok(data));
    }

    pub fn reject(self, error: RoomError) {
        (self.respond)(Err(error));
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinRequest {
    pub display_name: String,
    #[serde(default)]
    pub device: Value,
    pub rtp_capabilities: Option<Value>,
    pub sctp_capabilities: Option<Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CreateWebRtcTransportRequest {
    pub force_tcp: bool,
    pub producing: bool,
    pub consuming: bool,
    pub sctp_capabilities: Option<Value>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectWebRtcTransportRequest {
    pub transport_id: String,
    pub dtls_parameters: Value,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportRef {
    pub transport_id: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProduceRequest {
    pub transport_id: String,
    pub kind: MediaKind,
    pub rtp_parameters: Value,
    #[serde(default)]
    pub app_data: Value,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProducerRef {
    pub producer_id: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerRef {
    pub consumer_id: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetConsumerPreferredLayersRequest {
    pub consumer_id: String,
    pub spatial_layer: u8,
    pub temporal_layer: Option<u8>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetConsumerPriorityRequest {
    pub consumer_id: String,
    pub priority: u8,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProduceDataRequest {
    pub transport_id: String,
    pub sctp_stream_parameters: Option<Value>,
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub protocol: String,
    #[serde(default)]
    pub app_data: Value,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeDisplayNameRequest {
    pub display_name: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataProducerRef {
    pub data_producer_id: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataConsumerRef {
    pub data_consumer_id: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ApplyNetworkThrottleRequest {
    pub secret: Option<String>,
    pub uplink: Option<u64>,
    pub downlink: Option<u64>,
    pub rtt: Option<u64>,
    pub packet_loss: Option<f64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ResetNetworkThrottleRequest {
    pub secret: Option<String>,
}

/// Every request a signaling peer may send.
#[derive(Debug, Clone)]
pub enum PeerRequest {
    GetRouterRtpCapabilities,
    Join(JoinRequest),
    CreateWebRtcTransport(CreateWebRtcTransportRequest),
    ConnectWebRtcTransport(ConnectWebRtcTransportRequest),
    RestartIce(TransportRef),
    Produce(ProduceRequest),
    CloseProducer(ProducerRef),
    PauseProducer(ProducerRef),
    ResumeProducer(ProducerRef),
    PauseConsumer(ConsumerRef),
    ResumeConsumer(ConsumerRef),
    SetConsumerPreferredLayers(SetConsumerPreferredLayersRequest),
    SetConsumerPriority(SetConsumerPriorityRequest),
    RequestConsumerKeyFrame(ConsumerRef),
    ProduceData(ProduceDataRequest),
    ChangeDisplayName(ChangeDisplayNameRequest),
    GetTransportStats(TransportRef),
    GetProducerStats(ProducerRef),
    GetConsumerStats(ConsumerRef),
    GetDataProducerStats(DataProducerRef),
    GetDataConsumerStats(DataConsumerRef),
    GetCdsQa,
    GetCdsDdx,
    GetCdsHpi,
    GetTranscript,
    ApplyNetworkThrottle(ApplyNetworkThrottleRequest),
    ResetNetworkThrottle(ResetNetworkThrottleRequest),
}

fn payload<T: DeserializeOwned>(method: &str, data: Value) -> RoomResult<T> {
    serde_json::from_value(data)
        .map_err(|err| RoomError::InvalidArgument(format!("invalid {method} request: {err}")))
}

impl PeerRequest {
    /// Builds a typed request from a protoo `method` and its `data`. Missing or
    /// null data is treated as an empty object.
    pub fn parse(method: &str, data: Value) -> RoomResult<Self> {
        let data = if data.is_null() { json!({}) } else { data };

        let request = match method {
            "getRouterRtpCapabilities" => Self::GetRouterRtpCapabilities,
            "join" => Self::Join(payload(method, data)?),
            "createWebRtcTransport" => Self::CreateWebRtcTransport(payload(method, data)?),
            "connectWebRtcTransport" => Self::ConnectWebRtcTransport(payload(method, data)?),
            "restartIce" => Self::RestartIce(payload(method, data)?),
            "produce" => Self::Produce(payload(method, data)?),
            "closeProducer" => Self::CloseProducer(payload(method, data)?),
            "pauseProducer" => Self::PauseProducer(payload(method, data)?),
            "resumeProducer" => Self::ResumeProducer(payload(method, data)?),
            "pauseConsumer" => Self::PauseConsumer(payload(method, data)?),
            "resumeConsumer" => Self::ResumeConsumer(payload(method, data)?),
            "setConsumerPreferredLayers" => {
                Self::SetConsumerPreferredLayers(payload(method, data)?)
            }
            "setConsumerPriority" => Self::SetConsumerPriority(payload(method, data)?),
            "requestConsumerKeyFrame" => Self::RequestConsumerKeyFrame(payload(method, data)?),
            "produceData" => Self::ProduceData(payload(method, data)?),
            "changeDisplayName" => Self::ChangeDisplayName(payload(method, data)?),
            "getTransportStats" => Self::GetTransportStats(payload(method, data)?),
            "getProducerStats" => Self::GetProducerStats(payload(method, data)?),
            "getConsumerStats" => Self::GetConsumerStats(payload(method, data)?),
            "getDataProducerStats" => Self::GetDataProducerStats(payload(method, data)?),
            "getDataConsumerStats" => Self::GetDataConsumerStats(payload(method, data)?),
            "getCdsQa" => Self::GetCdsQa,
            "getCdsDdx" => Self::GetCdsDdx,
            "getCdsHpi" => Self::GetCdsHpi,
            "getTranscript" => Self::GetTranscript,
            "applyNetworkThrottle" => Self::ApplyNetworkThrottle(payload(method, data)?),
            "resetNetworkThrottle" => Self::ResetNetworkThrottle(payload(method, data)?),
            other => return Err(RoomError::UnknownMethod(other.to_string())),
        };

        Ok(request)
    }

    pub fn method(&self) -> &'static str {
        match self {
            Self::GetRouterRtpCapabilities => "getRouterRtpCapabilities",
            Self::Join(_) => "join",
            Self::CreateWebRtcTransport(_) => "createWebRtcTransport",
            Self::ConnectWebRtcTransport(_) => "connectWebRtcTransport",
            Self::RestartIce(_) => "restartIce",
            Self::Produce(_) => "produce",
            Self::CloseProducer(_) => "closeProducer",
            Self::PauseProducer(_) => "pauseProducer",
            Self::ResumeProducer(_) => "resumeProducer",
            Self::PauseConsumer(_) => "pauseConsumer",
            Self::ResumeConsumer(_) => "resumeConsumer",
            Self::SetConsumerPreferredLayers(_) => "setConsumerPreferredLayers",
            Self::SetConsumerPriority(_) => "setConsumerPriority",
            Self::RequestConsumerKeyFrame(_) => "requestConsumerKeyFrame",
            Self::ProduceData(_) => "produceData",
            Self::ChangeDisplayName(_) => "changeDisplayName",
            Self::GetTransportStats(_) => "getTransportStats",
            Self::GetProducerStats(_) => "getProducerStats",
            Self::GetConsumerStats(_) => "getConsumerStats",
            Self::GetDataProducerStats(_) => "getDataProducerStats",
            Self::GetDataConsumerStats(_) => "getDataConsumerStats",
            Self::GetCdsQa => "getCdsQa",
            Self::GetCdsDdx => "getCdsDdx",
            Self::GetCdsHpi => "getCdsHpi",
            Self::GetTranscript => "getTranscript",
            Self::ApplyNetworkThrottle(_) => "applyNetworkThrottle",
            Self::ResetNetworkThrottle(_) => "resetNetworkThrottle",
        }
    }

    /// Whether the request is only valid after `join`.
    pub fn requires_join(&self) -> bool {
        matches!(
            self,
            Self::Produce(_)
                | Self::CloseProducer(_)
                | Self::PauseProducer(_)
                | Self::ResumeProducer(_)
                | Self::PauseConsumer(_)
                | Self::ResumeConsumer(_)
                | Self::SetConsumerPreferredLayers(_)
                | Self::SetConsumerPriority(_)
                | Self::RequestConsumerKeyFrame(_)
                | Self::ProduceData(_)
                | Self::ChangeDisplayName(_)
        )
    }
}
