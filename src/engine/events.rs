//! Typed events published by media engine objects.

use super::{ConsumerLayers, DataMessage, Producer};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceState {
    New,
    Connected,
    Completed,
    Disconnected,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DtlsState {
    New,
    Connecting,
    Connected,
    Failed,
    Closed,
}

#[derive(Debug, Clone)]
pub struct TransportTrace {
    /// `bwe`, `probation`, ...
    pub trace_type: String,
    /// `in` or `out`.
    pub direction: String,
    pub info: Value,
}

#[derive(Debug, Clone)]
pub enum TransportEvent {
    IceStateChange(IceState),
    DtlsStateChange(DtlsState),
    SctpStateChange(String),
    Trace(TransportTrace),
    Closed,
}

impl TransportEvent {
    /// ICE or DTLS states after which the owning peer cannot recover.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            TransportEvent::IceStateChange(IceState::Disconnected | IceState::Closed)
                | TransportEvent::DtlsStateChange(DtlsState::Failed | DtlsState::Closed)
        )
    }
}

#[derive(Debug, Clone)]
pub enum ProducerEvent {
    Score(Value),
    VideoOrientationChange(Value),
    Trace(Value),
    TransportClose,
}

#[derive(Debug, Clone)]
pub enum ConsumerEvent {
    TransportClose,
    ProducerClose,
    ProducerPause,
    ProducerResume,
    Score(Value),
    LayersChange(Option<ConsumerLayers>),
    Trace(Value),
}

#[derive(Debug, Clone)]
pub enum DataProducerEvent {
    TransportClose,
}

#[derive(Debug, Clone)]
pub enum DataConsumerEvent {
    TransportClose,
    DataProducerClose,
    Message(DataMessage),
}

#[derive(Clone)]
pub struct AudioVolume {
    pub producer: Arc<dyn Producer>,
    pub volume: i8,
}

impl fmt::Debug for AudioVolume {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AudioVolume")
            .field("producer", &self.producer.id())
            .field("volume", &self.volume)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub enum AudioLevelEvent {
    /// Loudest producers first.
    Volumes(Vec<AudioVolume>),
    Silence,
}

#[derive(Debug, Clone)]
pub enum ActiveSpeakerEvent {
    DominantSpeaker { producer_id: String },
}
