//! Error taxonomy shared by the room, capture pipeline and HTTP API.

use crate::engine::EngineError;
use crate::signaling::SignalingError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RoomError {
    #[error("{0}")]
    InvalidState(String),

    #[error("{kind} with id \"{id}\" not found")]
    NotFound { kind: &'static str, id: String },

    #[error("{0}")]
    AlreadyExists(String),

    #[error("recording is already in progress for room \"{0}\"")]
    AlreadyRecording(String),

    #[error("{0}")]
    InvalidArgument(String),

    #[error("operation not allowed")]
    Forbidden,

    #[error("no {0} data available")]
    NoDataAvailable(&'static str),

    #[error("no free even port pair in [{min}, {max}] after {attempts} attempts")]
    PortExhausted { min: u16, max: u16, attempts: u32 },

    #[error("unknown request method \"{0}\"")]
    UnknownMethod(String),

    #[error("network throttle failed: {0}")]
    Throttle(String),

    #[error("capture pipeline failed: {0}")]
    Capture(String),

    #[error("room is closed")]
    RoomClosed,

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Signaling(#[from] SignalingError),
}

impl RoomError {
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }

    pub fn not_joined() -> Self {
        Self::InvalidState("Peer not yet joined".to_string())
    }

    /// Numeric code carried as the protoo `errorCode` and as the HTTP status
    /// of broadcaster API responses.
    pub fn code(&self) -> u16 {
        match self {
            Self::InvalidState(_) | Self::InvalidArgument(_) => 400,
            Self::Forbidden => 403,
            Self::NotFound { .. } | Self::NoDataAvailable(_) | Self::RoomClosed => 404,
            Self::UnknownMethod(_) => 405,
            Self::AlreadyExists(_) | Self::AlreadyRecording(_) => 409,
            Self::Signaling(_) => 503,
            Self::PortExhausted { .. }
            | Self::Throttle(_)
            | Self::Capture(_)
            | Self::Engine(_) => 500,
        }
    }
}

pub type RoomResult<T> = Result<T, RoomError>;
