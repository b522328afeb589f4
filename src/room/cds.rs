//! Latest-value cache for data pushed by the CDS relay.

use crate::error::{RoomError, RoomResult};
use crate::relay::RelayMessage;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CdsKind {
    Qa,
    Ddx,
    Hpi,
    Transcript,
}

impl CdsKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Qa => "cds_qa",
            Self::Ddx => "cds_ddx",
            Self::Hpi => "cds_hpi",
            Self::Transcript => "transcript",
        }
    }
}

#[derive(Default)]
pub struct CdsCache {
    entries: Mutex<HashMap<CdsKind, Value>>,
}

impl CdsCache {
    pub fn get(&self, kind: CdsKind) -> RoomResult<Value> {
        self.entries
            .lock()
            .get(&kind)
            .cloned()
            .ok_or(RoomError::NoDataAvailable(kind.as_str()))
    }

    /// Last write wins. A null payload clears the entry.
    pub fn store(&self, kind: CdsKind, value: Value) {
        let mut entries = self.entries.lock();
        if value.is_null() {
            entries.remove(&kind);
        } else {
            entries.insert(kind, value);
        }
    }

    /// Stores an inbound relay message. Returns the kind it updated, or `None`
    /// for messages that carry nothing to cache.
    pub fn apply(&self, message: RelayMessage) -> Option<CdsKind> {
        let (kind, value) = match message {
            RelayMessage::CdsQa(value) => (CdsKind::Qa, value),
            RelayMessage::CdsDdx(value) => (CdsKind::Ddx, value),
            RelayMessage::CdsHpi(value) => (CdsKind::Hpi, value),
            RelayMessage::SendTranscript(value) => (CdsKind::Transcript, value),
            RelayMessage::Transcript { .. } => return None,
        };
        self.store(kind, value);
        Some(kind)
    }
}
