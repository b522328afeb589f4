//! CDS relay: the real-time channel to the clinical decision support service.
//!
//! Each room opens one link. Inbound frames carry CDS results and transcripts
//! computed elsewhere; outbound frames carry transcripts produced by the
//! room's capture session.

use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

/// One `{"event": .., "data": ..}` frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "event",
    content = "data",
    rename_all = "snake_case",
    rename_all_fields = "camelCase"
)]
pub enum RelayMessage {
    CdsDdx(Value),
    CdsQa(Value),
    CdsHpi(Value),
    SendTranscript(Value),
    Transcript { room_id: String, transcription: String },
}

impl RelayMessage {
    pub fn event(&self) -> &'static str {
        match self {
            Self::CdsDdx(_) => "cds_ddx",
            Self::CdsQa(_) => "cds_qa",
            Self::CdsHpi(_) => "cds_hpi",
            Self::SendTranscript(_) => "send_transcript",
            Self::Transcript { .. } => "transcript",
        }
    }
}

/// Both directions of a room's relay connection. Dropping `outbound` closes
/// the connection.
pub struct RelayLink {
    pub outbound: mpsc::UnboundedSender<RelayMessage>,
    pub inbound: mpsc::UnboundedReceiver<RelayMessage>,
}

impl RelayLink {
    /// A link whose far end is held by the caller, used by in-process relays.
    pub fn pair() -> (Self, RelayLink) {
        let (to_remote, from_room) = mpsc::unbounded_channel();
        let (to_room, from_remote) = mpsc::unbounded_channel();
        (
            Self {
                outbound: to_remote,
                inbound: from_remote,
            },
            RelayLink {
                outbound: to_room,
                inbound: from_room,
            },
        )
    }
}

pub trait CdsRelay: Send + Sync {
    /// Opens the relay for `room_id`. Connection failures are logged by the
    /// implementation; the returned link then never yields inbound messages.
    fn open(&self, room_id: &str) -> RelayLink;
}

pub struct WsRelay {
    url: String,
}

impl WsRelay {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

impl CdsRelay for WsRelay {
    fn open(&self, room_id: &str) -> RelayLink {
        let (room_end, remote_end) = RelayLink::pair();
        tokio::spawn(run_connection(
            self.url.clone(),
            room_id.to_string(),
            remote_end,
        ));
        room_end
    }
}

async fn run_connection(url: String, room_id: String, link: RelayLink) {
    let RelayLink {
        outbound: to_room,
        inbound: mut from_room,
    } = link;

    let (stream, _) = match connect_async(url.as_str()).await {
        Ok(connected) => connected,
        Err(err) => {
            warn!("CDS relay connection for room {} failed: {}", room_id, err);
            return;
        }
    };
    info!("CDS relay connected for room {}", room_id);

    let (mut write, mut read) = stream.split();

    loop {
        tokio::select! {
            outgoing = from_room.recv() => {
                let Some(message) = outgoing else {
                    // The room dropped its sender.
                    let _ = write.send(Message::Close(None)).await;
                    break;
                };
                let text = match serde_json::to_string(&message) {
                    Ok(text) => text,
                    Err(err) => {
                        warn!("failed to encode relay message: {}", err);
                        continue;
                    }
                };
                if let Err(err) = write.send(Message::Text(text)).await {
                    warn!("CDS relay send failed for room {}: {}", room_id, err);
                    break;
                }
            }
            incoming = read.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<RelayMessage>(&text) {
                            Ok(message) => {
                                debug!("relay {} for room {}", message.event(), room_id);
                                if to_room.send(message).is_err() {
                                    break;
                                }
                            }
                            Err(err) => debug!("ignoring relay frame: {}", err),
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        info!("CDS relay closed for room {}", room_id);
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        warn!("CDS relay error for room {}: {}", room_id, err);
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_inbound_frames() {
        let message: RelayMessage =
            serde_json::from_value(json!({"event": "cds_qa", "data": {"text": "Any fever?"}}))
                .unwrap();
        assert_eq!(message, RelayMessage::CdsQa(json!({"text": "Any fever?"})));

        let message: RelayMessage =
            serde_json::from_value(json!({"event": "send_transcript", "data": "hello"})).unwrap();
        assert_eq!(message.event(), "send_transcript");

        assert!(serde_json::from_value::<RelayMessage>(json!({"event": "other", "data": 1}))
            .is_err());
    }

    #[test]
    fn test_outbound_transcript_frame() {
        let frame = serde_json::to_value(RelayMessage::Transcript {
            room_id: "r1".into(),
            transcription: "it started yesterday".into(),
        })
        .unwrap();
        assert_eq!(
            frame,
            json!({
                "event": "transcript",
                "data": {"roomId": "r1", "transcription": "it started yesterday"}
            })
        );
    }

    #[tokio::test]
    async fn test_link_pair_crosses_over() {
        let (room, mut remote) = RelayLink::pair();
        room.outbound
            .send(RelayMessage::CdsHpi(json!("hpi")))
            .unwrap();
        assert_eq!(
            remote.inbound.recv().await,
            Some(RelayMessage::CdsHpi(json!("hpi")))
        );

        remote.outbound.send(RelayMessage::CdsDdx(json!([]))).unwrap();
        let mut room = room;
        assert_eq!(
            room.inbound.recv().await,
            Some(RelayMessage::CdsDdx(json!([])))
        );
    }
}
