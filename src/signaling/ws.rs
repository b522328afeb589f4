//! protoo-style JSON framing over an axum WebSocket.
//!
//! Three frame shapes travel in both directions:
//! `{request, id, method, data}`, `{response, id, ok, data | errorCode, errorReason}`
//! and `{notification, method, data}`.

use super::{Notification, PeerCall, PeerChannel, PeerRequest, Reply, Responder, SignalingError};
use crate::room::Room;
use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Frame {
    Request {
        request: bool,
        id: u32,
        method: String,
        #[serde(default)]
        data: Value,
    },
    Response {
        response: bool,
        id: u32,
        ok: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<Value>,
        #[serde(rename = "errorCode", default, skip_serializing_if = "Option::is_none")]
        error_code: Option<u16>,
        #[serde(rename = "errorReason", default, skip_serializing_if = "Option::is_none")]
        error_reason: Option<String>,
    },
    Notification {
        notification: bool,
        method: String,
        #[serde(default)]
        data: Value,
    },
}

impl Frame {
    pub fn request(id: u32, method: String, data: Value) -> Self {
        Self::Request {
            request: true,
            id,
            method,
            data,
        }
    }

    pub fn success(id: u32, data: Value) -> Self {
        Self::Response {
            response: true,
            id,
            ok: true,
            data: Some(data),
            error_code: None,
            error_reason: None,
        }
    }

    pub fn error(id: u32, code: u16, reason: String) -> Self {
        Self::Response {
            response: true,
            id,
            ok: false,
            data: None,
            error_code: Some(code),
            error_reason: Some(reason),
        }
    }

    pub fn notification(method: String, data: Value) -> Self {
        Self::Notification {
            notification: true,
            method,
            data,
        }
    }
}

type Pending = oneshot::Sender<Result<Value, SignalingError>>;

/// Server side of one protoo connection.
pub struct WsPeerChannel {
    outbound: mpsc::UnboundedSender<Frame>,
    pending: Mutex<HashMap<u32, Pending>>,
    next_id: AtomicU32,
    shutdown: CancellationToken,
}

impl WsPeerChannel {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<Frame>) {
        let (outbound, frames) = mpsc::unbounded_channel();
        let channel = Arc::new(Self {
            outbound,
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicU32::new(1),
            shutdown: CancellationToken::new(),
        });
        (channel, frames)
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    fn send(&self, frame: Frame) -> Result<(), SignalingError> {
        if self.closed() {
            return Err(SignalingError::Closed);
        }
        self.outbound.send(frame).map_err(|_| SignalingError::Closed)
    }

    /// Queues the answer to a request the remote peer sent us.
    pub fn respond(&self, id: u32, reply: Reply) {
        let frame = match reply {
            Ok(data) => Frame::success(id, data),
            Err(err) => Frame::error(id, err.code(), err.to_string()),
        };
        if let Err(err) = self.send(frame) {
            debug!("response {} dropped: {}", id, err);
        }
    }

    /// Completes one of our own outstanding requests.
    pub fn resolve(&self, id: u32, result: Result<Value, SignalingError>) {
        match self.pending.lock().remove(&id) {
            Some(tx) => {
                let _ = tx.send(result);
            }
            None => warn!("response for unknown request id {}", id),
        }
    }
}

#[async_trait]
impl PeerChannel for WsPeerChannel {
    async fn notify(&self, notification: Notification) -> Result<(), SignalingError> {
        let (method, data) = notification.into_parts();
        self.send(Frame::notification(method, data))
    }

    async fn request(&self, call: PeerCall) -> Result<Value, SignalingError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (method, data) = call.into_parts();
        let (tx, rx) = oneshot::channel();

        self.pending.lock().insert(id, tx);
        if let Err(err) = self.send(Frame::request(id, method, data)) {
            self.pending.lock().remove(&id);
            return Err(err);
        }

        rx.await.unwrap_or(Err(SignalingError::Closed))
    }

    fn close(&self) {
        self.shutdown.cancel();
        // Dropping the senders fails every in-flight request with `Closed`.
        self.pending.lock().clear();
    }

    fn closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

/// Drives one upgraded socket for `peer_id` until either side closes it.
pub async fn serve_peer(socket: WebSocket, room: Arc<Room>, peer_id: String) {
    let (channel, mut frames) = WsPeerChannel::new();
    let shutdown = channel.shutdown_token();

    let peer = match room
        .create_peer(&peer_id, Arc::clone(&channel) as Arc<dyn PeerChannel>)
        .await
    {
        Ok(peer) => peer,
        Err(err) => {
            warn!("rejecting peer {} for room {}: {}", peer_id, room.id(), err);
            return;
        }
    };

    info!("peer {} connected to room {}", peer_id, room.id());
    let (mut sender, mut receiver) = socket.split();

    loop {
        tokio::select! {
            incoming = receiver.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        handle_frame(&text, &room, &peer, &channel);
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(err)) => {
                        debug!("socket error for peer {}: {}", peer_id, err);
                        break;
                    }
                    _ => {}
                }
            }

            Some(frame) = frames.recv() => {
                let text = match serde_json::to_string(&frame) {
                    Ok(text) => text,
                    Err(err) => {
                        warn!("failed to encode frame: {}", err);
                        continue;
                    }
                };
                if sender.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }

            _ = shutdown.cancelled() => break,
        }
    }

    let _ = sender.close().await;
    channel.close();
    room.close_peer(&peer).await;
    info!("peer {} left room {}", peer_id, room.id());
}

fn handle_frame(
    text: &str,
    room: &Arc<Room>,
    peer: &Arc<crate::room::Peer>,
    channel: &Arc<WsPeerChannel>,
) {
    let frame = match serde_json::from_str::<Frame>(text) {
        Ok(frame) => frame,
        Err(err) => {
            warn!("ignoring malformed frame from peer {}: {}", peer.id(), err);
            return;
        }
    };

    match frame {
        Frame::Request {
            id, method, data, ..
        } => {
            let room = Arc::clone(room);
            let peer = Arc::clone(peer);
            let channel = Arc::clone(channel);

            // Requests run concurrently so `newConsumer` answers from this same
            // peer can still be read while its `join` is fanning out.
            tokio::spawn(async move {
                let responder = {
                    let channel = Arc::clone(&channel);
                    Responder::new(move |reply| channel.respond(id, reply))
                };
                match PeerRequest::parse(&method, data) {
                    Ok(request) => room.handle_request(&peer, request, responder).await,
                    Err(err) => responder.reject(err),
                }
            });
        }
        Frame::Response {
            id,
            ok,
            data,
            error_code,
            error_reason,
            ..
        } => {
            let result = if ok {
                Ok(data.unwrap_or(Value::Null))
            } else {
                Err(SignalingError::Rejected {
                    code: error_code.unwrap_or(500),
                    reason: error_reason.unwrap_or_default(),
                })
            };
            channel.resolve(id, result);
        }
        Frame::Notification { method, .. } => {
            debug!("notification {} from peer {} ignored", method, peer.id());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_frame_parsing() {
        let frame: Frame =
            serde_json::from_str(r#"{"request":true,"id":7,"method":"join","data":{}}"#).unwrap();
        assert_eq!(frame, Frame::request(7, "join".into(), json!({})));

        let frame: Frame = serde_json::from_str(
            r#"{"response":true,"id":3,"ok":false,"errorCode":500,"errorReason":"boom"}"#,
        )
        .unwrap();
        assert_eq!(frame, Frame::error(3, 500, "boom".into()));

        let frame: Frame =
            serde_json::from_str(r#"{"notification":true,"method":"x"}"#).unwrap();
        assert_eq!(frame, Frame::notification("x".into(), Value::Null));
    }

    #[test]
    fn test_error_response_omits_data() {
        let text = serde_json::to_value(Frame::error(1, 403, "nope".into())).unwrap();
        assert_eq!(
            text,
            json!({ "response": true, "id": 1, "ok": false, "errorCode": 403, "errorReason": "nope" })
        );
    }

    #[tokio::test]
    async fn test_request_resolves_from_response() {
        let (channel, mut frames) = WsPeerChannel::new();

        let requester = {
            let channel = Arc::clone(&channel);
            tokio::spawn(async move {
                channel
                    .request(PeerCall::NewDataConsumer {
                        peer_id: None,
                        data_producer_id: "dp".into(),
                        id: "dc".into(),
                        sctp_stream_parameters: None,
                        label: "bot".into(),
                        protocol: String::new(),
                        app_data: json!({}),
                    })
                    .await
            })
        };

        let id = match frames.recv().await.unwrap() {
            Frame::Request { id, method, .. } => {
                assert_eq!(method, "newDataConsumer");
                id
            }
            other => panic!("unexpected frame {:?}", other),
        };
        channel.resolve(id, Ok(json!({})));

        assert_eq!(requester.await.unwrap().unwrap(), json!({}));
    }

    #[tokio::test]
    async fn test_close_fails_pending_requests() {
        let (channel, _frames) = WsPeerChannel::new();

        let requester = {
            let channel = Arc::clone(&channel);
            tokio::spawn(async move {
                channel
                    .request(PeerCall::NewDataConsumer {
                        peer_id: None,
                        data_producer_id: "dp".into(),
                        id: "dc".into(),
                        sctp_stream_parameters: None,
                        label: "chat".into(),
                        protocol: String::new(),
                        app_data: json!({}),
                    })
                    .await
            })
        };

        tokio::task::yield_now().await;
        while channel.pending.lock().is_empty() {
            tokio::task::yield_now().await;
        }
        channel.close();

        assert!(matches!(
            requester.await.unwrap(),
            Err(SignalingError::Closed)
        ));
        assert!(channel
            .notify(Notification::PeerClosed {
                peer_id: "x".into()
            })
            .await
            .is_err());
    }
}
