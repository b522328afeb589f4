//! Peer and broadcaster records and the media objects they own.

use crate::engine::{Consumer, DataConsumer, DataProducer, Producer, Transport};
use crate::error::{RoomError, RoomResult};
use crate::signaling::{notify_best_effort, Notification, PeerChannel};
use parking_lot::{Mutex, MutexGuard};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Engine objects owned by one participant, keyed by engine id.
#[derive(Default)]
pub struct PeerMedia {
    pub transports: HashMap<String, Arc<dyn Transport>>,
    pub producers: HashMap<String, Arc<dyn Producer>>,
    pub consumers: HashMap<String, Arc<dyn Consumer>>,
    pub data_producers: HashMap<String, Arc<dyn DataProducer>>,
    pub data_consumers: HashMap<String, Arc<dyn DataConsumer>>,
}

impl PeerMedia {
    pub fn transport(&self, id: &str) -> RoomResult<Arc<dyn Transport>> {
        self.transports
            .get(id)
            .cloned()
            .ok_or_else(|| RoomError::not_found("transport", id))
    }

    pub fn producer(&self, id: &str) -> RoomResult<Arc<dyn Producer>> {
        self.producers
            .get(id)
            .cloned()
            .ok_or_else(|| RoomError::not_found("producer", id))
    }

    pub fn consumer(&self, id: &str) -> RoomResult<Arc<dyn Consumer>> {
        self.consumers
            .get(id)
            .cloned()
            .ok_or_else(|| RoomError::not_found("consumer", id))
    }

    pub fn data_producer(&self, id: &str) -> RoomResult<Arc<dyn DataProducer>> {
        self.data_producers
            .get(id)
            .cloned()
            .ok_or_else(|| RoomError::not_found("dataProducer", id))
    }

    pub fn data_consumer(&self, id: &str) -> RoomResult<Arc<dyn DataConsumer>> {
        self.data_consumers
            .get(id)
            .cloned()
            .ok_or_else(|| RoomError::not_found("dataConsumer", id))
    }

    /// The transport tagged for receiving media.
    pub fn consuming_transport(&self) -> Option<Arc<dyn Transport>> {
        self.transports
            .values()
            .find(|transport| transport.app_data().consuming)
            .cloned()
    }

    /// Removes every transport so they can be closed outside the lock.
    pub fn take_transports(&mut self) -> Vec<Arc<dyn Transport>> {
        self.transports.drain().map(|(_, transport)| transport).collect()
    }
}

/// Shared handle to a participant's media maps. Engine event watchers hold a
/// weak reference so they never keep a departed participant alive.
pub type SharedMedia = Arc<Mutex<PeerMedia>>;

fn close_all(media: &SharedMedia) {
    let transports = media.lock().take_transports();
    for transport in transports {
        transport.close();
    }
}

#[derive(Debug, Clone, Default)]
pub struct PeerProfile {
    pub joined: bool,
    pub display_name: Option<String>,
    pub device: Value,
    pub rtp_capabilities: Option<Value>,
    pub sctp_capabilities: Option<Value>,
}

/// A signaling participant.
pub struct Peer {
    id: String,
    channel: Arc<dyn PeerChannel>,
    profile: Mutex<PeerProfile>,
    media: SharedMedia,
    closed: AtomicBool,
}

impl Peer {
    pub fn new(id: &str, channel: Arc<dyn PeerChannel>) -> Self {
        Self {
            id: id.to_string(),
            channel,
            profile: Mutex::new(PeerProfile::default()),
            media: Arc::new(Mutex::new(PeerMedia::default())),
            closed: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn channel(&self) -> &Arc<dyn PeerChannel> {
        &self.channel
    }

    pub fn joined(&self) -> bool {
        self.profile.lock().joined
    }

    pub fn closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn profile(&self) -> PeerProfile {
        self.profile.lock().clone()
    }

    pub(crate) fn profile_mut(&self) -> MutexGuard<'_, PeerProfile> {
        self.profile.lock()
    }

    pub fn media(&self) -> MutexGuard<'_, PeerMedia> {
        self.media.lock()
    }

    pub(crate) fn shared_media(&self) -> &SharedMedia {
        &self.media
    }

    pub fn rtp_capabilities(&self) -> Option<Value> {
        self.profile.lock().rtp_capabilities.clone()
    }

    pub fn sctp_capabilities(&self) -> Option<Value> {
        self.profile.lock().sctp_capabilities.clone()
    }

    /// `{id, displayName, device}` as announced to other peers.
    pub fn info(&self) -> Value {
        let profile = self.profile.lock();
        json!({
            "id": self.id,
            "displayName": profile.display_name,
            "device": profile.device,
        })
    }

    pub async fn notify(&self, notification: Notification) {
        notify_best_effort(self.channel.as_ref(), notification).await;
    }

    /// Marks the peer closed and drops its signaling connection. Returns
    /// false if the peer was already closed.
    pub(crate) fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.channel.close();
        true
    }

    /// Closes every owned transport, and with them all producers and
    /// consumers created on them.
    pub(crate) fn close_transports(&self) {
        close_all(&self.media);
    }
}

/// An HTTP-driven participant. Its profile is fixed at creation.
pub struct Broadcaster {
    id: String,
    display_name: String,
    device: Value,
    rtp_capabilities: Option<Value>,
    media: SharedMedia,
}

impl Broadcaster {
    pub fn new(
        id: &str,
        display_name: &str,
        device: Value,
        rtp_capabilities: Option<Value>,
    ) -> Self {
        Self {
            id: id.to_string(),
            display_name: display_name.to_string(),
            device,
            rtp_capabilities,
            media: Arc::new(Mutex::new(PeerMedia::default())),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn rtp_capabilities(&self) -> Option<&Value> {
        self.rtp_capabilities.as_ref()
    }

    pub fn media(&self) -> MutexGuard<'_, PeerMedia> {
        self.media.lock()
    }

    pub(crate) fn shared_media(&self) -> &SharedMedia {
        &self.media
    }

    pub fn info(&self) -> Value {
        json!({
            "id": self.id,
            "displayName": self.display_name,
            "device": self.device,
        })
    }

    pub(crate) fn close(&self) {
        close_all(&self.media);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookups_report_kind_and_id() {
        let media = PeerMedia::default();
        let err = media.transport("t9").err().unwrap();
        assert_eq!(err.to_string(), "transport with id \"t9\" not found");
        assert!(matches!(
            media.data_consumer("d1"),
            Err(RoomError::NotFound { kind: "dataConsumer", .. })
        ));
        assert!(media.consuming_transport().is_none());
    }

    #[test]
    fn test_broadcaster_info() {
        let broadcaster = Broadcaster::new(
            "b1",
            "Lobby camera",
            json!({"flag": "broadcaster", "name": "gst"}),
            None,
        );
        assert_eq!(
            broadcaster.info(),
            json!({
                "id": "b1",
                "displayName": "Lobby camera",
                "device": {"flag": "broadcaster", "name": "gst"}
            })
        );
    }
}
