//! Process-wide room table.

use super::{Room, RoomEvent, RoomServices};
use crate::error::{RoomError, RoomResult};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tracing::debug;

pub struct RoomRegistry {
    services: RoomServices,
    rooms: Arc<Mutex<HashMap<String, Arc<Room>>>>,
    /// Serializes room creation so concurrent joins of a new room id share
    /// one router.
    creation: tokio::sync::Mutex<()>,
}

impl RoomRegistry {
    pub fn new(services: RoomServices) -> Self {
        Self {
            services,
            rooms: Arc::new(Mutex::new(HashMap::new())),
            creation: tokio::sync::Mutex::new(()),
        }
    }

    pub fn services(&self) -> &RoomServices {
        &self.services
    }

    pub fn get(&self, room_id: &str) -> RoomResult<Arc<Room>> {
        self.rooms
            .lock()
            .get(room_id)
            .filter(|room| !room.closed())
            .cloned()
            .ok_or_else(|| RoomError::not_found("room", room_id))
    }

    pub fn rooms(&self) -> Vec<Arc<Room>> {
        let mut rooms: Vec<Arc<Room>> = self.rooms.lock().values().cloned().collect();
        rooms.sort_by(|a, b| a.id().cmp(b.id()));
        rooms
    }

    /// Returns the open room `room_id`, creating it if needed.
    /// `consumer_replicas` only applies to a newly created room.
    pub async fn get_or_create(
        &self,
        room_id: &str,
        consumer_replicas: Option<u32>,
    ) -> RoomResult<Arc<Room>> {
        let _creating = self.creation.lock().await;
        if let Ok(room) = self.get(room_id) {
            return Ok(room);
        }

        let replicas =
            consumer_replicas.unwrap_or(self.services.settings.media.consumer_replicas);
        let room = Room::create(room_id, replicas, &self.services).await?;
        self.rooms
            .lock()
            .insert(room_id.to_string(), Arc::clone(&room));

        let mut events = room.subscribe();
        let rooms = Arc::clone(&self.rooms);
        let weak = Arc::downgrade(&room);
        tokio::spawn(async move {
            while let Ok(event) = events.recv().await {
                let RoomEvent::Closed { room_id } = event;
                let mut rooms = rooms.lock();
                let same = rooms
                    .get(&room_id)
                    .is_some_and(|current| Weak::ptr_eq(&Arc::downgrade(current), &weak));
                if same {
                    rooms.remove(&room_id);
                    debug!("room {} removed from registry", room_id);
                }
                break;
            }
        });

        Ok(room)
    }

    /// Closes every room, used on shutdown.
    pub async fn close_all(&self) {
        for room in self.rooms() {
            room.close().await;
        }
    }
}
