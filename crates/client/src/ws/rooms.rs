//! Room membership over the notification channel.
//!
//! A join requested while the socket is still connecting waits for the
//! channel's next state change instead of polling: it sends once if the
//! channel opens and gives up silently if the attempt fails. Membership
//! does not survive a reconnect; callers join again on the new connection.

use std::collections::HashMap;
use std::sync::Arc;

use cms_admin_shared::ClientAction;
use parking_lot::Mutex;
use tokio::task::JoinHandle;

use super::channel::NotificationChannel;
use super::connection::ConnectionState;

/// Rooms a view wants to be part of. Dropping it cancels pending joins.
pub struct RoomMembership {
    channel: NotificationChannel,
    rooms: Arc<Mutex<Rooms>>,
}

#[derive(Default)]
struct Rooms {
    pending: HashMap<String, JoinHandle<()>>,
    /// Room -> connection epoch the join was delivered on.
    joined: HashMap<String, u64>,
}

impl RoomMembership {
    pub fn new(channel: NotificationChannel) -> Self {
        Self {
            channel,
            rooms: Arc::new(Mutex::new(Rooms::default())),
        }
    }

    /// Join `room_id`: now if connected, once the connection opens if it is
    /// still connecting, never if the channel is down.
    pub fn join(&self, room_id: &str) {
        let mut rooms = self.rooms.lock();
        if rooms
            .pending
            .get(room_id)
            .is_some_and(|task| !task.is_finished())
        {
            tracing::debug!(room_id, "join already pending");
            return;
        }

        match self.channel.state() {
            ConnectionState::Connected => {
                if send_join(&self.channel, room_id) {
                    rooms
                        .joined
                        .insert(room_id.to_string(), self.channel.connection_epoch());
                }
            }
            ConnectionState::Connecting => {
                let channel = self.channel.clone();
                let shared = self.rooms.clone();
                let room = room_id.to_string();
                let mut states = self.channel.state_changes();
                let task = tokio::spawn(async move {
                    let settled = match states.wait_for(|s| !s.is_connecting()).await {
                        Ok(state) => *state,
                        Err(_) => ConnectionState::Disconnected,
                    };
                    let mut rooms = shared.lock();
                    rooms.pending.remove(&room);
                    if settled.is_connected() {
                        if send_join(&channel, &room) {
                            rooms.joined.insert(room, channel.connection_epoch());
                        }
                    } else {
                        tracing::debug!(room_id = %room, "channel closed before opening; join abandoned");
                    }
                });
                rooms.pending.insert(room_id.to_string(), task);
            }
            ConnectionState::Disconnected => {
                tracing::debug!(room_id, "channel down; join abandoned");
            }
        }
    }

    /// Leave `room_id`. Cancels a pending join; only sends while connected.
    pub fn leave(&self, room_id: &str) {
        let mut rooms = self.rooms.lock();
        if let Some(task) = rooms.pending.remove(room_id) {
            task.abort();
        }
        rooms.joined.remove(room_id);
        if !self.channel.is_connected() {
            return;
        }
        if let Err(e) = self
            .channel
            .send(&ClientAction::LeaveRoom(room_id.to_string()))
        {
            tracing::debug!(room_id, error = %e, "leave_room not sent");
        }
    }

    /// Rooms whose join was delivered on the current connection.
    pub fn joined_rooms(&self) -> Vec<String> {
        if !self.channel.is_connected() {
            return Vec::new();
        }
        let epoch = self.channel.connection_epoch();
        let mut rooms: Vec<String> = self
            .rooms
            .lock()
            .joined
            .iter()
            .filter(|(_, joined_on)| **joined_on == epoch)
            .map(|(room, _)| room.clone())
            .collect();
        rooms.sort();
        rooms
    }

    pub fn has_pending_join(&self, room_id: &str) -> bool {
        self.rooms
            .lock()
            .pending
            .get(room_id)
            .is_some_and(|task| !task.is_finished())
    }
}

impl Drop for RoomMembership {
    fn drop(&mut self) {
        for (_, task) in self.rooms.lock().pending.drain() {
            task.abort();
        }
    }
}

fn send_join(channel: &NotificationChannel, room_id: &str) -> bool {
    match channel.send(&ClientAction::JoinRoom(room_id.to_string())) {
        Ok(()) => {
            tracing::debug!(room_id, "join_room sent");
            true
        }
        Err(e) => {
            tracing::debug!(room_id, error = %e, "join_room not sent");
            false
        }
    }
}
