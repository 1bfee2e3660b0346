//! Room subscriptions: which open connections currently want live events for a chat.
//!
//! This is transient, connection-scoped state. Whether a user *participates* in a chat is
//! persisted elsewhere and is never looked up from here.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::ids::{ConnectionId, RoomId};
use crate::ws_registry::Connection;

/// Lock order: `by_connection` entry first, then `rooms` entry.
pub struct RoomMembership {
    /// room -> subscribed connections. Never holds an empty set.
    rooms: DashMap<RoomId, HashMap<ConnectionId, Arc<Connection>>>,
    /// conn_id -> rooms it is subscribed to, for disconnect cleanup.
    by_connection: DashMap<ConnectionId, HashSet<RoomId>>,
}

impl RoomMembership {
    pub fn new() -> Self {
        Self {
            rooms: DashMap::new(),
            by_connection: DashMap::new(),
        }
    }

    /// Subscribe `conn` to `room_id`. Returns false if it was already subscribed or is closed.
    pub fn subscribe(&self, room_id: RoomId, conn: &Arc<Connection>) -> bool {
        if conn.is_closed() {
            return false;
        }
        let conn_id = conn.id();
        {
            let mut joined = self.by_connection.entry(conn_id).or_default();
            if !joined.insert(room_id) {
                return false;
            }
            self.rooms
                .entry(room_id)
                .or_default()
                .insert(conn_id, conn.clone());
        }
        // A disconnect may have swept this connection between the first check and the insert.
        if conn.is_closed() {
            self.unsubscribe(room_id, conn_id);
            return false;
        }
        true
    }

    /// Unsubscribe one connection from one room. No-op for unknown pairs.
    pub fn unsubscribe(&self, room_id: RoomId, conn_id: ConnectionId) -> bool {
        let mut joined = match self.by_connection.entry(conn_id) {
            Entry::Occupied(joined) => joined,
            Entry::Vacant(_) => return false,
        };
        if !joined.get_mut().remove(&room_id) {
            return false;
        }
        self.detach(room_id, conn_id);
        if joined.get().is_empty() {
            joined.remove();
        }
        true
    }

    /// Remove a connection from every room it was subscribed to. Returns the number of rooms left.
    pub fn drop_connection(&self, conn_id: ConnectionId) -> usize {
        match self.by_connection.remove(&conn_id) {
            Some((_, joined)) => {
                for room_id in &joined {
                    self.detach(*room_id, conn_id);
                }
                joined.len()
            }
            None => 0,
        }
    }

    fn detach(&self, room_id: RoomId, conn_id: ConnectionId) {
        if let Entry::Occupied(mut room) = self.rooms.entry(room_id) {
            room.get_mut().remove(&conn_id);
            if room.get().is_empty() {
                room.remove();
            }
        }
    }

    /// Snapshot of the connections subscribed to `room_id` right now.
    pub fn subscribers(&self, room_id: &RoomId) -> Vec<Arc<Connection>> {
        self.rooms
            .get(room_id)
            .map(|room| room.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn subscriber_count(&self, room_id: &RoomId) -> usize {
        self.rooms.get(room_id).map(|room| room.len()).unwrap_or(0)
    }

    pub fn is_subscribed(&self, room_id: &RoomId, conn_id: ConnectionId) -> bool {
        self.rooms
            .get(room_id)
            .map(|room| room.contains_key(&conn_id))
            .unwrap_or(false)
    }

    pub fn rooms_of(&self, conn_id: ConnectionId) -> Vec<RoomId> {
        self.by_connection
            .get(&conn_id)
            .map(|joined| joined.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Rooms with at least one subscriber.
    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }
}

impl Default for RoomMembership {
    fn default() -> Self {
        Self::new()
    }
}
