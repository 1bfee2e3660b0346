//! Presence: connection lifecycle on top of the registry, with disconnect cascading into room cleanup.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::ids::{ConnectionId, UserId};
use crate::metrics::Metrics;
use crate::rooms::RoomMembership;
use crate::ws_registry::{Connection, ConnectionRegistry};

pub struct PresenceTracker {
    registry: Arc<ConnectionRegistry>,
    rooms: Arc<RoomMembership>,
    metrics: Metrics,
    connection_buffer: usize,
}

impl PresenceTracker {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        rooms: Arc<RoomMembership>,
        metrics: Metrics,
        connection_buffer: usize,
    ) -> Self {
        Self {
            registry,
            rooms,
            metrics,
            connection_buffer,
        }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn rooms(&self) -> &Arc<RoomMembership> {
        &self.rooms
    }

    /// Open and register a new connection for an authenticated user. The caller owns the
    /// receiver and must call `disconnect(uid, conn.id())` when the transport closes.
    pub fn connect(&self, uid: UserId) -> (Arc<Connection>, mpsc::Receiver<String>) {
        let (conn, rx) = Connection::open(self.connection_buffer);
        self.attach(uid, conn.clone());
        (conn, rx)
    }

    /// Register a connection created elsewhere.
    pub fn attach(&self, uid: UserId, conn: Arc<Connection>) -> bool {
        let conn_id = conn.id();
        let added = self.registry.add(uid, conn);
        if added {
            tracing::info!(%uid, %conn_id, "connection opened");
            self.refresh_gauges();
        }
        added
    }

    /// Tear down a connection: registry, then every room subscription. Only the first call for a
    /// given connection does anything, whichever path (socket close, eviction, pruning) gets here first.
    pub fn disconnect(&self, uid: &UserId, conn_id: ConnectionId) -> bool {
        let Some(conn) = self.registry.remove(uid, conn_id) else {
            return false;
        };
        conn.close();
        let rooms_left = self.rooms.drop_connection(conn_id);
        let session_secs = (chrono::Utc::now() - conn.connected_at()).num_seconds();
        tracing::info!(%uid, %conn_id, rooms_left, session_secs, "connection closed");
        self.refresh_gauges();
        true
    }

    /// Disconnect by connection id alone, resolving the owner through the registry.
    pub fn evict(&self, conn_id: ConnectionId) -> bool {
        match self.registry.owner_of(conn_id) {
            Some(uid) => self.disconnect(&uid, conn_id),
            None => false,
        }
    }

    pub fn is_online(&self, uid: &UserId) -> bool {
        self.registry.contains_user(uid)
    }

    pub fn online_users(&self) -> usize {
        self.registry.count()
    }

    /// Disconnect every connection idle for more than `max_idle_secs`. Returns how many were dropped.
    pub fn prune_stale(&self, max_idle_secs: u64) -> usize {
        let mut pruned = 0;
        for (uid, conn_id) in self.registry.idle_connections(max_idle_secs) {
            if self.disconnect(&uid, conn_id) {
                tracing::debug!(%uid, %conn_id, "pruned idle connection");
                pruned += 1;
            }
        }
        pruned
    }

    fn refresh_gauges(&self) {
        self.metrics.online_users.set(self.registry.count() as i64);
        self.metrics
            .open_connections
            .set(self.registry.connection_count() as i64);
    }
}

/// Background task pruning idle connections every `interval`.
pub fn spawn_stale_pruner(
    presence: Arc<PresenceTracker>,
    interval: Duration,
    max_idle_secs: u64,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let pruned = presence.prune_stale(max_idle_secs);
            if pruned > 0 {
                tracing::info!(pruned, "pruned idle connections");
            }
        }
    })
}
