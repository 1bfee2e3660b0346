//! Connection registry: maps user id to the set of open transport connections (tabs/devices) of that user.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio::sync::{mpsc, Notify};

use crate::ids::{ConnectionId, UserId};

pub(crate) fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("connection closed")]
    Closed,
    #[error("delivery timed out after {0:?}")]
    TimedOut(Duration),
}

/// One open transport session. The socket task owns the receiving half of `tx`.
#[derive(Debug)]
pub struct Connection {
    id: ConnectionId,
    tx: mpsc::Sender<String>,
    connected_at: DateTime<Utc>,
    /// Unix timestamp (seconds) of the last keepalive from the client.
    last_ping_at: AtomicU64,
    closed: AtomicBool,
    close_signal: Notify,
}

impl Connection {
    /// Create a connection with an outbound queue of `buffer` payloads.
    pub fn open(buffer: usize) -> (Arc<Self>, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        let conn = Arc::new(Self {
            id: ConnectionId::next(),
            tx,
            connected_at: Utc::now(),
            last_ping_at: AtomicU64::new(now_secs()),
            closed: AtomicBool::new(false),
            close_signal: Notify::new(),
        });
        (conn, rx)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    /// Record a keepalive.
    pub fn touch(&self) {
        self.last_ping_at.store(now_secs(), Ordering::Relaxed);
    }

    pub fn idle_secs(&self, now: u64) -> u64 {
        now.saturating_sub(self.last_ping_at.load(Ordering::Relaxed))
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Mark closed and wake the socket task. Returns true only for the first call.
    pub(crate) fn close(&self) -> bool {
        let first = !self.closed.swap(true, Ordering::SeqCst);
        if first {
            self.close_signal.notify_one();
        }
        first
    }

    /// Resolves once the connection has been closed server-side (eviction, pruning).
    pub async fn closed(&self) {
        if self.is_closed() {
            return;
        }
        self.close_signal.notified().await;
    }

    /// Queue a payload for the socket task, waiting at most `timeout` for buffer space.
    pub async fn deliver(&self, payload: String, timeout: Duration) -> Result<(), DeliveryError> {
        if self.is_closed() {
            return Err(DeliveryError::Closed);
        }
        self.tx
            .send_timeout(payload, timeout)
            .await
            .map_err(|e| match e {
                SendTimeoutError::Timeout(_) => DeliveryError::TimedOut(timeout),
                SendTimeoutError::Closed(_) => DeliveryError::Closed,
            })
    }
}

/// Registry of open connections per user id. Thread-safe; shared via Arc.
///
/// Locking is per shard of the two maps. Every path that touches both takes the
/// owner index first and the user bucket second.
pub struct ConnectionRegistry {
    /// uid -> open connections of that user. Never holds an empty set.
    users: DashMap<UserId, HashMap<ConnectionId, Arc<Connection>>>,
    /// conn_id -> owning uid.
    owners: DashMap<ConnectionId, UserId>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            users: DashMap::new(),
            owners: DashMap::new(),
        }
    }

    /// Register `conn` under `uid`. Returns false if the pair was already present, or if the
    /// connection is owned by a different user (which is refused).
    pub fn add(&self, uid: UserId, conn: Arc<Connection>) -> bool {
        let conn_id = conn.id();
        match self.owners.entry(conn_id) {
            Entry::Occupied(owner) => {
                if *owner.get() != uid {
                    tracing::warn!(
                        %uid,
                        owner = %owner.get(),
                        %conn_id,
                        "refusing to register connection under a second user"
                    );
                }
                false
            }
            Entry::Vacant(slot) => {
                let _owner = slot.insert(uid);
                self.users.entry(uid).or_default().insert(conn_id, conn);
                true
            }
        }
    }

    /// Remove a single connection. An emptied user entry is dropped under the same bucket lock.
    /// Returns the removed connection, or None if the pair was not registered.
    pub fn remove(&self, uid: &UserId, conn_id: ConnectionId) -> Option<Arc<Connection>> {
        let owner = match self.owners.entry(conn_id) {
            Entry::Occupied(owner) if owner.get() == uid => owner,
            _ => return None,
        };
        let removed = match self.users.entry(*uid) {
            Entry::Occupied(mut bucket) => {
                let removed = bucket.get_mut().remove(&conn_id);
                if bucket.get().is_empty() {
                    bucket.remove();
                }
                removed
            }
            Entry::Vacant(_) => None,
        };
        owner.remove();
        removed
    }

    /// Snapshot of the connections of `uid`. An absent identity yields an empty set.
    pub fn get_connections(&self, uid: Option<&UserId>) -> Vec<Arc<Connection>> {
        match uid {
            Some(uid) => self.connections(uid),
            None => Vec::new(),
        }
    }

    pub fn connections(&self, uid: &UserId) -> Vec<Arc<Connection>> {
        self.users
            .get(uid)
            .map(|bucket| bucket.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn owner_of(&self, conn_id: ConnectionId) -> Option<UserId> {
        self.owners.get(&conn_id).map(|owner| *owner)
    }

    pub fn contains_user(&self, uid: &UserId) -> bool {
        self.users.contains_key(uid)
    }

    /// Number of distinct users holding at least one connection.
    pub fn count(&self) -> usize {
        self.users.len()
    }

    pub fn connection_count(&self) -> usize {
        self.owners.len()
    }

    /// Connections that have not sent a keepalive in more than `max_idle_secs` seconds.
    pub fn idle_connections(&self, max_idle_secs: u64) -> Vec<(UserId, ConnectionId)> {
        let now = now_secs();
        let mut idle = Vec::new();
        for bucket in self.users.iter() {
            let uid = *bucket.key();
            idle.extend(
                bucket
                    .values()
                    .filter(|conn| conn.idle_secs(now) > max_idle_secs)
                    .map(|conn| (uid, conn.id())),
            );
        }
        idle
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
