//! Event fan-out: deliver a pre-serialized payload to the connections subscribed to a room, or to
//! every connection of a set of users.
//!
//! Subscriber sets are snapshotted under the shard lock and delivery happens after the lock is
//! released. Each delivery is bounded by `delivery_timeout`; a connection that times out or has
//! gone away is logged and evicted, and never surfaces as an error to the caller.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;

use crate::ids::{RoomId, UserId};
use crate::metrics::Metrics;
use crate::presence::PresenceTracker;
use crate::ws_registry::{Connection, DeliveryError};

/// Outcome counts of one fan-out call. Informational only.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryReport {
    pub delivered: usize,
    pub failed: usize,
}

#[derive(Clone)]
pub struct EventFanout {
    presence: Arc<PresenceTracker>,
    metrics: Metrics,
    delivery_timeout: Duration,
}

impl EventFanout {
    pub fn new(presence: Arc<PresenceTracker>, metrics: Metrics, delivery_timeout: Duration) -> Self {
        Self {
            presence,
            metrics,
            delivery_timeout,
        }
    }

    pub fn presence(&self) -> &Arc<PresenceTracker> {
        &self.presence
    }

    /// Deliver to every connection subscribed to `room_id` at the moment of the call.
    pub async fn publish(&self, room_id: RoomId, payload: impl Into<String>) -> DeliveryReport {
        let targets = self.presence.rooms().subscribers(&room_id);
        let report = self.deliver(targets, payload.into()).await;
        tracing::debug!(%room_id, delivered = report.delivered, failed = report.failed, "published to room");
        report
    }

    /// Deliver to every open connection of the given users, regardless of room subscriptions.
    pub async fn publish_to_users(&self, uids: &[UserId], payload: impl Into<String>) -> DeliveryReport {
        let registry = self.presence.registry();
        let mut seen = HashSet::new();
        let targets: Vec<Arc<Connection>> = uids
            .iter()
            .flat_map(|uid| registry.connections(uid))
            .filter(|conn| seen.insert(conn.id()))
            .collect();
        let report = self.deliver(targets, payload.into()).await;
        tracing::debug!(users = uids.len(), delivered = report.delivered, failed = report.failed, "published to users");
        report
    }

    /// Subscribe the new member's open connections to the room, then publish to the room.
    /// The subscription completes before delivery starts, so the member's own connections
    /// cannot miss the event announcing the addition.
    pub async fn add_member_and_notify(
        &self,
        room_id: RoomId,
        uid: UserId,
        payload: impl Into<String>,
    ) -> DeliveryReport {
        let rooms = self.presence.rooms();
        let mut joined = 0;
        for conn in self.presence.registry().connections(&uid) {
            if rooms.subscribe(room_id, &conn) {
                joined += 1;
            }
        }
        tracing::debug!(%room_id, %uid, joined, "member connections subscribed");
        self.publish(room_id, payload).await
    }

    /// Publish to the room (the leaving member included), then unsubscribe the member's connections.
    pub async fn remove_member_and_notify(
        &self,
        room_id: RoomId,
        uid: UserId,
        payload: impl Into<String>,
    ) -> DeliveryReport {
        let report = self.publish(room_id, payload).await;
        let rooms = self.presence.rooms();
        for conn in self.presence.registry().connections(&uid) {
            rooms.unsubscribe(room_id, conn.id());
        }
        report
    }

    async fn deliver(&self, targets: Vec<Arc<Connection>>, payload: String) -> DeliveryReport {
        let timeout = self.delivery_timeout;
        let results = join_all(
            targets
                .iter()
                .map(|conn| conn.deliver(payload.clone(), timeout)),
        )
        .await;

        let mut report = DeliveryReport::default();
        for (conn, result) in targets.iter().zip(results) {
            match result {
                Ok(()) => {
                    report.delivered += 1;
                    self.metrics.deliveries.with_label_values(&["delivered"]).inc();
                }
                Err(e) => {
                    report.failed += 1;
                    let outcome = match &e {
                        DeliveryError::Closed => "closed",
                        DeliveryError::TimedOut(_) => "timed_out",
                    };
                    self.metrics.deliveries.with_label_values(&[outcome]).inc();
                    tracing::warn!(conn_id = %conn.id(), error = %e, "delivery failed, evicting connection");
                    if self.presence.evict(conn.id()) {
                        self.metrics.evictions.inc();
                    }
                }
            }
        }
        report
    }
}
