//! Connection registry and room subscription index.
//!
//! The registry is the gateway's single source of truth for live
//! connections. The room index is derived state: it always equals the union
//! of each connection's subscription set, and empty rooms are pruned
//! immediately rather than tombstoned.
//!
//! Every operation on an unknown connection id is a silent no-op; disconnect
//! races are expected and never errors.

use std::sync::Arc;

use beacon_protocol::ServerMessage;
use dashmap::{DashMap, DashSet};
use tokio::sync::mpsc::UnboundedSender;
use tracing::debug;

use crate::connection::{Connection, Outbound};

/// Registry of live connections and their room subscriptions.
#[derive(Debug, Default)]
pub struct Registry {
    /// Live connections indexed by connection id.
    connections: DashMap<String, Arc<Connection>>,
    /// Derived index: room id to subscribed connection ids.
    rooms: DashMap<String, DashSet<String>>,
}

impl Registry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new connection for a verified identity.
    ///
    /// Allocates a fresh connection id and an empty subscription set; the
    /// caller keeps the returned handle for its dispatch loop.
    pub fn register(
        &self,
        user_id: impl Into<String>,
        username: impl Into<String>,
        sender: UnboundedSender<Outbound>,
    ) -> Arc<Connection> {
        let conn = Arc::new(Connection::new(user_id, username, sender));
        self.connections
            .insert(conn.id().to_string(), Arc::clone(&conn));
        debug!(connection = %conn.id(), user = %conn.username, "Connection registered");
        conn
    }

    /// Remove a connection, detaching it from every room it subscribed to.
    ///
    /// Idempotent: removing an unknown or already-removed id returns `None`.
    pub fn remove(&self, connection_id: &str) -> Option<Arc<Connection>> {
        let (_, conn) = self.connections.remove(connection_id)?;

        let rooms: Vec<String> = conn.subscriptions.iter().map(|r| r.key().clone()).collect();
        for room in &rooms {
            if let Some(members) = self.rooms.get(room) {
                members.remove(connection_id);
            }
            self.rooms.remove_if(room, |_, members| members.is_empty());
        }

        debug!(connection = %connection_id, "Connection removed");
        Some(conn)
    }

    /// Look up a live connection by id.
    #[must_use]
    pub fn connection(&self, connection_id: &str) -> Option<Arc<Connection>> {
        self.connections
            .get(connection_id)
            .map(|c| Arc::clone(c.value()))
    }

    /// Subscribe a connection to a room. Idempotent; unknown ids are no-ops.
    pub fn subscribe(&self, connection_id: &str, room_id: &str) {
        let Some(conn) = self.connections.get(connection_id) else {
            return;
        };
        conn.subscriptions.insert(room_id.to_string());
        self.rooms
            .entry(room_id.to_string())
            .or_default()
            .insert(connection_id.to_string());
        debug!(connection = %connection_id, room = %room_id, "Subscribed");
    }

    /// Unsubscribe a connection from a room, pruning the room if it empties.
    pub fn unsubscribe(&self, connection_id: &str, room_id: &str) {
        let Some(conn) = self.connections.get(connection_id) else {
            return;
        };
        conn.subscriptions.remove(room_id);
        if let Some(members) = self.rooms.get(room_id) {
            members.remove(connection_id);
        }
        self.rooms.remove_if(room_id, |_, members| members.is_empty());
        debug!(connection = %connection_id, room = %room_id, "Unsubscribed");
    }

    /// Snapshot the connections subscribed to a room.
    ///
    /// Returns a copy, not a live view: callers iterate and send without any
    /// registry guard held.
    #[must_use]
    pub fn room_members(&self, room_id: &str) -> Vec<Arc<Connection>> {
        let ids: Vec<String> = match self.rooms.get(room_id) {
            Some(members) => members.iter().map(|m| m.key().clone()).collect(),
            None => return Vec::new(),
        };
        ids.iter()
            .filter_map(|id| self.connections.get(id).map(|c| Arc::clone(c.value())))
            .collect()
    }

    /// Snapshot every live connection.
    #[must_use]
    pub fn connections(&self) -> Vec<Arc<Connection>> {
        self.connections
            .iter()
            .map(|c| Arc::clone(c.value()))
            .collect()
    }

    /// Unicast a frame to one connection.
    ///
    /// Returns `false` if the connection is unknown or its writer is gone.
    pub fn send_to(&self, connection_id: &str, message: ServerMessage) -> bool {
        match self.connections.get(connection_id) {
            Some(conn) => conn.send(Outbound::Frame(message)),
            None => false,
        }
    }

    /// Broadcast a frame to a room's subscribers, minus an optional excluded
    /// connection. Returns the number of connections the frame reached.
    pub fn broadcast_room(
        &self,
        room_id: &str,
        message: &ServerMessage,
        exclude: Option<&str>,
    ) -> usize {
        let mut delivered = 0;
        for conn in self.room_members(room_id) {
            if exclude == Some(conn.id()) {
                continue;
            }
            if conn.send(Outbound::Frame(message.clone())) {
                delivered += 1;
            } else {
                debug!(connection = %conn.id(), "Skipped broadcast to closing connection");
            }
        }
        delivered
    }

    /// Broadcast a frame to every live connection (presence updates).
    pub fn broadcast_global(&self, message: &ServerMessage) -> usize {
        let mut delivered = 0;
        for conn in self.connections() {
            if conn.send(Outbound::Frame(message.clone())) {
                delivered += 1;
            }
        }
        delivered
    }

    /// Number of live connections.
    #[must_use]
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    /// Whether the registry holds no connections.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Number of rooms with at least one subscriber.
    #[must_use]
    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use beacon_protocol::{PresenceStatus, RoomTarget};
    use tokio::sync::mpsc;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn register(registry: &Registry, user: &str) -> (Arc<Connection>, UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (registry.register(user, user, tx), rx)
    }

    fn recv_frame(rx: &mut UnboundedReceiver<Outbound>) -> Option<ServerMessage> {
        match rx.try_recv() {
            Ok(Outbound::Frame(message)) => Some(message),
            _ => None,
        }
    }

    #[test]
    fn test_connect_disconnect_leaves_no_index_entries() {
        let registry = Registry::new();
        let (conn, _rx) = register(&registry, "alice");

        registry.subscribe(conn.id(), "general");
        registry.subscribe(conn.id(), "random");
        assert_eq!(registry.room_count(), 2);

        registry.remove(conn.id());
        assert_eq!(registry.room_count(), 0);
        assert!(registry.room_members("general").is_empty());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_remove_is_idempotent() {
        let registry = Registry::new();
        let (conn, _rx) = register(&registry, "alice");

        assert!(registry.remove(conn.id()).is_some());
        assert!(registry.remove(conn.id()).is_none());
    }

    #[test]
    fn test_subscribe_is_idempotent() {
        let registry = Registry::new();
        let (conn, _rx) = register(&registry, "alice");

        registry.subscribe(conn.id(), "general");
        registry.subscribe(conn.id(), "general");

        assert_eq!(registry.room_members("general").len(), 1);
        assert_eq!(conn.subscriptions.len(), 1);
    }

    #[test]
    fn test_unknown_connection_ops_are_noops() {
        let registry = Registry::new();

        registry.subscribe("ghost", "general");
        registry.unsubscribe("ghost", "general");
        assert!(registry.remove("ghost").is_none());
        assert!(!registry.send_to("ghost", ServerMessage::pong(0)));
        assert_eq!(registry.room_count(), 0);
    }

    #[test]
    fn test_unsubscribe_prunes_empty_room() {
        let registry = Registry::new();
        let (a, _rx_a) = register(&registry, "alice");
        let (b, _rx_b) = register(&registry, "bob");

        registry.subscribe(a.id(), "general");
        registry.subscribe(b.id(), "general");

        registry.unsubscribe(a.id(), "general");
        assert_eq!(registry.room_count(), 1);

        registry.unsubscribe(b.id(), "general");
        assert_eq!(registry.room_count(), 0);
    }

    #[test]
    fn test_broadcast_room_honors_exclude() {
        let registry = Registry::new();
        let (a, mut rx_a) = register(&registry, "alice");
        let (b, mut rx_b) = register(&registry, "bob");
        let (c, mut rx_c) = register(&registry, "carol");

        registry.subscribe(a.id(), "general");
        registry.subscribe(b.id(), "general");
        registry.subscribe(c.id(), "other");

        let message = ServerMessage::typing(RoomTarget::channel("general"), "u2", "bob");
        let delivered = registry.broadcast_room("general", &message, Some(b.id()));

        assert_eq!(delivered, 1);
        assert_eq!(recv_frame(&mut rx_a), Some(message));
        assert!(recv_frame(&mut rx_b).is_none());
        assert!(recv_frame(&mut rx_c).is_none());
    }

    #[test]
    fn test_broadcast_room_skips_mid_disconnect_writer() {
        let registry = Registry::new();
        let (a, mut rx_a) = register(&registry, "alice");
        let (b, rx_b) = register(&registry, "bob");

        registry.subscribe(a.id(), "general");
        registry.subscribe(b.id(), "general");
        // b's writer task is gone but b is not yet removed from the registry.
        drop(rx_b);

        let message = ServerMessage::pong(1);
        let delivered = registry.broadcast_room("general", &message, None);

        assert_eq!(delivered, 1);
        assert_eq!(recv_frame(&mut rx_a), Some(message));
    }

    #[test]
    fn test_broadcast_global_reaches_all() {
        let registry = Registry::new();
        let (_a, mut rx_a) = register(&registry, "alice");
        let (_b, mut rx_b) = register(&registry, "bob");

        let message = ServerMessage::presence("u1", "alice", PresenceStatus::Offline, 1);
        assert_eq!(registry.broadcast_global(&message), 2);
        assert!(recv_frame(&mut rx_a).is_some());
        assert!(recv_frame(&mut rx_b).is_some());
    }
}
