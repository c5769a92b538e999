//! Room registry: which connections belong to which broadcast groups

use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::connection::Connection;
use crate::protocol::ServerMessage;

/// Blanket audience of every consultant dashboard
pub const CONSULTANTS: &str = "consultants";
/// Support staff; also receives help requests and feedback
pub const SUPPORT: &str = "support";

/// Identity-scoped room of a user's own connections
pub fn user_room(user_id: &str) -> String {
    format!("user:{}", user_id)
}

/// Topic room for one event type
pub fn event_room(event_type: &str) -> String {
    format!("event:{}", event_type)
}

/// Tracks connections and their room memberships
///
/// Memberships are exactly the joins minus the leaves; empty rooms are
/// dropped so `all_rooms` only lists occupied ones.
#[derive(Clone)]
pub struct RoomRegistry {
    /// All active connections: connection_id -> connection
    connections: Arc<DashMap<String, Connection>>,
    /// Index: room -> connection_ids
    rooms: Arc<DashMap<String, HashSet<String>>>,
    /// Reverse index: connection_id -> rooms
    memberships: Arc<DashMap<String, HashSet<String>>>,
    /// Heartbeat broadcaster
    heartbeat_tx: broadcast::Sender<i64>,
    /// Relay instance ID
    instance_id: String,
}

impl RoomRegistry {
    /// Create a new registry
    pub fn new(instance_id: impl Into<String>) -> Self {
        let (heartbeat_tx, _) = broadcast::channel(16);
        Self {
            connections: Arc::new(DashMap::new()),
            rooms: Arc::new(DashMap::new()),
            memberships: Arc::new(DashMap::new()),
            heartbeat_tx,
            instance_id: instance_id.into(),
        }
    }

    /// Register a new connection with no memberships
    pub fn register(&self, connection: Connection) {
        let connection_id = connection.id.clone();
        self.memberships.entry(connection_id.clone()).or_default();
        self.connections.insert(connection_id, connection);
    }

    /// Unregister a connection, leaving every room it occupied
    ///
    /// Returns the rooms that were left.
    pub fn unregister(&self, connection_id: &str) -> Vec<String> {
        let rooms: Vec<String> = self
            .memberships
            .remove(connection_id)
            .map(|(_, rooms)| rooms.into_iter().collect())
            .unwrap_or_default();

        for room in &rooms {
            self.remove_from_room(room, connection_id);
        }

        if self.connections.remove(connection_id).is_some() {
            info!(connection_id, rooms = rooms.len(), "Connection unregistered");
        }
        rooms
    }

    /// Add a connection to a room
    ///
    /// Returns false if the connection is unknown.
    pub fn join(&self, connection_id: &str, room: &str) -> bool {
        match self.memberships.get_mut(connection_id) {
            Some(mut rooms) => {
                rooms.insert(room.to_string());
            }
            None => return false,
        }
        self.rooms
            .entry(room.to_string())
            .or_default()
            .insert(connection_id.to_string());
        debug!(connection_id, room, "Joined room");
        true
    }

    /// Remove a connection from a room
    ///
    /// Returns false if the connection was not in the room.
    pub fn leave(&self, connection_id: &str, room: &str) -> bool {
        let was_member = self
            .memberships
            .get_mut(connection_id)
            .map(|mut rooms| rooms.remove(room))
            .unwrap_or(false);
        if was_member {
            self.remove_from_room(room, connection_id);
            debug!(connection_id, room, "Left room");
        }
        was_member
    }

    fn remove_from_room(&self, room: &str, connection_id: &str) {
        let now_empty = match self.rooms.get_mut(room) {
            Some(mut ids) => {
                ids.remove(connection_id);
                ids.is_empty()
            }
            None => false,
        };
        if now_empty {
            self.rooms.remove_if(room, |_, ids| ids.is_empty());
        }
    }

    /// Rooms a connection currently belongs to
    pub fn rooms_of(&self, connection_id: &str) -> Vec<String> {
        self.memberships
            .get(connection_id)
            .map(|rooms| rooms.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn is_member(&self, connection_id: &str, room: &str) -> bool {
        self.memberships
            .get(connection_id)
            .map(|rooms| rooms.contains(room))
            .unwrap_or(false)
    }

    /// Number of connections in a room
    pub fn room_occupants(&self, room: &str) -> usize {
        self.rooms.get(room).map(|ids| ids.len()).unwrap_or(0)
    }

    /// Names of all occupied rooms
    pub fn all_rooms(&self) -> Vec<String> {
        self.rooms.iter().map(|e| e.key().clone()).collect()
    }

    /// Send message to every connection in a room
    pub fn send_to_room(&self, room: &str, message: ServerMessage) -> usize {
        self.send_to_rooms(&[room.to_string()], message)
    }

    /// Send message once to every connection in any of the rooms
    pub fn send_to_rooms(&self, rooms: &[String], message: ServerMessage) -> usize {
        let mut targets: HashSet<String> = HashSet::new();
        for room in rooms {
            if let Some(ids) = self.rooms.get(room) {
                targets.extend(ids.iter().cloned());
            }
        }

        let mut sent = 0;
        for conn_id in targets {
            let connection = self.connections.get(&conn_id).map(|c| c.value().clone());
            if let Some(conn) = connection {
                if conn.send(message.clone()) {
                    sent += 1;
                }
            }
        }
        sent
    }

    /// Send message to a specific connection
    pub fn send_to_connection(&self, connection_id: &str, message: ServerMessage) -> bool {
        let connection = self.connections.get(connection_id).map(|c| c.value().clone());
        match connection {
            Some(conn) => conn.send(message),
            None => false,
        }
    }

    /// Send heartbeat to all connections
    pub fn send_heartbeat(&self) {
        let ts = chrono::Utc::now().timestamp_millis();
        let _ = self.heartbeat_tx.send(ts);
    }

    /// Subscribe to heartbeat events
    pub fn subscribe_heartbeat(&self) -> broadcast::Receiver<i64> {
        self.heartbeat_tx.subscribe()
    }

    pub fn connection(&self, connection_id: &str) -> Option<Connection> {
        self.connections.get(connection_id).map(|c| c.value().clone())
    }

    /// Get total connection count
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// List all connections
    pub fn list_connections(&self) -> Vec<Connection> {
        self.connections.iter().map(|e| e.value().clone()).collect()
    }

    /// Connections whose receiving side is gone
    pub fn dead_connections(&self) -> Vec<Connection> {
        self.connections
            .iter()
            .filter(|e| !e.value().is_active())
            .map(|e| e.value().clone())
            .collect()
    }

    /// Get the instance ID
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }
}
