//! Event broadcaster: persistence, room fan-out and presence snapshots

use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::event::{ActivityPayload, EventType, RealtimeEvent};
use crate::identity::Role;
use crate::monitoring::MonitoringService;
use crate::presence::PresenceStore;
use crate::protocol::ServerMessage;
use crate::relay::{NoopRelay, RoomDelivery, RoomRelay};
use crate::rooms::{self, RoomRegistry, CONSULTANTS, SUPPORT};
use crate::session::{ActiveSession, ConsultantSubscription, DeviceInfo, OnlineReader, OnlineReadersSnapshot};
use crate::store::DurableEventStore;

/// Rooms a `reader-activity` for this event is delivered to
pub fn target_rooms(event: &RealtimeEvent) -> Vec<String> {
    let mut targets = vec![
        CONSULTANTS.to_string(),
        rooms::user_room(&event.user_id),
        rooms::event_room(event.event_type.as_str()),
    ];
    if event.event_type.routes_to_support() {
        targets.push(SUPPORT.to_string());
    }
    targets
}

/// Orchestrates persistence and delivery of reader activity
///
/// Stores are injected; the broadcaster holds no global state of its own
/// beyond the room registry it was given.
#[derive(Clone)]
pub struct EventBroadcaster {
    rooms: RoomRegistry,
    presence: Arc<dyn PresenceStore>,
    store: Arc<dyn DurableEventStore>,
    relay: Arc<dyn RoomRelay>,
    monitoring: MonitoringService,
}

impl EventBroadcaster {
    pub fn new(
        rooms: RoomRegistry,
        presence: Arc<dyn PresenceStore>,
        store: Arc<dyn DurableEventStore>,
    ) -> Self {
        Self {
            rooms,
            presence,
            store,
            relay: Arc::new(NoopRelay),
            monitoring: MonitoringService::default(),
        }
    }

    /// Publish room deliveries to other instances through `relay`
    pub fn with_relay(mut self, relay: Arc<dyn RoomRelay>) -> Self {
        self.relay = relay;
        self
    }

    pub fn with_monitoring(mut self, monitoring: MonitoringService) -> Self {
        self.monitoring = monitoring;
        self
    }

    pub fn rooms(&self) -> &RoomRegistry {
        &self.rooms
    }

    pub fn presence(&self) -> &Arc<dyn PresenceStore> {
        &self.presence
    }

    pub fn store(&self) -> &Arc<dyn DurableEventStore> {
        &self.store
    }

    pub fn relay(&self) -> &Arc<dyn RoomRelay> {
        &self.relay
    }

    pub fn monitoring(&self) -> &MonitoringService {
        &self.monitoring
    }

    /// Persist an event, then fan it out
    ///
    /// Nothing is delivered if the store rejects the event. LOGIN and LOGOUT
    /// also update presence and republish the online-readers snapshot.
    /// Returns the number of local connections reached.
    pub async fn broadcast_event(&self, event: &RealtimeEvent) -> Result<usize> {
        let started = Instant::now();

        self.monitoring.record_store_op("store.store_event");
        if let Err(e) = self.store.store_event(event).await {
            error!(event_id = %event.id, error = %e, "Failed to persist event, not broadcasting");
            return Err(match e {
                Error::Persistence(_) => e,
                other => Error::Persistence(other.to_string()),
            });
        }

        let targets = target_rooms(event);
        let message = ServerMessage::ReaderActivity(ActivityPayload::from(event));
        let delivered = self.deliver(&targets, message).await;
        self.monitoring.record_event(event.event_type.as_str());

        debug!(
            event_id = %event.id,
            event_type = %event.event_type,
            user_id = %event.user_id,
            delivered,
            "Event broadcast"
        );

        if event.event_type.is_presence_change() {
            let online = event.event_type == EventType::Login;
            self.set_presence(&event.user_id, online).await;
            self.publish_online_readers().await;
        }

        self.monitoring.record_latency(started.elapsed());
        Ok(delivered)
    }

    /// Local delivery plus relay publication
    async fn deliver(&self, targets: &[String], message: ServerMessage) -> usize {
        let sent = self.rooms.send_to_rooms(targets, message.clone());

        let delivery = RoomDelivery::new(self.rooms.instance_id(), targets.to_vec(), message);
        if let Err(e) = self.relay.publish(&delivery).await {
            warn!(relay = self.relay.name(), error = %e, "Failed to relay delivery");
        }
        sent
    }

    async fn set_presence(&self, user_id: &str, online: bool) {
        self.monitoring.record_store_op("presence.set_user_online");
        if let Err(e) = self.presence.set_user_online(user_id, online).await {
            warn!(user_id, online, error = %e, "Failed to update presence");
        }
    }

    /// Current online users, enriched with display data where the store has it
    pub async fn online_readers(&self) -> Result<OnlineReadersSnapshot> {
        self.monitoring.record_store_op("presence.get_online_users");
        let users = self.presence.get_online_users().await.map_err(|e| match e {
            Error::Presence(_) => e,
            other => Error::Presence(other.to_string()),
        })?;

        self.monitoring.record_store_op("store.get_online_users");
        let enriched = match self.store.get_online_users().await {
            Ok(rows) => rows,
            Err(e) => {
                warn!(error = %e, "Online-users view unavailable, using presence only");
                Vec::new()
            }
        };
        let by_user: HashMap<&str, &OnlineReader> =
            enriched.iter().map(|r| (r.user_id.as_str(), r)).collect();

        let mut readers = Vec::with_capacity(users.len());
        for user_id in &users {
            let reader = match by_user.get(user_id.as_str()) {
                Some(row) => (*row).clone(),
                None => {
                    let last_seen = self
                        .presence
                        .get_user_last_seen(user_id)
                        .await
                        .ok()
                        .flatten()
                        .unwrap_or_else(Utc::now);
                    OnlineReader::new(user_id.clone(), last_seen)
                }
            };
            readers.push(reader);
        }
        readers.sort_by(|a, b| b.last_activity.cmp(&a.last_activity));

        Ok(OnlineReadersSnapshot::new(readers))
    }

    /// Recompute the snapshot and send it to `consultants`
    ///
    /// Presence failures are logged and the snapshot is skipped.
    pub async fn publish_online_readers(&self) -> Option<usize> {
        match self.online_readers().await {
            Ok(snapshot) => {
                let count = snapshot.count;
                let sent = self
                    .deliver(&[CONSULTANTS.to_string()], ServerMessage::OnlineReaders(snapshot))
                    .await;
                debug!(count, sent, "Online readers published");
                Some(sent)
            }
            Err(e) => {
                warn!(error = %e, "Failed to compute online readers, keeping previous snapshot");
                None
            }
        }
    }

    /// Add a connection to a room
    ///
    /// Joining `consultants` immediately sends that connection a fresh
    /// snapshot. Returns false if the connection is unknown.
    pub async fn join_room(&self, connection_id: &str, room: &str) -> bool {
        if !self.rooms.join(connection_id, room) {
            return false;
        }

        if room == CONSULTANTS {
            match self.online_readers().await {
                Ok(snapshot) => {
                    self.rooms
                        .send_to_connection(connection_id, ServerMessage::OnlineReaders(snapshot));
                }
                Err(e) => warn!(connection_id, error = %e, "No initial snapshot for consultant"),
            }
        }
        true
    }

    /// Remove a room membership; presence is untouched
    pub fn leave_room(&self, connection_id: &str, room: &str) -> bool {
        self.rooms.leave(connection_id, room)
    }

    /// Register a freshly authenticated connection
    pub async fn handle_user_connection(&self, connection: Connection) {
        let connection_id = connection.id.clone();
        let user_id = connection.identity.id.clone();
        let role = connection.identity.role;

        self.rooms.register(connection);
        self.monitoring.record_connection();
        self.set_presence(&user_id, true).await;

        match role {
            Role::Consultant => {
                self.join_room(&connection_id, CONSULTANTS).await;
                self.join_room(&connection_id, SUPPORT).await;
            }
            Role::Reader => {
                self.join_room(&connection_id, &rooms::user_room(&user_id)).await;
                self.publish_online_readers().await;
            }
            Role::Admin => {}
        }

        info!(connection_id, user_id, %role, "User connected");
    }

    /// Tear down a connection; safe to call more than once
    ///
    /// Returns the rooms the connection was removed from.
    pub async fn handle_user_disconnection(&self, connection_id: &str) -> Vec<String> {
        let Some(connection) = self.rooms.connection(connection_id) else {
            return Vec::new();
        };
        let user_id = connection.user_id().to_string();

        self.set_presence(&user_id, false).await;
        let left = self.rooms.unregister(connection_id);
        self.monitoring.record_disconnection();

        self.monitoring.record_store_op("store.deactivate_session");
        if let Err(e) = self.store.deactivate_session(connection.session_id()).await {
            warn!(connection_id, error = %e, "Failed to deactivate session");
        }

        if connection.identity.is_reader() {
            self.publish_online_readers().await;
        }

        info!(connection_id, user_id, rooms = left.len(), "User disconnected");
        left
    }

    /// Refresh the connection's active-session row
    pub async fn record_session_activity(&self, connection: &Connection) {
        let session = ActiveSession::new(connection.user_id(), connection.session_id())
            .with_device(DeviceInfo::from_user_agent(connection.metadata.user_agent.as_deref()))
            .with_ip(connection.metadata.client_ip.clone());

        self.monitoring.record_store_op("store.update_active_session");
        if let Err(e) = self.store.update_active_session(&session).await {
            warn!(session_id = %session.session_id, error = %e, "Failed to update active session");
        }
    }

    /// Join `consultants` plus one topic room per event type
    ///
    /// Returns the resolved event types, deduplicated in request order.
    pub async fn subscribe(
        &self,
        connection_id: &str,
        consultant_id: &str,
        event_types: &[String],
    ) -> Vec<String> {
        let mut resolved: Vec<String> = Vec::with_capacity(event_types.len());
        for event_type in event_types {
            if !event_type.is_empty() && !resolved.contains(event_type) {
                resolved.push(event_type.clone());
            }
        }

        self.join_room(connection_id, CONSULTANTS).await;
        for event_type in &resolved {
            self.rooms.join(connection_id, &rooms::event_room(event_type));
        }

        let mut subscription = self.current_subscription(consultant_id).await;
        subscription.event_types.extend(resolved.iter().cloned());
        subscription.is_active = true;
        self.save_subscription(&subscription).await;

        info!(connection_id, consultant_id, event_types = ?resolved, "Consultant subscribed");
        resolved
    }

    /// Leave the given topic rooms, or the whole `consultants` room when
    /// `event_types` is `None`
    ///
    /// Returns the event types that were dropped.
    pub async fn unsubscribe(
        &self,
        connection_id: &str,
        consultant_id: &str,
        event_types: Option<&[String]>,
    ) -> Vec<String> {
        let mut subscription = self.current_subscription(consultant_id).await;

        let dropped = match event_types {
            Some(types) => {
                for event_type in types {
                    self.rooms.leave(connection_id, &rooms::event_room(event_type));
                    subscription.event_types.remove(event_type);
                }
                types.to_vec()
            }
            None => {
                self.rooms.leave(connection_id, CONSULTANTS);
                subscription.is_active = false;
                Vec::new()
            }
        };
        self.save_subscription(&subscription).await;

        info!(connection_id, consultant_id, event_types = ?dropped, "Consultant unsubscribed");
        dropped
    }

    async fn current_subscription(&self, consultant_id: &str) -> ConsultantSubscription {
        match self.store.get_consultant_subscriptions(consultant_id).await {
            Ok(mut subscriptions) if !subscriptions.is_empty() => subscriptions.remove(0),
            Ok(_) => ConsultantSubscription::new(consultant_id, Vec::new()),
            Err(e) => {
                warn!(consultant_id, error = %e, "Failed to load subscription");
                ConsultantSubscription::new(consultant_id, Vec::new())
            }
        }
    }

    async fn save_subscription(&self, subscription: &ConsultantSubscription) {
        self.monitoring.record_store_op("store.store_subscription");
        if let Err(e) = self.store.store_subscription(subscription).await {
            warn!(consultant_id = %subscription.consultant_id, error = %e, "Failed to store subscription");
        }
    }

    /// Newest-first history from the durable store
    pub async fn recent_events(&self, limit: usize, user_id: Option<&str>) -> Result<Vec<RealtimeEvent>> {
        self.monitoring.record_store_op("store.get_recent_events");
        self.store
            .get_recent_events(limit, user_id)
            .await
            .map_err(|e| match e {
                Error::Persistence(_) => e,
                other => Error::Persistence(other.to_string()),
            })
    }

    /// Disconnect every connection whose receiving side has gone away
    pub async fn sweep_dead_connections(&self) -> usize {
        let dead = self.rooms.dead_connections();
        for connection in &dead {
            debug!(connection_id = %connection.id, "Removing dead connection");
            self.handle_user_disconnection(&connection.id).await;
        }
        if !dead.is_empty() {
            info!(count = dead.len(), "Cleaned up dead connections");
        }
        dead.len()
    }

    /// Mark idle sessions inactive; presence flags are left as they are
    pub async fn reap_idle_sessions(&self, max_idle: Duration) -> Result<usize> {
        self.monitoring.record_store_op("store.reap_idle_sessions");
        self.store.reap_idle_sessions(max_idle).await
    }

    pub fn get_room_occupants(&self, room: &str) -> usize {
        self.rooms.room_occupants(room)
    }

    pub fn get_all_rooms(&self) -> Vec<String> {
        self.rooms.all_rooms()
    }
}
