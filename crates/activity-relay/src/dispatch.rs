//! Per-connection protocol handling
//!
//! The dispatcher sits between a transport and the broadcaster. Every
//! failure inside a message handler is converted into an `event-error`
//! frame for that connection; nothing a client sends can take the
//! connection or the process down.

use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::auth::{AuthGate, Handshake};
use crate::broadcaster::EventBroadcaster;
use crate::connection::Connection;
use crate::error::{AuthError, Error, Result};
use crate::event::RealtimeEvent;
use crate::identity::{Identity, Role};
use crate::monitoring::MonitoringService;
use crate::protocol::{
    ClientMessage, EventReceivedAck, ReaderEventRequest, RecentEventsPayload, RecentEventsRequest,
    RoomAck, ServerMessage, SubscribeRequest, SubscriptionAck, UnsubscribeRequest,
};
use crate::queue::{event_handler, EventHandler, EventQueue};
use crate::rooms::{CONSULTANTS, SUPPORT};

/// `get-recent-events` limit when the client sends none
pub const DEFAULT_RECENT_LIMIT: usize = 50;
/// Upper bound on `get-recent-events` limit
pub const MAX_RECENT_LIMIT: usize = 500;

const STAFF: &[Role] = &[Role::Consultant, Role::Admin];

/// Routes client messages to the broadcaster and queue
#[derive(Clone)]
pub struct Dispatcher {
    auth: AuthGate,
    broadcaster: EventBroadcaster,
    queue: EventQueue,
}

impl Dispatcher {
    pub fn new(auth: AuthGate, broadcaster: EventBroadcaster, queue: EventQueue) -> Self {
        Self {
            auth,
            broadcaster,
            queue,
        }
    }

    pub fn auth(&self) -> &AuthGate {
        &self.auth
    }

    pub fn broadcaster(&self) -> &EventBroadcaster {
        &self.broadcaster
    }

    pub fn queue(&self) -> &EventQueue {
        &self.queue
    }

    pub fn monitoring(&self) -> &MonitoringService {
        self.broadcaster.monitoring()
    }

    /// Validate a handshake; failures are counted but never reach a room
    pub fn authenticate(&self, handshake: &Handshake) -> std::result::Result<Identity, AuthError> {
        self.monitoring().record_request();
        self.auth.authenticate(handshake).map_err(|e| {
            self.monitoring().record_error("AUTHENTICATION_ERROR");
            e
        })
    }

    pub async fn on_connect(&self, connection: Connection) {
        self.broadcaster.handle_user_connection(connection).await;
    }

    pub async fn on_disconnect(&self, connection_id: &str) {
        self.broadcaster.handle_user_disconnection(connection_id).await;
    }

    /// Handle one inbound text frame
    pub async fn handle_text(&self, connection: &Connection, text: &str) {
        match ClientMessage::parse(text) {
            Ok(message) => self.handle_message(connection, message).await,
            Err(e) => {
                self.monitoring().record_request();
                self.reply_error(connection, &e).await;
            }
        }
    }

    /// Handle one decoded message, replying on the connection
    pub async fn handle_message(&self, connection: &Connection, message: ClientMessage) {
        self.monitoring().record_request();
        let name = message.name();

        match self.dispatch(connection, message).await {
            Ok(replies) => {
                for reply in replies {
                    connection.send(reply);
                }
            }
            Err(e) => {
                warn!(
                    connection_id = %connection.id,
                    user_id = %connection.identity.id,
                    message = name,
                    error = %e,
                    "Client request failed"
                );
                self.reply_error(connection, &e).await;
            }
        }
    }

    async fn reply_error(&self, connection: &Connection, error: &Error) {
        self.monitoring().record_error(error.code());
        connection.send(ServerMessage::error(error));
    }

    /// Rate limit, authorize and execute a message
    ///
    /// Returns the frames to send back to the caller.
    pub async fn dispatch(&self, connection: &Connection, message: ClientMessage) -> Result<Vec<ServerMessage>> {
        self.auth.rate_limit(&connection.identity).await?;

        match message {
            ClientMessage::ReaderEvent(request) => self.reader_event(connection, request).await,
            ClientMessage::SubscribeConsultant(request) => self.subscribe(connection, request).await,
            ClientMessage::UnsubscribeConsultant(request) => self.unsubscribe(connection, request).await,
            ClientMessage::GetOnlineReaders => self.online_readers(connection).await,
            ClientMessage::GetRecentEvents(request) => self.recent_events(connection, request).await,
            ClientMessage::JoinRoom(request) => {
                self.authorize_room(&connection.identity, &request.room)?;
                if !self.broadcaster.join_room(&connection.id, &request.room).await {
                    return Err(Error::Server(format!("connection {} is not registered", connection.id)));
                }
                Ok(vec![ServerMessage::RoomJoined(RoomAck { room: request.room })])
            }
            ClientMessage::LeaveRoom(request) => {
                self.broadcaster.leave_room(&connection.id, &request.room);
                Ok(vec![ServerMessage::RoomLeft(RoomAck { room: request.room })])
            }
        }
    }

    async fn reader_event(&self, connection: &Connection, request: ReaderEventRequest) -> Result<Vec<ServerMessage>> {
        self.auth
            .authorize(&connection.identity, &[Role::Reader], "send reader events")?;
        if request.event_type.trim().is_empty() {
            return Err(Error::InvalidMessage("eventType is required".to_string()));
        }

        let event = RealtimeEvent::new(
            connection.user_id(),
            request.event_type,
            request.data,
            connection.session_id(),
        )
        .with_metadata(event_metadata(connection));
        let event_id = event.id.clone();

        self.queue.enqueue(event)?;
        self.broadcaster.record_session_activity(connection).await;

        Ok(vec![ServerMessage::ReaderEventReceived(EventReceivedAck {
            message: "Event received and queued".to_string(),
            event_id,
        })])
    }

    async fn subscribe(&self, connection: &Connection, request: SubscribeRequest) -> Result<Vec<ServerMessage>> {
        self.auth
            .authorize(&connection.identity, STAFF, "subscribe to consultant events")?;
        ensure_self(&connection.identity, &request.consultant_id)?;

        let event_types = self
            .broadcaster
            .subscribe(&connection.id, &request.consultant_id, &request.event_types)
            .await;

        Ok(vec![ServerMessage::SubscribeConsultantSuccess(SubscriptionAck {
            message: "Successfully subscribed to consultant events".to_string(),
            event_types,
        })])
    }

    async fn unsubscribe(&self, connection: &Connection, request: UnsubscribeRequest) -> Result<Vec<ServerMessage>> {
        self.auth
            .authorize(&connection.identity, STAFF, "unsubscribe from consultant events")?;
        ensure_self(&connection.identity, &request.consultant_id)?;

        let event_types = self
            .broadcaster
            .unsubscribe(&connection.id, &request.consultant_id, request.event_types.as_deref())
            .await;

        Ok(vec![ServerMessage::UnsubscribeConsultantSuccess(SubscriptionAck {
            message: "Successfully unsubscribed from consultant events".to_string(),
            event_types,
        })])
    }

    async fn online_readers(&self, connection: &Connection) -> Result<Vec<ServerMessage>> {
        self.auth
            .authorize(&connection.identity, STAFF, "view online readers")?;
        let snapshot = self.broadcaster.online_readers().await?;
        Ok(vec![ServerMessage::OnlineReaders(snapshot)])
    }

    async fn recent_events(&self, connection: &Connection, request: RecentEventsRequest) -> Result<Vec<ServerMessage>> {
        let identity = &connection.identity;
        let limit = request
            .limit
            .unwrap_or(DEFAULT_RECENT_LIMIT)
            .min(MAX_RECENT_LIMIT);

        let user_id = if identity.role.is_staff() {
            request.user_id
        } else {
            match request.user_id {
                Some(requested) if requested != identity.id => {
                    return Err(Error::forbidden(identity.role, "read another user's events"));
                }
                _ => Some(identity.id.clone()),
            }
        };

        let events = self
            .broadcaster
            .recent_events(limit, user_id.as_deref())
            .await?;
        debug!(connection_id = %connection.id, count = events.len(), "Recent events served");
        Ok(vec![ServerMessage::RecentEvents(RecentEventsPayload { events })])
    }

    /// Who may explicitly join which room
    fn authorize_room(&self, identity: &Identity, room: &str) -> Result<()> {
        let staff_only = room == CONSULTANTS || room == SUPPORT || room.starts_with("event:");
        if staff_only {
            return self.auth.authorize(identity, STAFF, &format!("join room {}", room));
        }
        if let Some(owner) = room.strip_prefix("user:") {
            if owner != identity.id && !identity.role.is_staff() {
                return Err(Error::forbidden(identity.role, format!("join room {}", room)));
            }
        }
        Ok(())
    }

    /// Broadcast one drained event
    ///
    /// Each attempt counts as a request. On failure the originating
    /// connection, found by the event's session id, is told; the error is
    /// returned so the queue dead-letters it.
    pub async fn process_queued(&self, event: RealtimeEvent) -> Result<()> {
        self.monitoring().record_request();
        match self.broadcaster.broadcast_event(&event).await {
            Ok(_) => Ok(()),
            Err(e) => {
                self.monitoring().record_error(e.code());
                let notified = self
                    .broadcaster
                    .rooms()
                    .send_to_connection(&event.session_id, ServerMessage::error(&e));
                debug!(event_id = %event.id, notified, "Reported failed event to its sender");
                Err(e)
            }
        }
    }

    /// Queue handler running [`Dispatcher::process_queued`]
    pub fn queue_handler(&self) -> EventHandler {
        let dispatcher = self.clone();
        event_handler(move |event| {
            let dispatcher = dispatcher.clone();
            async move { dispatcher.process_queued(event).await }
        })
    }
}

fn ensure_self(identity: &Identity, consultant_id: &str) -> Result<()> {
    if consultant_id == identity.id {
        Ok(())
    } else {
        Err(Error::forbidden(
            identity.role,
            format!("manage subscriptions of {}", consultant_id),
        ))
    }
}

/// Profile and handshake details recorded on every event
fn event_metadata(connection: &Connection) -> Map<String, Value> {
    let identity = &connection.identity;
    let mut metadata = Map::new();
    metadata.insert("email".to_string(), Value::from(identity.email.clone()));
    metadata.insert("role".to_string(), Value::from(identity.role.as_str()));
    if let Some(first_name) = &identity.first_name {
        metadata.insert("firstName".to_string(), Value::from(first_name.clone()));
    }
    if let Some(last_name) = &identity.last_name {
        metadata.insert("lastName".to_string(), Value::from(last_name.clone()));
    }
    if let Some(user_agent) = &connection.metadata.user_agent {
        metadata.insert("userAgent".to_string(), Value::from(user_agent.clone()));
    }
    if let Some(ip) = &connection.metadata.client_ip {
        metadata.insert("ipAddress".to_string(), Value::from(ip.clone()));
    }
    metadata.insert(
        "instanceId".to_string(),
        Value::from(connection.metadata.instance_id.clone()),
    );
    metadata
}
