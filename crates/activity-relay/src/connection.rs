//! Connection types

use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::warn;

use crate::identity::Identity;
use crate::protocol::ServerMessage;

/// Outbound buffer per connection
const OUTBOUND_CAPACITY: usize = 256;

/// Metadata about a connection
#[derive(Debug, Clone)]
pub struct ConnectionMetadata {
    /// When the connection was established
    pub connected_at: chrono::DateTime<chrono::Utc>,
    /// Relay instance ID
    pub instance_id: String,
    /// Client IP address (if available)
    pub client_ip: Option<String>,
    /// User agent (if available)
    pub user_agent: Option<String>,
}

/// An authenticated client connection
///
/// The identity is fixed at handshake. Room memberships are tracked by the
/// [`RoomRegistry`](crate::RoomRegistry), not here.
#[derive(Debug, Clone)]
pub struct Connection {
    /// Unique connection ID, also used as the session id of its events
    pub id: String,
    /// Who authenticated on this connection
    pub identity: Identity,
    /// Sender for pushing messages to this connection
    pub sender: mpsc::Sender<ServerMessage>,
    /// Connection metadata
    pub metadata: ConnectionMetadata,
}

impl Connection {
    /// Create a new connection
    pub fn new(
        identity: Identity,
        instance_id: String,
        client_ip: Option<String>,
        user_agent: Option<String>,
    ) -> (Self, mpsc::Receiver<ServerMessage>) {
        let (sender, receiver) = mpsc::channel(OUTBOUND_CAPACITY);
        let connection = Self {
            id: uuid::Uuid::new_v4().to_string(),
            identity,
            sender,
            metadata: ConnectionMetadata {
                connected_at: chrono::Utc::now(),
                instance_id,
                client_ip,
                user_agent,
            },
        };
        (connection, receiver)
    }

    /// Session id recorded on events and active-session rows
    pub fn session_id(&self) -> &str {
        &self.id
    }

    pub fn user_id(&self) -> &str {
        &self.identity.id
    }

    /// Check if the connection is still active
    pub fn is_active(&self) -> bool {
        !self.sender.is_closed()
    }

    /// Queue a message for this connection without waiting
    ///
    /// A connection whose buffer is full drops the frame, so a client that
    /// stops reading never stalls fan-out to the others.
    pub fn send(&self, message: ServerMessage) -> bool {
        match self.sender.try_send(message) {
            Ok(()) => true,
            Err(TrySendError::Full(message)) => {
                warn!(
                    connection_id = %self.id,
                    user_id = %self.identity.id,
                    message = message.name(),
                    "Outbound buffer full, dropping frame"
                );
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }
}
