//! Cross-instance room fan-out
//!
//! Every local room delivery is also published through the relay so that
//! connections held by other instances receive it. Each instance ignores
//! deliveries it originated.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::Result;
use crate::protocol::ServerMessage;
use crate::rooms::RoomRegistry;

/// One room delivery as it travels between instances
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomDelivery {
    /// Instance that performed the local delivery
    pub origin: String,
    pub rooms: Vec<String>,
    pub message: ServerMessage,
}

impl RoomDelivery {
    pub fn new(origin: impl Into<String>, rooms: Vec<String>, message: ServerMessage) -> Self {
        Self {
            origin: origin.into(),
            rooms,
            message,
        }
    }
}

#[async_trait]
pub trait RoomRelay: Send + Sync + 'static {
    /// Publish a delivery to the other instances
    async fn publish(&self, delivery: &RoomDelivery) -> Result<()>;

    /// Start receiving deliveries from other instances into `registry`
    ///
    /// Runs until `cancel` fires; implementations spawn their own task.
    async fn start(&self, registry: RoomRegistry, cancel: CancellationToken) -> Result<()>;

    /// Release connections held by the relay
    async fn close(&self) {}

    /// Return the relay name (for logging)
    fn name(&self) -> &'static str;
}

/// Deliver a relayed message to local connections
///
/// Returns the number of connections reached; own deliveries are skipped.
pub async fn deliver_relayed(registry: &RoomRegistry, delivery: RoomDelivery) -> usize {
    if delivery.origin == registry.instance_id() {
        return 0;
    }
    let sent = registry.send_to_rooms(&delivery.rooms, delivery.message);
    debug!(origin = %delivery.origin, rooms = ?delivery.rooms, sent, "Relayed delivery");
    sent
}

/// Single-instance relay that publishes nowhere
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopRelay;

#[async_trait]
impl RoomRelay for NoopRelay {
    async fn publish(&self, _delivery: &RoomDelivery) -> Result<()> {
        Ok(())
    }

    async fn start(&self, _registry: RoomRegistry, _cancel: CancellationToken) -> Result<()> {
        Ok(())
    }

    fn name(&self) -> &'static str {
        "Noop"
    }
}
