//! # Activity Relay
//!
//! Real-time reader-activity notifications for consultant dashboards.
//!
//! Reader apps connect over WebSocket and emit activity events (logins, page
//! navigation, lookups, help requests, quiz attempts). Each event is queued,
//! persisted, and fanned out to the rooms interested in it, while a live
//! snapshot of who is online is pushed to every consultant.
//!
//! ## Features
//!
//! - **Pluggable Stores**: Implement `PresenceStore` and `DurableEventStore` for any backend
//! - **Room-based Routing**: `consultants`, `support`, `user:<id>` and `event:<type>` rooms with
//!   de-duplicated delivery when rooms overlap
//! - **Boundary Security**: JWT validation, role allow-lists and fixed-window rate limiting
//! - **Buffered Ingestion**: A bounded in-memory queue drained on a fixed interval
//! - **Horizontal Scaling**: Implement `RoomRelay` to forward deliveries between instances
//! - **Built-in Server**: Optional Axum-based WebSocket and HTTP surface
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use activity_relay::{AuthGate, Gateway, MemoryEventStore, MemoryPresenceStore};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     Gateway::builder()
//!         .port(3001)
//!         .auth(AuthGate::new("shared-secret"))
//!         .presence(MemoryPresenceStore::new())
//!         .store(MemoryEventStore::default())
//!         .build()?
//!         .run()
//!         .await
//! }
//! ```
//!
//! ## Custom Presence Store
//!
//! ```rust,ignore
//! use activity_relay::{async_trait, PresenceStore, Result};
//! use chrono::{DateTime, Utc};
//!
//! struct MyPresence;
//!
//! #[async_trait]
//! impl PresenceStore for MyPresence {
//!     async fn set_user_online(&self, user_id: &str, online: bool) -> Result<()> { Ok(()) }
//!     async fn get_online_users(&self) -> Result<Vec<String>> { Ok(vec![]) }
//!     async fn get_user_last_seen(&self, user_id: &str) -> Result<Option<DateTime<Utc>>> { Ok(None) }
//!     async fn is_available(&self) -> bool { true }
//!     fn name(&self) -> &'static str { "MyPresence" }
//! }
//! ```

pub mod auth;
mod broadcaster;
mod connection;
mod dispatch;
mod error;
pub mod event;
mod identity;
pub mod monitoring;
pub mod presence;
pub mod protocol;
pub mod queue;
pub mod relay;
pub mod rooms;
pub mod session;
pub mod store;

#[cfg(feature = "server")]
mod gateway;
#[cfg(feature = "server")]
mod handler;

// Re-exports
pub use auth::{AuthGate, Handshake, JwtClaims, MemoryRateLimiter, RateLimitConfig, RateLimiter};
pub use broadcaster::{target_rooms, EventBroadcaster};
pub use connection::{Connection, ConnectionMetadata};
pub use dispatch::{Dispatcher, DEFAULT_RECENT_LIMIT, MAX_RECENT_LIMIT};
pub use error::{AuthError, Error, Result};
pub use event::{ActivityPayload, EventPayload, EventType, RealtimeEvent};
pub use identity::{Identity, Role};
pub use monitoring::{HealthStatus, HealthThresholds, MonitoringService};
pub use presence::{MemoryPresenceStore, PresenceStore};
pub use protocol::{ClientMessage, ServerMessage};
pub use queue::{event_handler, EventHandler, EventQueue, QueueConfig, QueueStats};
pub use relay::{NoopRelay, RoomDelivery, RoomRelay};
pub use rooms::RoomRegistry;
pub use session::{ActiveSession, ConsultantSubscription, OnlineReader, OnlineReadersSnapshot};
pub use store::{DurableEventStore, MemoryEventStore};

#[cfg(feature = "server")]
pub use gateway::{Gateway, GatewayBuilder};

// Re-export commonly used types from dependencies
pub use async_trait::async_trait;
pub use tokio_util::sync::CancellationToken;
