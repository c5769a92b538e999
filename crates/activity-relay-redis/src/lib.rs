//! Redis adapters for the activity relay
//!
//! This crate provides:
//! - `RedisPresenceStore`: Online flags and last-seen shared by every instance
//! - `RedisEventStore`: Durable event log, active sessions and subscriptions
//! - `RedisRateLimiter`: Fixed-window counters colocated with presence
//! - `RedisRoomRelay`: Cross-instance room fan-out over Pub/Sub

mod client;
mod presence;
mod rate_limit;
mod relay;
mod store;

pub use client::{redis_url, RedisConnection, COMMAND_TIMEOUT};
pub use presence::RedisPresenceStore;
pub use rate_limit::RedisRateLimiter;
pub use relay::{RedisRoomRelay, ROOMS_CHANNEL};
pub use store::RedisEventStore;
