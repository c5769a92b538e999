//! Adapter behavior that needs no running Redis

use activity_relay::{
    DurableEventStore, Error, PresenceStore, RateLimitConfig, RateLimiter, RealtimeEvent,
    RoomDelivery, RoomRelay, ServerMessage,
};
use activity_relay_redis::{
    redis_url, RedisConnection, RedisEventStore, RedisPresenceStore, RedisRateLimiter,
    RedisRoomRelay,
};
use serde_json::json;

// ============== URL Tests ==============

#[test]
fn test_redis_url_without_password() {
    assert_eq!(redis_url("localhost", 6379, None), "redis://localhost:6379");
    assert_eq!(redis_url("cache", 6380, Some("")), "redis://cache:6380");
}

#[test]
fn test_redis_url_with_password() {
    assert_eq!(
        redis_url("cache.internal", 6379, Some("s3cret")),
        "redis://:s3cret@cache.internal:6379"
    );
}

// ============== Disconnected Adapter Tests ==============

#[tokio::test]
async fn test_presence_errors_when_disconnected() {
    let presence = RedisPresenceStore::new(RedisConnection::new());

    assert!(!presence.is_available().await);
    let err = presence.set_user_online("u1", true).await.unwrap_err();
    assert!(matches!(err, Error::Presence(_)));
    assert_eq!(err.code(), "PRESENCE_ERROR");
}

#[tokio::test]
async fn test_store_errors_when_disconnected() {
    let store = RedisEventStore::new(RedisConnection::new());
    let event = RealtimeEvent::new("r1", "PAGE_SYNC", json!({"page": 5}), "s1");

    assert!(!store.is_available().await);
    let err = store.store_event(&event).await.unwrap_err();
    assert!(matches!(err, Error::Persistence(_)));
    assert!(store.get_recent_events(10, None).await.is_err());
}

#[tokio::test]
async fn test_rate_limiter_fails_open() {
    let limiter = RedisRateLimiter::new(RedisConnection::new());
    let config = RateLimitConfig {
        window_ms: 1000,
        max_requests: 1,
    };

    for _ in 0..3 {
        assert!(limiter.check("r1", &config).await.is_ok());
    }
}

#[tokio::test]
async fn test_relay_publish_errors_when_disconnected() {
    let relay = RedisRoomRelay::new("redis://localhost:6379", RedisConnection::new());
    let delivery = RoomDelivery::new("a", vec!["consultants".to_string()], ServerMessage::heartbeat(1));

    let err = relay.publish(&delivery).await.unwrap_err();
    assert!(matches!(err, Error::Relay(_)));
}

#[tokio::test]
async fn test_close_is_idempotent() {
    let redis = RedisConnection::new();
    let presence = RedisPresenceStore::new(redis.clone());
    let store = RedisEventStore::new(redis.clone());

    presence.close().await;
    store.close().await;
    assert!(!redis.is_connected().await);
}
