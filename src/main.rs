mod config;

use std::time::Duration;

use activity_relay::{AuthGate, Gateway, MemoryEventStore, MemoryPresenceStore};
use activity_relay_redis::{
    RedisConnection, RedisEventStore, RedisPresenceStore, RedisRateLimiter, RedisRoomRelay,
};
use anyhow::Context;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::AppConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    // Redis TLS connections need a process-wide provider
    let _ = rustls::crypto::ring::default_provider().install_default();

    let config = AppConfig::load()?;
    if config.test_mode {
        tracing::info!("Running in TEST MODE");
    }

    tracing::info!(
        instance_id = %config.server.instance_id,
        port = config.server.port,
        redis = config.redis.url.is_some(),
        test_mode = config.test_mode,
        "Relay starting"
    );

    let mut auth = AuthGate::new(&config.auth.jwt_secret).with_rate_limit(config.auth.rate_limit());

    let builder = Gateway::builder()
        .port(config.server.port)
        .instance_id(config.server.instance_id.clone())
        .cors_origins(config.server.cors_origins.clone())
        .queue(config.queue.to_queue_config())
        .retention(Duration::from_secs(
            config.retention.session_retention_hours * 60 * 60,
        ));

    let builder = match config.redis.url.as_deref().filter(|_| !config.test_mode) {
        Some(redis_url) => {
            let redis = RedisConnection::new();
            redis
                .connect(redis_url)
                .await
                .context("Failed to connect to Redis")?;
            tracing::info!("Redis connected - presence and events are shared");

            auth = auth.with_rate_limiter(RedisRateLimiter::new(redis.clone()));
            builder
                .presence(RedisPresenceStore::new(redis.clone()))
                .store(RedisEventStore::new(redis.clone()))
                .relay(RedisRoomRelay::new(redis_url, redis))
        }
        None => {
            tracing::warn!("Redis not configured - presence and events are process-local");
            builder
                .presence(MemoryPresenceStore::new())
                .store(MemoryEventStore::default())
        }
    };

    builder.auth(auth).build()?.run().await
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "relay=info,activity_relay=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();
}
