//! Fixed-window rate limiting shared across instances

use activity_relay::{Error, RateLimitConfig, RateLimiter, Result};
use async_trait::async_trait;
use tracing::warn;

use crate::client::{timed, RedisConnection};

fn window_key(key: &str) -> String {
    format!("relay:ratelimit:{}", key)
}

/// Rate-limit counters kept in Redis next to presence
///
/// The window key is created with a millisecond expiry on the first request
/// and counted with `INCR`; its expiry is the window, so it is never reset
/// early. Redis failures let the request through.
#[derive(Clone)]
pub struct RedisRateLimiter {
    redis: RedisConnection,
}

impl RedisRateLimiter {
    pub fn new(redis: RedisConnection) -> Self {
        Self { redis }
    }
}

#[async_trait]
impl RateLimiter for RedisRateLimiter {
    async fn check(&self, key: &str, config: &RateLimitConfig) -> Result<()> {
        let mut conn = match self.redis.manager().await {
            Ok(conn) => conn,
            Err(e) => {
                warn!(key, error = %e, "Rate limiter unavailable, allowing request");
                return Ok(());
            }
        };

        let redis_key = window_key(key);
        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("SET")
            .arg(&redis_key)
            .arg(0)
            .arg("PX")
            .arg(config.window_ms)
            .arg("NX")
            .ignore()
            .cmd("INCR")
            .arg(&redis_key)
            .cmd("PTTL")
            .arg(&redis_key);

        let (count, ttl_ms): (u64, i64) = match timed(pipe.query_async(&mut conn)).await {
            Ok(reply) => reply,
            Err(e) => {
                warn!(key, error = %e, "Rate limit check failed, allowing request");
                return Ok(());
            }
        };

        if count > u64::from(config.max_requests) {
            return Err(Error::RateLimited {
                retry_after_ms: ttl_ms.max(0) as u64,
            });
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "Redis"
    }
}
