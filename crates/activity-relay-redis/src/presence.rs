//! Redis-backed presence store

use activity_relay::{Error, PresenceStore, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::debug;

use crate::client::{timed, RedisConnection};

const ONLINE_USERS_KEY: &str = "online_users";

fn last_seen_key(user_id: &str) -> String {
    format!("user_last_seen:{}", user_id)
}

/// Presence shared by every relay instance
///
/// Online users are members of one set; last-seen is a per-user key holding
/// Unix milliseconds. Nothing expires on its own.
///
/// # Example
///
/// ```rust,ignore
/// use activity_relay_redis::{RedisConnection, RedisPresenceStore};
///
/// let redis = RedisConnection::new();
/// redis.connect("redis://localhost:6379").await?;
/// let presence = RedisPresenceStore::new(redis.clone());
/// ```
#[derive(Clone)]
pub struct RedisPresenceStore {
    redis: RedisConnection,
}

impl RedisPresenceStore {
    pub fn new(redis: RedisConnection) -> Self {
        Self { redis }
    }
}

fn presence_error(e: String) -> Error {
    Error::Presence(e)
}

#[async_trait]
impl PresenceStore for RedisPresenceStore {
    async fn set_user_online(&self, user_id: &str, online: bool) -> Result<()> {
        let mut conn = self.redis.manager().await.map_err(presence_error)?;

        let mut pipe = redis::pipe();
        pipe.atomic();
        if online {
            pipe.cmd("SADD").arg(ONLINE_USERS_KEY).arg(user_id).ignore();
            pipe.cmd("SET")
                .arg(last_seen_key(user_id))
                .arg(Utc::now().timestamp_millis())
                .ignore();
        } else {
            pipe.cmd("SREM").arg(ONLINE_USERS_KEY).arg(user_id).ignore();
        }

        timed(pipe.query_async::<()>(&mut conn))
            .await
            .map_err(presence_error)?;
        debug!(user_id, online, "Presence updated");
        Ok(())
    }

    async fn get_online_users(&self) -> Result<Vec<String>> {
        let mut conn = self.redis.manager().await.map_err(presence_error)?;
        let mut users: Vec<String> = timed(
            redis::cmd("SMEMBERS")
                .arg(ONLINE_USERS_KEY)
                .query_async(&mut conn),
        )
        .await
        .map_err(presence_error)?;
        users.sort();
        Ok(users)
    }

    async fn get_user_last_seen(&self, user_id: &str) -> Result<Option<DateTime<Utc>>> {
        let mut conn = self.redis.manager().await.map_err(presence_error)?;
        let millis: Option<i64> = timed(
            redis::cmd("GET")
                .arg(last_seen_key(user_id))
                .query_async(&mut conn),
        )
        .await
        .map_err(presence_error)?;
        Ok(millis.and_then(DateTime::from_timestamp_millis))
    }

    async fn is_available(&self) -> bool {
        self.redis.is_connected().await
    }

    async fn close(&self) {
        self.redis.disconnect().await;
    }

    fn name(&self) -> &'static str {
        "Redis"
    }
}
