//! Redis-backed durable event store

use activity_relay::session::{
    ActiveSession, CleanupReport, ConsultantSubscription, DashboardBucket, OnlineReader,
};
use activity_relay::store::{cutoff, dashboard_buckets, online_view, DASHBOARD_WINDOW_HOURS};
use activity_relay::{DurableEventStore, Error, RealtimeEvent, Result};
use async_trait::async_trait;
use chrono::Utc;
use redis::aio::ConnectionManager;
use std::collections::HashSet;
use std::time::Duration;
use tracing::{debug, warn};

use crate::client::{timed, RedisConnection};

const EVENT_BODIES_KEY: &str = "relay:event";
const EVENT_INDEX_KEY: &str = "relay:events";
const SESSIONS_KEY: &str = "relay:sessions";
const SUBSCRIPTIONS_KEY: &str = "relay:subscriptions";
/// Events considered per user when building the online view
const ONLINE_VIEW_DEPTH: isize = 20;

fn user_index_key(user_id: &str) -> String {
    format!("relay:events:user:{}", user_id)
}

fn persistence_error(e: String) -> Error {
    Error::Persistence(e)
}

fn decode<T: serde::de::DeserializeOwned>(json: &str) -> Option<T> {
    match serde_json::from_str(json) {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(error = %e, "Skipping undecodable record");
            None
        }
    }
}

fn encode<T: serde::Serialize>(value: &T) -> Result<String> {
    serde_json::to_string(value).map_err(|e| Error::Persistence(e.to_string()))
}

/// Durable store on Redis
///
/// Event bodies live in one hash keyed by event id, indexed by sorted sets
/// scored with the event time in milliseconds (one global, one per user).
/// Sessions and subscriptions are JSON values in hashes.
#[derive(Clone)]
pub struct RedisEventStore {
    redis: RedisConnection,
}

impl RedisEventStore {
    pub fn new(redis: RedisConnection) -> Self {
        Self { redis }
    }

    async fn conn(&self) -> Result<ConnectionManager> {
        self.redis.manager().await.map_err(persistence_error)
    }

    async fn events_by_id(conn: &mut ConnectionManager, ids: &[String]) -> Result<Vec<RealtimeEvent>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let bodies: Vec<Option<String>> = timed(
            redis::cmd("HMGET")
                .arg(EVENT_BODIES_KEY)
                .arg(ids)
                .query_async(conn),
        )
        .await
        .map_err(persistence_error)?;

        Ok(bodies.iter().flatten().filter_map(|json| decode(json)).collect())
    }

    async fn all_sessions(conn: &mut ConnectionManager) -> Result<Vec<ActiveSession>> {
        let values: Vec<String> = timed(redis::cmd("HVALS").arg(SESSIONS_KEY).query_async(conn))
            .await
            .map_err(persistence_error)?;
        Ok(values.iter().filter_map(|json| decode(json)).collect())
    }

    async fn put_sessions(conn: &mut ConnectionManager, sessions: &[ActiveSession]) -> Result<()> {
        if sessions.is_empty() {
            return Ok(());
        }
        let mut pipe = redis::pipe();
        for session in sessions {
            pipe.cmd("HSET")
                .arg(SESSIONS_KEY)
                .arg(&session.session_id)
                .arg(encode(session)?)
                .ignore();
        }
        timed(pipe.query_async::<()>(conn))
            .await
            .map_err(persistence_error)
    }

    async fn session(conn: &mut ConnectionManager, session_id: &str) -> Result<Option<ActiveSession>> {
        let json: Option<String> = timed(
            redis::cmd("HGET")
                .arg(SESSIONS_KEY)
                .arg(session_id)
                .query_async(conn),
        )
        .await
        .map_err(persistence_error)?;
        Ok(json.as_deref().and_then(decode))
    }
}

#[async_trait]
impl DurableEventStore for RedisEventStore {
    async fn store_event(&self, event: &RealtimeEvent) -> Result<()> {
        let mut conn = self.conn().await?;
        let score = event.timestamp.timestamp_millis();

        // Same id, same body, same members: rewriting is a no-op
        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("HSET")
            .arg(EVENT_BODIES_KEY)
            .arg(&event.id)
            .arg(encode(event)?)
            .ignore()
            .cmd("ZADD")
            .arg(EVENT_INDEX_KEY)
            .arg(score)
            .arg(&event.id)
            .ignore()
            .cmd("ZADD")
            .arg(user_index_key(&event.user_id))
            .arg(score)
            .arg(&event.id)
            .ignore();

        timed(pipe.query_async::<()>(&mut conn))
            .await
            .map_err(persistence_error)?;
        debug!(event_id = %event.id, "Event stored");
        Ok(())
    }

    async fn get_recent_events(&self, limit: usize, user_id: Option<&str>) -> Result<Vec<RealtimeEvent>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.conn().await?;
        let key = match user_id {
            Some(id) => user_index_key(id),
            None => EVENT_INDEX_KEY.to_string(),
        };

        let ids: Vec<String> = timed(
            redis::cmd("ZREVRANGE")
                .arg(&key)
                .arg(0)
                .arg(limit as isize - 1)
                .query_async(&mut conn),
        )
        .await
        .map_err(persistence_error)?;

        Self::events_by_id(&mut conn, &ids).await
    }

    async fn get_online_users(&self) -> Result<Vec<OnlineReader>> {
        let mut conn = self.conn().await?;
        let sessions: Vec<ActiveSession> = Self::all_sessions(&mut conn)
            .await?
            .into_iter()
            .filter(|s| s.is_active)
            .collect();

        let users: HashSet<&str> = sessions.iter().map(|s| s.user_id.as_str()).collect();
        let mut recent = Vec::new();
        for user_id in users {
            let ids: Vec<String> = timed(
                redis::cmd("ZREVRANGE")
                    .arg(user_index_key(user_id))
                    .arg(0)
                    .arg(ONLINE_VIEW_DEPTH - 1)
                    .query_async(&mut conn),
            )
            .await
            .map_err(persistence_error)?;
            recent.extend(Self::events_by_id(&mut conn, &ids).await?);
        }
        recent.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));

        Ok(online_view(&sessions, &recent))
    }

    async fn update_active_session(&self, session: &ActiveSession) -> Result<()> {
        let mut conn = self.conn().await?;
        let mut row = session.clone();
        if let Some(existing) = Self::session(&mut conn, &session.session_id).await? {
            row.id = existing.id;
        }
        Self::put_sessions(&mut conn, &[row]).await
    }

    async fn deactivate_session(&self, session_id: &str) -> Result<()> {
        let mut conn = self.conn().await?;
        if let Some(mut session) = Self::session(&mut conn, session_id).await? {
            session.is_active = false;
            Self::put_sessions(&mut conn, &[session]).await?;
        }
        Ok(())
    }

    async fn get_active_sessions(&self, user_id: Option<&str>) -> Result<Vec<ActiveSession>> {
        let mut conn = self.conn().await?;
        Ok(Self::all_sessions(&mut conn)
            .await?
            .into_iter()
            .filter(|s| s.is_active && user_id.map_or(true, |id| s.user_id == id))
            .collect())
    }

    async fn store_subscription(&self, subscription: &ConsultantSubscription) -> Result<()> {
        let mut conn = self.conn().await?;
        timed(
            redis::cmd("HSET")
                .arg(SUBSCRIPTIONS_KEY)
                .arg(&subscription.consultant_id)
                .arg(encode(subscription)?)
                .query_async::<()>(&mut conn),
        )
        .await
        .map_err(persistence_error)
    }

    async fn get_consultant_subscriptions(&self, consultant_id: &str) -> Result<Vec<ConsultantSubscription>> {
        let mut conn = self.conn().await?;
        let json: Option<String> = timed(
            redis::cmd("HGET")
                .arg(SUBSCRIPTIONS_KEY)
                .arg(consultant_id)
                .query_async(&mut conn),
        )
        .await
        .map_err(persistence_error)?;

        Ok(json
            .as_deref()
            .and_then(decode::<ConsultantSubscription>)
            .filter(|s| s.is_active)
            .into_iter()
            .collect())
    }

    async fn get_dashboard_stats(&self) -> Result<Vec<DashboardBucket>> {
        let mut conn = self.conn().await?;
        let now = Utc::now();
        let since = now - chrono::Duration::hours(DASHBOARD_WINDOW_HOURS);

        let ids: Vec<String> = timed(
            redis::cmd("ZRANGEBYSCORE")
                .arg(EVENT_INDEX_KEY)
                .arg(since.timestamp_millis())
                .arg("+inf")
                .query_async(&mut conn),
        )
        .await
        .map_err(persistence_error)?;

        let events = Self::events_by_id(&mut conn, &ids).await?;
        Ok(dashboard_buckets(events.iter(), now))
    }

    async fn reap_idle_sessions(&self, max_idle: Duration) -> Result<usize> {
        let mut conn = self.conn().await?;
        let idle_before = cutoff(Utc::now(), max_idle);

        let reaped: Vec<ActiveSession> = Self::all_sessions(&mut conn)
            .await?
            .into_iter()
            .filter(|s| s.is_active && s.last_activity < idle_before)
            .map(|mut s| {
                s.is_active = false;
                s
            })
            .collect();

        Self::put_sessions(&mut conn, &reaped).await?;
        Ok(reaped.len())
    }

    async fn cleanup_old_sessions(&self, retention: Duration) -> Result<CleanupReport> {
        let mut conn = self.conn().await?;
        let horizon = cutoff(Utc::now(), retention);
        let horizon_ms = horizon.timestamp_millis();

        let expired_ids: Vec<String> = timed(
            redis::cmd("ZRANGEBYSCORE")
                .arg(EVENT_INDEX_KEY)
                .arg("-inf")
                .arg(format!("({}", horizon_ms))
                .query_async(&mut conn),
        )
        .await
        .map_err(persistence_error)?;

        let expired_events = Self::events_by_id(&mut conn, &expired_ids).await?;
        let users: HashSet<&str> = expired_events.iter().map(|e| e.user_id.as_str()).collect();

        let stale_sessions: Vec<String> = Self::all_sessions(&mut conn)
            .await?
            .into_iter()
            .filter(|s| !s.is_active && s.last_activity < horizon)
            .map(|s| s.session_id)
            .collect();

        if expired_ids.is_empty() && stale_sessions.is_empty() {
            return Ok(CleanupReport::default());
        }

        let mut pipe = redis::pipe();
        pipe.atomic();
        if !expired_ids.is_empty() {
            pipe.cmd("HDEL").arg(EVENT_BODIES_KEY).arg(&expired_ids).ignore();
            pipe.cmd("ZREMRANGEBYSCORE")
                .arg(EVENT_INDEX_KEY)
                .arg("-inf")
                .arg(format!("({}", horizon_ms))
                .ignore();
            for user_id in users {
                pipe.cmd("ZREMRANGEBYSCORE")
                    .arg(user_index_key(user_id))
                    .arg("-inf")
                    .arg(format!("({}", horizon_ms))
                    .ignore();
            }
        }
        if !stale_sessions.is_empty() {
            pipe.cmd("HDEL").arg(SESSIONS_KEY).arg(&stale_sessions).ignore();
        }

        timed(pipe.query_async::<()>(&mut conn))
            .await
            .map_err(persistence_error)?;

        Ok(CleanupReport {
            events_removed: expired_ids.len(),
            sessions_removed: stale_sessions.len(),
        })
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
