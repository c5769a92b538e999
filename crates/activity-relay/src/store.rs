//! Durable event store trait and in-memory implementation
//!
//! The durable store is the source of truth for history and backfill: an
//! append-only event log, the active-session table, and consultant
//! subscriptions. Write failures must reach the caller.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

use crate::error::Result;
use crate::event::RealtimeEvent;
use crate::session::{
    ActiveSession, CleanupReport, ConsultantSubscription, DashboardBucket, OnlineReader,
};

/// Window covered by dashboard stats
pub const DASHBOARD_WINDOW_HOURS: i64 = 24;

#[async_trait]
pub trait DurableEventStore: Send + Sync + 'static {
    /// Append one event; storing the same id twice is a no-op
    async fn store_event(&self, event: &RealtimeEvent) -> Result<()>;

    /// Newest-first, optionally for one user, at most `limit` events
    async fn get_recent_events(&self, limit: usize, user_id: Option<&str>) -> Result<Vec<RealtimeEvent>>;

    /// Users with an active session, enriched for display, most recent first
    async fn get_online_users(&self) -> Result<Vec<OnlineReader>>;

    /// Upsert keyed by `session_id`
    async fn update_active_session(&self, session: &ActiveSession) -> Result<()>;

    /// Mark a session inactive (disconnect)
    async fn deactivate_session(&self, session_id: &str) -> Result<()>;

    async fn get_active_sessions(&self, user_id: Option<&str>) -> Result<Vec<ActiveSession>>;

    /// Upsert keyed by `consultant_id`
    async fn store_subscription(&self, subscription: &ConsultantSubscription) -> Result<()>;

    /// Active subscriptions of a consultant
    async fn get_consultant_subscriptions(&self, consultant_id: &str) -> Result<Vec<ConsultantSubscription>>;

    /// Hourly per-type counts over the last day, newest hour first
    async fn get_dashboard_stats(&self) -> Result<Vec<DashboardBucket>>;

    /// Mark sessions idle for longer than `max_idle` inactive; returns how many
    async fn reap_idle_sessions(&self, max_idle: Duration) -> Result<usize>;

    /// Purge events and inactive sessions older than `retention`
    async fn cleanup_old_sessions(&self, retention: Duration) -> Result<CleanupReport>;

    /// Check if the store is reachable
    async fn is_available(&self) -> bool;

    /// Release connections held by the store
    async fn close(&self) {}

    /// Return the store name (for logging)
    fn name(&self) -> &'static str;
}

/// Start of the hour containing `ts`
pub fn hour_bucket(ts: DateTime<Utc>) -> DateTime<Utc> {
    let secs = ts.timestamp();
    DateTime::from_timestamp(secs - secs.rem_euclid(3600), 0).unwrap_or(ts)
}

/// `now - duration`, saturating for absurd durations
pub fn cutoff(now: DateTime<Utc>, duration: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(duration)
        .ok()
        .and_then(|d| now.checked_sub_signed(d))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Count events per (hour, type) within the dashboard window
pub fn dashboard_buckets<'a>(
    events: impl IntoIterator<Item = &'a RealtimeEvent>,
    now: DateTime<Utc>,
) -> Vec<DashboardBucket> {
    let since = now - chrono::Duration::hours(DASHBOARD_WINDOW_HOURS);
    let mut counts: BTreeMap<(DateTime<Utc>, String), u64> = BTreeMap::new();
    for event in events.into_iter().filter(|e| e.timestamp >= since) {
        *counts
            .entry((hour_bucket(event.timestamp), event.event_type.to_string()))
            .or_default() += 1;
    }

    let mut buckets: Vec<DashboardBucket> = counts
        .into_iter()
        .map(|((hour, event_type), count)| DashboardBucket {
            hour,
            event_type,
            count,
        })
        .collect();
    buckets.sort_by(|a, b| b.hour.cmp(&a.hour).then_with(|| a.event_type.cmp(&b.event_type)));
    buckets
}

/// Build the online-users view from active sessions and recent events
///
/// `recent` must be newest-first; names come from event metadata and the
/// reading position from the newest event that carries one.
pub fn online_view(sessions: &[ActiveSession], recent: &[RealtimeEvent]) -> Vec<OnlineReader> {
    let mut latest: HashMap<&str, DateTime<Utc>> = HashMap::new();
    for session in sessions.iter().filter(|s| s.is_active) {
        let entry = latest.entry(session.user_id.as_str()).or_insert(session.last_activity);
        if session.last_activity > *entry {
            *entry = session.last_activity;
        }
    }

    let mut readers: Vec<OnlineReader> = latest
        .into_iter()
        .map(|(user_id, last_activity)| {
            let mut reader = OnlineReader::new(user_id, last_activity);
            let user_events = || recent.iter().filter(move |e| e.user_id == user_id);

            if let Some(named) = user_events().find(|e| e.metadata_str("firstName").is_some()) {
                reader.first_name = named.metadata_str("firstName").map(str::to_string);
                reader.last_name = named.metadata_str("lastName").map(str::to_string);
            }
            if let Some(position) = user_events().find_map(|e| e.event_data.reading_position()) {
                reader.current_book = position.book_id;
                reader.current_page = position.page_number;
            }
            reader
        })
        .collect();

    readers.sort_by(|a, b| {
        b.last_activity
            .cmp(&a.last_activity)
            .then_with(|| a.user_id.cmp(&b.user_id))
    });
    readers
}

/// In-memory durable store
///
/// Suitable for development and testing. Not suitable for multi-instance deployments.
#[derive(Clone)]
pub struct MemoryEventStore {
    events: Arc<RwLock<Vec<RealtimeEvent>>>,
    sessions: Arc<DashMap<String, ActiveSession>>,
    subscriptions: Arc<DashMap<String, ConsultantSubscription>>,
    max_events: usize,
}

impl MemoryEventStore {
    /// Create a store keeping at most `max_events` events
    pub fn new(max_events: usize) -> Self {
        Self {
            events: Arc::new(RwLock::new(Vec::new())),
            sessions: Arc::new(DashMap::new()),
            subscriptions: Arc::new(DashMap::new()),
            max_events,
        }
    }

    pub async fn event_count(&self) -> usize {
        self.events.read().await.len()
    }

    async fn newest_first(&self) -> Vec<RealtimeEvent> {
        // Reversed first so equal timestamps keep newest-inserted first
        let mut events: Vec<RealtimeEvent> = self.events.read().await.iter().rev().cloned().collect();
        events.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        events
    }
}

impl Default for MemoryEventStore {
    fn default() -> Self {
        Self::new(10_000)
    }
}

#[async_trait]
impl DurableEventStore for MemoryEventStore {
    async fn store_event(&self, event: &RealtimeEvent) -> Result<()> {
        let mut events = self.events.write().await;
        if events.iter().any(|e| e.id == event.id) {
            return Ok(());
        }
        events.push(event.clone());

        // Trim old events
        if events.len() > self.max_events {
            let excess = events.len() - self.max_events;
            events.drain(0..excess);
        }
        Ok(())
    }

    async fn get_recent_events(&self, limit: usize, user_id: Option<&str>) -> Result<Vec<RealtimeEvent>> {
        Ok(self
            .newest_first()
            .await
            .into_iter()
            .filter(|e| user_id.map_or(true, |id| e.user_id == id))
            .take(limit)
            .collect())
    }

    async fn get_online_users(&self) -> Result<Vec<OnlineReader>> {
        let sessions: Vec<ActiveSession> = self.sessions.iter().map(|s| s.value().clone()).collect();
        let recent = self.newest_first().await;
        Ok(online_view(&sessions, &recent))
    }

    async fn update_active_session(&self, session: &ActiveSession) -> Result<()> {
        self.sessions
            .entry(session.session_id.clone())
            .and_modify(|existing| {
                existing.last_activity = session.last_activity;
                existing.is_active = session.is_active;
                existing.device_info = session.device_info.clone();
                existing.ip_address = session.ip_address.clone();
            })
            .or_insert_with(|| session.clone());
        Ok(())
    }

    async fn deactivate_session(&self, session_id: &str) -> Result<()> {
        if let Some(mut session) = self.sessions.get_mut(session_id) {
            session.is_active = false;
        }
        Ok(())
    }

    async fn get_active_sessions(&self, user_id: Option<&str>) -> Result<Vec<ActiveSession>> {
        Ok(self
            .sessions
            .iter()
            .filter(|s| s.is_active && user_id.map_or(true, |id| s.user_id == id))
            .map(|s| s.value().clone())
            .collect())
    }

    async fn store_subscription(&self, subscription: &ConsultantSubscription) -> Result<()> {
        self.subscriptions
            .insert(subscription.consultant_id.clone(), subscription.clone());
        Ok(())
    }

    async fn get_consultant_subscriptions(&self, consultant_id: &str) -> Result<Vec<ConsultantSubscription>> {
        Ok(self
            .subscriptions
            .get(consultant_id)
            .filter(|s| s.is_active)
            .map(|s| vec![s.value().clone()])
            .unwrap_or_default())
    }

    async fn get_dashboard_stats(&self) -> Result<Vec<DashboardBucket>> {
        let events = self.events.read().await;
        Ok(dashboard_buckets(events.iter(), Utc::now()))
    }

    async fn reap_idle_sessions(&self, max_idle: Duration) -> Result<usize> {
        let idle_before = cutoff(Utc::now(), max_idle);
        let mut reaped = 0;
        for mut session in self.sessions.iter_mut() {
            if session.is_active && session.last_activity < idle_before {
                session.is_active = false;
                reaped += 1;
            }
        }
        Ok(reaped)
    }

    async fn cleanup_old_sessions(&self, retention: Duration) -> Result<CleanupReport> {
        let horizon = cutoff(Utc::now(), retention);

        let events_removed = {
            let mut events = self.events.write().await;
            let before = events.len();
            events.retain(|e| e.timestamp >= horizon);
            before - events.len()
        };

        let stale: HashSet<String> = self
            .sessions
            .iter()
            .filter(|s| !s.is_active && s.last_activity < horizon)
            .map(|s| s.key().clone())
            .collect();
        for session_id in &stale {
            self.sessions.remove(session_id);
        }

        Ok(CleanupReport {
            events_removed,
            sessions_removed: stale.len(),
        })
    }

    async fn is_available(&self) -> bool {
        true
    }

    fn name(&self) -> &'static str {
        "Memory"
    }
}
