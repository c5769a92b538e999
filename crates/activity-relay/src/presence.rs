//! Presence store: who is online, and when they were last seen
//!
//! Implementations are expected to be shared across relay instances so every
//! consultant sees the same picture. There is no TTL on the online flag: a
//! user stays online until LOGOUT or a clean disconnect clears it.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::{DashMap, DashSet};
use std::sync::Arc;

use crate::error::Result;

#[async_trait]
pub trait PresenceStore: Send + Sync + 'static {
    /// Set or clear the online flag; going online also refreshes last-seen
    async fn set_user_online(&self, user_id: &str, online: bool) -> Result<()>;

    /// All users currently flagged online
    async fn get_online_users(&self) -> Result<Vec<String>>;

    /// Last time the user went online, if ever
    async fn get_user_last_seen(&self, user_id: &str) -> Result<Option<DateTime<Utc>>>;

    /// Check if the store is reachable
    async fn is_available(&self) -> bool;

    /// Release connections held by the store
    async fn close(&self) {}

    /// Return the store name (for logging)
    fn name(&self) -> &'static str;
}

/// In-memory presence store
///
/// Suitable for development and testing. Not suitable for multi-instance deployments.
#[derive(Clone, Default)]
pub struct MemoryPresenceStore {
    online: Arc<DashSet<String>>,
    last_seen: Arc<DashMap<String, DateTime<Utc>>>,
}

impl MemoryPresenceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_online(&self, user_id: &str) -> bool {
        self.online.contains(user_id)
    }
}

#[async_trait]
impl PresenceStore for MemoryPresenceStore {
    async fn set_user_online(&self, user_id: &str, online: bool) -> Result<()> {
        if online {
            self.online.insert(user_id.to_string());
            self.last_seen.insert(user_id.to_string(), Utc::now());
        } else {
            self.online.remove(user_id);
        }
        Ok(())
    }

    async fn get_online_users(&self) -> Result<Vec<String>> {
        let mut users: Vec<String> = self.online.iter().map(|u| u.key().clone()).collect();
        users.sort();
        Ok(users)
    }

    async fn get_user_last_seen(&self, user_id: &str) -> Result<Option<DateTime<Utc>>> {
        Ok(self.last_seen.get(user_id).map(|t| *t))
    }

    async fn is_available(&self) -> bool {
        true
    }

    fn name(&self) -> &'static str {
        "Memory"
    }
}
