//! Session, subscription and presence records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    Desktop,
    Mobile,
    Tablet,
}

/// Client device as reported at handshake
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub browser: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_type: Option<DeviceType>,
}

impl DeviceInfo {
    /// Best-effort classification from a User-Agent header
    pub fn from_user_agent(user_agent: Option<&str>) -> Self {
        let device_type = user_agent.map(|ua| {
            if ua.contains("iPad") || ua.contains("Tablet") {
                DeviceType::Tablet
            } else if ua.contains("Mobile") || ua.contains("Android") {
                DeviceType::Mobile
            } else {
                DeviceType::Desktop
            }
        });

        let browser = user_agent.and_then(|ua| {
            ["Edg", "Firefox", "Chrome", "Safari"]
                .into_iter()
                .find(|name| ua.contains(name))
                .map(|name| if name == "Edg" { "Edge" } else { name }.to_string())
        });

        Self {
            user_agent: user_agent.map(str::to_string),
            platform: Some("web".to_string()),
            browser,
            version: None,
            device_type,
        }
    }
}

/// A connection's activity row, upserted by `session_id`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveSession {
    pub id: String,
    pub user_id: String,
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_info: Option<DeviceInfo>,
    pub last_activity: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,
    pub is_active: bool,
}

impl ActiveSession {
    pub fn new(user_id: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.into(),
            session_id: session_id.into(),
            device_info: None,
            last_activity: Utc::now(),
            ip_address: None,
            is_active: true,
        }
    }

    pub fn with_device(mut self, device_info: DeviceInfo) -> Self {
        self.device_info = Some(device_info);
        self
    }

    pub fn with_ip(mut self, ip_address: Option<String>) -> Self {
        self.ip_address = ip_address;
        self
    }
}

/// Topic-level interest of a consultant
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsultantSubscription {
    pub consultant_id: String,
    pub event_types: BTreeSet<String>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

impl ConsultantSubscription {
    pub fn new(consultant_id: impl Into<String>, event_types: impl IntoIterator<Item = String>) -> Self {
        Self {
            consultant_id: consultant_id.into(),
            event_types: event_types.into_iter().collect(),
            is_active: true,
            created_at: Utc::now(),
        }
    }
}

/// One entry of the `online-readers` snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OnlineReader {
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_name: Option<String>,
    pub last_activity: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_book: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_page: Option<u32>,
}

impl OnlineReader {
    pub fn new(user_id: impl Into<String>, last_activity: DateTime<Utc>) -> Self {
        Self {
            user_id: user_id.into(),
            first_name: None,
            last_name: None,
            last_activity,
            current_book: None,
            current_page: None,
        }
    }
}

/// Payload of `online-readers`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OnlineReadersSnapshot {
    pub count: usize,
    pub readers: Vec<OnlineReader>,
}

impl OnlineReadersSnapshot {
    pub fn new(readers: Vec<OnlineReader>) -> Self {
        Self {
            count: readers.len(),
            readers,
        }
    }
}

/// Hourly event count for the consultant dashboard
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DashboardBucket {
    pub hour: DateTime<Utc>,
    pub event_type: String,
    pub count: u64,
}

/// Rows removed by a retention pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupReport {
    pub events_removed: usize,
    pub sessions_removed: usize,
}
