//! Reader activity events
//!
//! Event kinds the reading apps emit are modeled as a closed set of known
//! tags plus [`EventType::Other`]. Payloads follow the same split: each known
//! kind has a typed shape, and anything that does not fit lands in
//! [`EventPayload::Opaque`] untouched.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use std::fmt;

/// Event kind tag (e.g. `LOGIN`, `PAGE_SYNC`)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EventType {
    Login,
    Logout,
    PageSync,
    SectionSync,
    DefinitionLookup,
    AiQuery,
    HelpRequest,
    FeedbackSubmission,
    QuizAttempt,
    NoteCreated,
    /// Any tag this build does not know about
    Other(String),
}

impl EventType {
    pub fn parse(tag: &str) -> Self {
        match tag {
            "LOGIN" => EventType::Login,
            "LOGOUT" => EventType::Logout,
            "PAGE_SYNC" => EventType::PageSync,
            "SECTION_SYNC" => EventType::SectionSync,
            "DEFINITION_LOOKUP" => EventType::DefinitionLookup,
            "AI_QUERY" => EventType::AiQuery,
            "HELP_REQUEST" => EventType::HelpRequest,
            "FEEDBACK_SUBMISSION" => EventType::FeedbackSubmission,
            "QUIZ_ATTEMPT" => EventType::QuizAttempt,
            "NOTE_CREATED" => EventType::NoteCreated,
            other => EventType::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            EventType::Login => "LOGIN",
            EventType::Logout => "LOGOUT",
            EventType::PageSync => "PAGE_SYNC",
            EventType::SectionSync => "SECTION_SYNC",
            EventType::DefinitionLookup => "DEFINITION_LOOKUP",
            EventType::AiQuery => "AI_QUERY",
            EventType::HelpRequest => "HELP_REQUEST",
            EventType::FeedbackSubmission => "FEEDBACK_SUBMISSION",
            EventType::QuizAttempt => "QUIZ_ATTEMPT",
            EventType::NoteCreated => "NOTE_CREATED",
            EventType::Other(tag) => tag,
        }
    }

    /// LOGIN and LOGOUT change presence and trigger a snapshot
    pub fn is_presence_change(&self) -> bool {
        matches!(self, EventType::Login | EventType::Logout)
    }

    /// Help requests and feedback also go to the support room
    pub fn routes_to_support(&self) -> bool {
        let tag = self.as_str();
        tag.contains("HELP_REQUEST") || tag.contains("FEEDBACK")
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&str> for EventType {
    fn from(tag: &str) -> Self {
        EventType::parse(tag)
    }
}

impl From<String> for EventType {
    fn from(tag: String) -> Self {
        EventType::parse(&tag)
    }
}

impl Serialize for EventType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for EventType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let tag = String::deserialize(deserializer)?;
        Ok(EventType::parse(&tag))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogoutData {
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageSyncData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub book_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_number: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub section: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SectionSyncData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub book_id: Option<String>,
    pub section: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DefinitionLookupData {
    pub word: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub definition: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AiQueryData {
    pub query: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HelpRequestData {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedbackData {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rating: Option<f64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuizAttemptData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub book_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quiz_id: Option<String>,
    pub score: f64,
    pub total: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub percentage: Option<f64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NoteCreatedData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub book_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_number: Option<u32>,
    pub content: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Event payload, typed for known kinds
///
/// Serializes to the same JSON object the client sent. Fields the typed
/// shapes do not name are kept in their `extra` map.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum EventPayload {
    Login(LoginData),
    Logout(LogoutData),
    PageSync(PageSyncData),
    SectionSync(SectionSyncData),
    DefinitionLookup(DefinitionLookupData),
    AiQuery(AiQueryData),
    HelpRequest(HelpRequestData),
    Feedback(FeedbackData),
    QuizAttempt(QuizAttemptData),
    NoteCreated(NoteCreatedData),
    /// Unknown kind, or a known kind whose data did not match its shape
    Opaque(Map<String, Value>),
}

/// Book/page a reader was last seen on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadingPosition {
    pub book_id: Option<String>,
    pub page_number: Option<u32>,
}

impl EventPayload {
    /// Interpret raw client data for the given kind
    ///
    /// `null` becomes an empty map; a bare scalar is wrapped as `{"value": ..}`.
    pub fn from_value(event_type: &EventType, data: Value) -> Self {
        let map = match data {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                let mut map = Map::new();
                map.insert("value".to_string(), other);
                map
            }
        };
        let value = Value::Object(map);

        let typed = match event_type {
            EventType::Login => parse_as(&value).map(EventPayload::Login),
            EventType::Logout => parse_as(&value).map(EventPayload::Logout),
            EventType::PageSync => parse_as(&value).map(EventPayload::PageSync),
            EventType::SectionSync => parse_as(&value).map(EventPayload::SectionSync),
            EventType::DefinitionLookup => parse_as(&value).map(EventPayload::DefinitionLookup),
            EventType::AiQuery => parse_as(&value).map(EventPayload::AiQuery),
            EventType::HelpRequest => parse_as(&value).map(EventPayload::HelpRequest),
            EventType::FeedbackSubmission => parse_as(&value).map(EventPayload::Feedback),
            EventType::QuizAttempt => parse_as(&value).map(EventPayload::QuizAttempt),
            EventType::NoteCreated => parse_as(&value).map(EventPayload::NoteCreated),
            EventType::Other(_) => None,
        };

        match (typed, value) {
            (Some(payload), _) => payload,
            (None, Value::Object(map)) => EventPayload::Opaque(map),
            (None, _) => EventPayload::Opaque(Map::new()),
        }
    }

    /// JSON form of the payload
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or_default()
    }

    pub fn is_opaque(&self) -> bool {
        matches!(self, EventPayload::Opaque(_))
    }

    pub fn reading_position(&self) -> Option<ReadingPosition> {
        match self {
            EventPayload::PageSync(data) => Some(ReadingPosition {
                book_id: data.book_id.clone(),
                page_number: data.page_number,
            }),
            EventPayload::SectionSync(data) => Some(ReadingPosition {
                book_id: data.book_id.clone(),
                page_number: None,
            }),
            EventPayload::NoteCreated(data) => Some(ReadingPosition {
                book_id: data.book_id.clone(),
                page_number: data.page_number,
            }),
            _ => None,
        }
    }
}

fn parse_as<T: DeserializeOwned>(value: &Value) -> Option<T> {
    T::deserialize(value).ok()
}

/// One reader activity, immutable once created
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", from = "EventRecord")]
pub struct RealtimeEvent {
    pub id: String,
    pub user_id: String,
    pub event_type: EventType,
    pub event_data: EventPayload,
    pub timestamp: DateTime<Utc>,
    pub session_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Map<String, Value>>,
}

/// Stored/wire form; the payload is typed against its event kind on read
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct EventRecord {
    id: String,
    user_id: String,
    event_type: EventType,
    #[serde(default)]
    event_data: Value,
    timestamp: DateTime<Utc>,
    session_id: String,
    #[serde(default)]
    metadata: Option<Map<String, Value>>,
}

impl From<EventRecord> for RealtimeEvent {
    fn from(record: EventRecord) -> Self {
        let event_data = EventPayload::from_value(&record.event_type, record.event_data);
        Self {
            id: record.id,
            user_id: record.user_id,
            event_type: record.event_type,
            event_data,
            timestamp: record.timestamp,
            session_id: record.session_id,
            metadata: record.metadata,
        }
    }
}

impl RealtimeEvent {
    /// Create a new event with a fresh id and the current time
    pub fn new(
        user_id: impl Into<String>,
        event_type: impl Into<EventType>,
        data: Value,
        session_id: impl Into<String>,
    ) -> Self {
        let event_type = event_type.into();
        let event_data = EventPayload::from_value(&event_type, data);
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.into(),
            event_type,
            event_data,
            timestamp: Utc::now(),
            session_id: session_id.into(),
            metadata: None,
        }
    }

    pub fn with_metadata(mut self, metadata: Map<String, Value>) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// String field from metadata, if present
    pub fn metadata_str(&self, key: &str) -> Option<&str> {
        self.metadata.as_ref()?.get(key)?.as_str()
    }
}

/// Normalized payload delivered as `reader-activity`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityPayload {
    pub user_id: String,
    pub event_type: EventType,
    pub data: Value,
    pub timestamp: DateTime<Utc>,
}

impl From<&RealtimeEvent> for ActivityPayload {
    fn from(event: &RealtimeEvent) -> Self {
        Self {
            user_id: event.user_id.clone(),
            event_type: event.event_type.clone(),
            data: event.event_data.to_value(),
            timestamp: event.timestamp,
        }
    }
}
