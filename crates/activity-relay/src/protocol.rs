//! Connection-level message protocol
//!
//! Every frame is a JSON envelope `{"event": "<name>", "data": <payload>}`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Error;
use crate::event::{ActivityPayload, RealtimeEvent};
use crate::session::OnlineReadersSnapshot;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReaderEventRequest {
    pub event_type: String,
    #[serde(default)]
    pub data: Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscribeRequest {
    pub consultant_id: String,
    #[serde(default)]
    pub event_types: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnsubscribeRequest {
    pub consultant_id: String,
    /// Topics to drop; `None` leaves the whole `consultants` room
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_types: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecentEventsRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomRequest {
    pub room: String,
}

/// Messages sent from client to server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ClientMessage {
    ReaderEvent(ReaderEventRequest),
    SubscribeConsultant(SubscribeRequest),
    UnsubscribeConsultant(UnsubscribeRequest),
    GetOnlineReaders,
    GetRecentEvents(RecentEventsRequest),
    JoinRoom(RoomRequest),
    LeaveRoom(RoomRequest),
}

impl ClientMessage {
    pub fn parse(text: &str) -> crate::Result<Self> {
        serde_json::from_str(text).map_err(|e| Error::InvalidMessage(e.to_string()))
    }

    /// Message name as it appears on the wire
    pub fn name(&self) -> &'static str {
        match self {
            ClientMessage::ReaderEvent(_) => "reader-event",
            ClientMessage::SubscribeConsultant(_) => "subscribe-consultant",
            ClientMessage::UnsubscribeConsultant(_) => "unsubscribe-consultant",
            ClientMessage::GetOnlineReaders => "get-online-readers",
            ClientMessage::GetRecentEvents(_) => "get-recent-events",
            ClientMessage::JoinRoom(_) => "join-room",
            ClientMessage::LeaveRoom(_) => "leave-room",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecentEventsPayload {
    pub events: Vec<RealtimeEvent>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionAck {
    pub message: String,
    pub event_types: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventReceivedAck {
    pub message: String,
    pub event_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomAck {
    pub room: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatPayload {
    pub ts: i64,
}

/// Messages sent from server to client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ServerMessage {
    ReaderActivity(ActivityPayload),
    OnlineReaders(OnlineReadersSnapshot),
    RecentEvents(RecentEventsPayload),
    EventError(ErrorPayload),
    SubscribeConsultantSuccess(SubscriptionAck),
    UnsubscribeConsultantSuccess(SubscriptionAck),
    ReaderEventReceived(EventReceivedAck),
    RoomJoined(RoomAck),
    RoomLeft(RoomAck),
    Heartbeat(HeartbeatPayload),
}

impl ServerMessage {
    pub fn name(&self) -> &'static str {
        match self {
            ServerMessage::ReaderActivity(_) => "reader-activity",
            ServerMessage::OnlineReaders(_) => "online-readers",
            ServerMessage::RecentEvents(_) => "recent-events",
            ServerMessage::EventError(_) => "event-error",
            ServerMessage::SubscribeConsultantSuccess(_) => "subscribe-consultant-success",
            ServerMessage::UnsubscribeConsultantSuccess(_) => "unsubscribe-consultant-success",
            ServerMessage::ReaderEventReceived(_) => "reader-event-received",
            ServerMessage::RoomJoined(_) => "room-joined",
            ServerMessage::RoomLeft(_) => "room-left",
            ServerMessage::Heartbeat(_) => "heartbeat",
        }
    }

    /// `event-error` carrying the error's message and code
    pub fn error(error: &Error) -> Self {
        ServerMessage::EventError(ErrorPayload {
            message: error.to_string(),
            code: Some(error.code().to_string()),
        })
    }

    pub fn heartbeat(ts: i64) -> Self {
        ServerMessage::Heartbeat(HeartbeatPayload { ts })
    }

    pub fn to_json(&self) -> crate::Result<String> {
        serde_json::to_string(self).map_err(|e| Error::Internal(e.into()))
    }
}
