use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{EventId, UserId};

/// Canonical event type tags, as persisted in the event log and sent on the wire.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    NewMessage,
    FriendRequest,
    FriendAccepted,
    GameInvite,
    GameUpdate,
    GroupCreated,
    GroupJoined,
    GroupLeft,
    ConversationDeleted,
}

impl EventType {
    pub const ALL: [EventType; 9] = [
        Self::NewMessage,
        Self::FriendRequest,
        Self::FriendAccepted,
        Self::GameInvite,
        Self::GameUpdate,
        Self::GroupCreated,
        Self::GroupJoined,
        Self::GroupLeft,
        Self::ConversationDeleted,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NewMessage => "new_message",
            Self::FriendRequest => "friend_request",
            Self::FriendAccepted => "friend_accepted",
            Self::GameInvite => "game_invite",
            Self::GameUpdate => "game_update",
            Self::GroupCreated => "group_created",
            Self::GroupJoined => "group_joined",
            Self::GroupLeft => "group_left",
            Self::ConversationDeleted => "conversation_deleted",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EventType {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| format!("unknown event type: {s}"))
    }
}

/// One durable occurrence addressed to one user.
///
/// Events are created only by the event log, which assigns `id`,
/// `server_timestamp` and `sequence`. Within a user's stream `sequence` is
/// strictly increasing and `server_timestamp` never decreases, so ordering by
/// `(server_timestamp, sequence)` is stable across reads.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,
    pub user_id: UserId,
    pub event_type: EventType,
    pub payload: serde_json::Value,
    pub server_timestamp: DateTime<Utc>,
    pub sequence: i64,
}

/// Envelope pushed to live connections: `{"type": ..., "payload": ...}`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OutboundFrame {
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub payload: serde_json::Value,
}

impl OutboundFrame {
    pub fn new(event_type: EventType, payload: serde_json::Value) -> Self {
        Self { event_type, payload }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
