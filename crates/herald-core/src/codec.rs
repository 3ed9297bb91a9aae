//! Inbound frame codec.
//!
//! Parses one client frame (`{"type": ..., "payload": ...}`) and classifies it
//! into an [`InboundCommand`] carrying the canonical [`EventType`] plus the
//! identifiers the registry needs to resolve recipients. Anything that fails
//! here never reaches the registry.

use serde::Deserialize;

use crate::events::EventType;
use crate::ids::{ConversationId, UserId};

/// Payload field naming the invited player of a `game_invite`.
pub const GAME_INVITE_TARGET: &str = "player2_id";
/// Payload field naming the addressee of a `friend_request`.
pub const FRIEND_REQUEST_TARGET: &str = "recipient_id";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed frame: {0}")]
    Malformed(String),

    #[error("unrecognized frame type: {0}")]
    UnknownType(String),
}

/// Raw envelope as sent by clients.
#[derive(Debug, Clone, Deserialize)]
pub struct InboundFrame {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

/// Frame tags accepted from clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundType {
    SendMessage,
    FriendRequest,
    GameInvite,
    /// Any other known event tag; routed back to the originating user.
    Passthrough(EventType),
}

impl std::str::FromStr for InboundType {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "send_message" => Ok(Self::SendMessage),
            "friend_request" => Ok(Self::FriendRequest),
            "game_invite" => Ok(Self::GameInvite),
            other => match other.parse::<EventType>() {
                // Messages must go through send_message so they get enriched.
                Ok(EventType::NewMessage) | Err(_) => {
                    Err(ProtocolError::UnknownType(other.to_string()))
                }
                Ok(t) => Ok(Self::Passthrough(t)),
            },
        }
    }
}

/// Body of a `send_message` frame.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SendMessage {
    pub conversation_id: ConversationId,
    pub content: String,
}

/// A classified inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundCommand {
    /// Chat message for every participant of a conversation.
    SendMessage(SendMessage),
    /// Event for one explicitly named user.
    Direct {
        event_type: EventType,
        recipient: UserId,
        payload: serde_json::Value,
    },
    /// Event with no recipient rule; delivered to the sender only.
    Originator {
        event_type: EventType,
        payload: serde_json::Value,
    },
}

impl InboundCommand {
    pub fn event_type(&self) -> EventType {
        match self {
            Self::SendMessage(_) => EventType::NewMessage,
            Self::Direct { event_type, .. } | Self::Originator { event_type, .. } => *event_type,
        }
    }
}

/// Parse and classify a raw text frame.
pub fn decode(raw: &str) -> Result<InboundCommand, ProtocolError> {
    let frame: InboundFrame =
        serde_json::from_str(raw).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
    classify(frame)
}

/// Classify an already-parsed envelope.
pub fn classify(frame: InboundFrame) -> Result<InboundCommand, ProtocolError> {
    let kind: InboundType = frame.kind.parse()?;
    match kind {
        InboundType::SendMessage => {
            let msg: SendMessage = serde_json::from_value(frame.payload)
                .map_err(|e| ProtocolError::Malformed(format!("send_message: {e}")))?;
            if msg.conversation_id.is_empty() {
                return Err(ProtocolError::Malformed(
                    "send_message: empty conversation_id".into(),
                ));
            }
            if msg.content.trim().is_empty() {
                return Err(ProtocolError::Malformed("send_message: empty content".into()));
            }
            Ok(InboundCommand::SendMessage(msg))
        }
        InboundType::FriendRequest => {
            direct(EventType::FriendRequest, FRIEND_REQUEST_TARGET, frame.payload)
        }
        InboundType::GameInvite => direct(EventType::GameInvite, GAME_INVITE_TARGET, frame.payload),
        InboundType::Passthrough(event_type) => Ok(InboundCommand::Originator {
            event_type,
            payload: frame.payload,
        }),
    }
}

fn direct(
    event_type: EventType,
    field: &str,
    payload: serde_json::Value,
) -> Result<InboundCommand, ProtocolError> {
    let recipient = payload
        .get(field)
        .and_then(|v| v.as_str())
        .map(UserId::from_raw)
        .filter(|id| !id.is_empty())
        .ok_or_else(|| ProtocolError::Malformed(format!("{event_type}: missing {field}")))?;
    Ok(InboundCommand::Direct {
        event_type,
        recipient,
        payload,
    })
}
