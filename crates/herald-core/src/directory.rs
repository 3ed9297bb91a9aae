//! Contracts for the domain collaborators the delivery core consumes.
//!
//! Conversations, users and messages live in repository-style stores owned by
//! the surrounding application. The registry only needs two things from them:
//! who takes part in a conversation, and a way to persist a chat message and
//! get it back with the sender's profile attached.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{ConversationId, MessageId, UserId};

#[derive(Debug, Clone, thiserror::Error)]
pub enum DirectoryError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("rejected: {0}")]
    Rejected(String),

    #[error("backend error: {0}")]
    Backend(String),
}

/// Public profile attached to enriched payloads.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: UserId,
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile_picture_url: Option<String>,
}

/// A chat message before it is stored.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NewMessage {
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub content: String,
}

/// A stored chat message.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub content: String,
    pub server_timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<UserProfile>,
}

#[async_trait]
pub trait ConversationDirectory: Send + Sync {
    /// Current participants of a conversation.
    async fn participant_ids(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<Vec<UserId>, DirectoryError>;
}

#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Persist a message; the returned copy carries the sender profile when
    /// it could be resolved.
    async fn save_message(&self, message: NewMessage) -> Result<Message, DirectoryError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_omits_missing_sender() {
        let msg = Message {
            id: MessageId::from_raw("m1"),
            conversation_id: ConversationId::from_raw("c1"),
            sender_id: UserId::from_raw("u1"),
            content: "hello".into(),
            server_timestamp: Utc::now(),
            sender: None,
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert!(value.get("sender").is_none());
        assert_eq!(value["conversation_id"], "c1");
    }

    #[test]
    fn message_includes_sender_profile() {
        let msg = Message {
            id: MessageId::from_raw("m1"),
            conversation_id: ConversationId::from_raw("c1"),
            sender_id: UserId::from_raw("u1"),
            content: "hello".into(),
            server_timestamp: Utc::now(),
            sender: Some(UserProfile {
                id: UserId::from_raw("u1"),
                username: "alice".into(),
                profile_picture_url: None,
            }),
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["sender"]["username"], "alice");
        assert!(value["sender"].get("profile_picture_url").is_none());

        let back: Message = serde_json::from_value(value).unwrap();
        assert_eq!(back, msg);
    }
}
