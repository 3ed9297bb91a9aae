//! SQLite-backed users, conversation membership and chat messages.
//!
//! Reference implementation of the collaborator traits the registry consumes.
//! Deployments embedding herald into a larger application can plug their own
//! stores in instead.

use async_trait::async_trait;
use chrono::{SubsecRound, Utc};
use rusqlite::OptionalExtension;
use tracing::{debug, instrument};

use herald_core::directory::{
    ConversationDirectory, DirectoryError, Message, MessageStore, NewMessage, UserProfile,
};
use herald_core::ids::{ConversationId, MessageId, UserId};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

/// Longest chat message accepted, in characters.
pub const MAX_MESSAGE_CHARS: usize = 500;

#[derive(Clone)]
pub struct SqliteDirectory {
    db: Database,
}

impl SqliteDirectory {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    #[instrument(skip(self), fields(user_id = %id))]
    pub fn create_user(
        &self,
        id: &UserId,
        username: &str,
        profile_picture_url: Option<&str>,
    ) -> Result<UserProfile, StoreError> {
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO users (id, username, profile_picture_url, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![
                    id.as_str(),
                    username,
                    profile_picture_url,
                    row_helpers::format_timestamp(&Utc::now()),
                ],
            )?;
            Ok(UserProfile {
                id: id.clone(),
                username: username.to_owned(),
                profile_picture_url: profile_picture_url.map(str::to_owned),
            })
        })
    }

    /// Add a user to a conversation. Adding an existing participant is a no-op.
    #[instrument(skip(self), fields(conversation_id = %conversation_id, user_id = %user_id))]
    pub fn add_participant(
        &self,
        conversation_id: &ConversationId,
        user_id: &UserId,
    ) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT OR IGNORE INTO conversation_participants (conversation_id, user_id, joined_at)
                 VALUES (?1, ?2, ?3)",
                rusqlite::params![
                    conversation_id.as_str(),
                    user_id.as_str(),
                    row_helpers::format_timestamp(&Utc::now()),
                ],
            )?;
            Ok(())
        })
    }

    pub fn remove_participant(
        &self,
        conversation_id: &ConversationId,
        user_id: &UserId,
    ) -> Result<bool, StoreError> {
        self.db.with_conn(|conn| {
            let changed = conn.execute(
                "DELETE FROM conversation_participants WHERE conversation_id = ?1 AND user_id = ?2",
                [conversation_id.as_str(), user_id.as_str()],
            )?;
            Ok(changed > 0)
        })
    }

    /// Messages in a conversation, oldest first.
    pub fn list_messages(
        &self,
        conversation_id: &ConversationId,
        limit: u32,
    ) -> Result<Vec<Message>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT m.id, m.conversation_id, m.sender_id, m.content, m.server_timestamp,
                        u.username, u.profile_picture_url
                 FROM messages m LEFT JOIN users u ON u.id = m.sender_id
                 WHERE m.conversation_id = ?1
                 ORDER BY m.server_timestamp ASC, m.id ASC
                 LIMIT ?2",
            )?;
            let mut rows = stmt.query(rusqlite::params![conversation_id.as_str(), limit])?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                out.push(row_to_message(row)?);
            }
            Ok(out)
        })
    }

    fn participants(&self, conversation_id: &ConversationId) -> Result<Vec<UserId>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT user_id FROM conversation_participants
                 WHERE conversation_id = ?1 ORDER BY joined_at ASC, user_id ASC",
            )?;
            let ids = stmt
                .query_map([conversation_id.as_str()], |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(ids.into_iter().map(UserId::from_raw).collect())
        })
    }

    fn insert_message(&self, message: NewMessage) -> Result<Message, StoreError> {
        let id = MessageId::new();
        let server_timestamp = Utc::now().trunc_subsecs(6);
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO messages (id, conversation_id, sender_id, content, server_timestamp)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                rusqlite::params![
                    id.as_str(),
                    message.conversation_id.as_str(),
                    message.sender_id.as_str(),
                    message.content,
                    row_helpers::format_timestamp(&server_timestamp),
                ],
            )?;
            let sender = load_profile(conn, &message.sender_id)?;
            Ok(Message {
                id,
                conversation_id: message.conversation_id,
                sender_id: message.sender_id,
                content: message.content,
                server_timestamp,
                sender,
            })
        })
    }
}

fn load_profile(
    conn: &rusqlite::Connection,
    id: &UserId,
) -> Result<Option<UserProfile>, StoreError> {
    let row: Option<(String, Option<String>)> = conn
        .query_row(
            "SELECT username, profile_picture_url FROM users WHERE id = ?1",
            [id.as_str()],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;
    Ok(row.map(|(username, profile_picture_url)| UserProfile {
        id: id.clone(),
        username,
        profile_picture_url,
    }))
}

fn row_to_message(row: &rusqlite::Row<'_>) -> Result<Message, StoreError> {
    let sender_id = UserId::from_raw(row_helpers::get::<String>(row, 2, "messages", "sender_id")?);
    let timestamp: String = row_helpers::get(row, 4, "messages", "server_timestamp")?;
    let username: Option<String> = row_helpers::get(row, 5, "users", "username")?;
    let profile_picture_url: Option<String> =
        row_helpers::get(row, 6, "users", "profile_picture_url")?;

    Ok(Message {
        id: MessageId::from_raw(row_helpers::get::<String>(row, 0, "messages", "id")?),
        conversation_id: ConversationId::from_raw(row_helpers::get::<String>(
            row,
            1,
            "messages",
            "conversation_id",
        )?),
        content: row_helpers::get(row, 3, "messages", "content")?,
        server_timestamp: row_helpers::parse_timestamp(&timestamp, "messages", "server_timestamp")?,
        sender: username.map(|username| UserProfile {
            id: sender_id.clone(),
            username,
            profile_picture_url,
        }),
        sender_id,
    })
}

fn backend(err: StoreError) -> DirectoryError {
    DirectoryError::Backend(err.to_string())
}

#[async_trait]
impl ConversationDirectory for SqliteDirectory {
    async fn participant_ids(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<Vec<UserId>, DirectoryError> {
        let ids = self.participants(conversation_id).map_err(backend)?;
        if ids.is_empty() {
            return Err(DirectoryError::NotFound(format!(
                "conversation {conversation_id}"
            )));
        }
        Ok(ids)
    }
}

#[async_trait]
impl MessageStore for SqliteDirectory {
    async fn save_message(&self, message: NewMessage) -> Result<Message, DirectoryError> {
        let chars = message.content.chars().count();
        if chars > MAX_MESSAGE_CHARS {
            return Err(DirectoryError::Rejected(format!(
                "message is {chars} characters, limit is {MAX_MESSAGE_CHARS}"
            )));
        }
        if message.content.trim().is_empty() {
            return Err(DirectoryError::Rejected("message is empty".into()));
        }
        let saved = self.insert_message(message).map_err(backend)?;
        debug!(message_id = %saved.id, conversation_id = %saved.conversation_id, "message saved");
        Ok(saved)
    }
}
