use chrono::{SubsecRound, Utc};
use rusqlite::OptionalExtension;
use tracing::instrument;

use herald_core::ids::{EventId, UserId};
use herald_core::{Event, EventType};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

const EVENT_COLUMNS: &str = "id, user_id, event_type, payload, server_timestamp, sequence";

/// Append-only, per-user ordered event history.
///
/// This is the only source of truth for catch-up. Each user's stream is
/// ordered by a dense `sequence` assigned at append time; `server_timestamp`
/// is clamped so it never goes backwards within a stream, which keeps
/// `(server_timestamp, sequence)` and `sequence` in agreement.
#[derive(Clone)]
pub struct EventLog {
    db: Database,
}

impl EventLog {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Append one event to a user's stream. The id, timestamp and sequence are
    /// assigned here; the row becomes visible all at once or not at all.
    #[instrument(skip(self, payload), fields(user_id = %user_id, event_type = %event_type))]
    pub fn append(
        &self,
        user_id: &UserId,
        event_type: EventType,
        payload: serde_json::Value,
    ) -> Result<Event, StoreError> {
        let payload_json = serde_json::to_string(&payload)?;

        self.db.with_conn(|conn| {
            let tx = conn.unchecked_transaction()?;

            let last: Option<(i64, String)> = tx
                .query_row(
                    "SELECT sequence, server_timestamp FROM events
                     WHERE user_id = ?1 ORDER BY sequence DESC LIMIT 1",
                    [user_id.as_str()],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;

            let mut server_timestamp = Utc::now().trunc_subsecs(6);
            let sequence = match &last {
                Some((seq, ts)) => {
                    let previous = row_helpers::parse_timestamp(ts, "events", "server_timestamp")?;
                    if previous > server_timestamp {
                        server_timestamp = previous;
                    }
                    seq + 1
                }
                None => 0,
            };

            let id = EventId::new();
            tx.execute(
                "INSERT INTO events (id, user_id, sequence, event_type, payload, server_timestamp)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                rusqlite::params![
                    id.as_str(),
                    user_id.as_str(),
                    sequence,
                    event_type.as_str(),
                    payload_json,
                    row_helpers::format_timestamp(&server_timestamp),
                ],
            )?;
            tx.commit()?;

            Ok(Event {
                id,
                user_id: user_id.clone(),
                event_type,
                payload,
                server_timestamp,
                sequence,
            })
        })
    }

    /// Events strictly newer than `after`, oldest first, at most `limit`.
    ///
    /// `after` must name an event in this user's stream; otherwise the result
    /// is [`StoreError::UnknownCursor`], which callers must keep distinct from
    /// the empty "nothing newer" answer.
    #[instrument(skip(self), fields(user_id = %user_id, after = %after, limit))]
    pub fn query(
        &self,
        user_id: &UserId,
        after: &EventId,
        limit: u32,
    ) -> Result<Vec<Event>, StoreError> {
        self.db.with_conn(|conn| {
            let cursor: Option<i64> = conn
                .query_row(
                    "SELECT sequence FROM events WHERE id = ?1 AND user_id = ?2",
                    [after.as_str(), user_id.as_str()],
                    |row| row.get(0),
                )
                .optional()?;
            let Some(cursor) = cursor else {
                return Err(StoreError::UnknownCursor(after.clone()));
            };

            let mut stmt = conn.prepare(&format!(
                "SELECT {EVENT_COLUMNS} FROM events
                 WHERE user_id = ?1 AND sequence > ?2
                 ORDER BY sequence ASC
                 LIMIT ?3"
            ))?;
            let mut rows = stmt.query(rusqlite::params![user_id.as_str(), cursor, limit])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(row_to_event(row)?);
            }
            Ok(results)
        })
    }

    /// The most recent `limit` events, returned oldest first.
    #[instrument(skip(self), fields(user_id = %user_id, limit))]
    pub fn query_latest(&self, user_id: &UserId, limit: u32) -> Result<Vec<Event>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {EVENT_COLUMNS} FROM events
                 WHERE user_id = ?1
                 ORDER BY sequence DESC
                 LIMIT ?2"
            ))?;
            let mut rows = stmt.query(rusqlite::params![user_id.as_str(), limit])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(row_to_event(row)?);
            }
            results.reverse();
            Ok(results)
        })
    }

    /// Cursor-aware read used by catch-up: `query` when a cursor is given,
    /// `query_latest` otherwise.
    pub fn read(
        &self,
        user_id: &UserId,
        after: Option<&EventId>,
        limit: u32,
    ) -> Result<Vec<Event>, StoreError> {
        match after {
            Some(cursor) => self.query(user_id, cursor, limit),
            None => self.query_latest(user_id, limit),
        }
    }

    /// Number of events stored for a user.
    pub fn count(&self, user_id: &UserId) -> Result<i64, StoreError> {
        self.db.with_conn(|conn| {
            Ok(conn.query_row(
                "SELECT COUNT(*) FROM events WHERE user_id = ?1",
                [user_id.as_str()],
                |row| row.get(0),
            )?)
        })
    }
}

fn row_to_event(row: &rusqlite::Row<'_>) -> Result<Event, StoreError> {
    let event_type: String = row_helpers::get(row, 2, "events", "event_type")?;
    let payload: String = row_helpers::get(row, 3, "events", "payload")?;
    let timestamp: String = row_helpers::get(row, 4, "events", "server_timestamp")?;

    Ok(Event {
        id: EventId::from_raw(row_helpers::get::<String>(row, 0, "events", "id")?),
        user_id: UserId::from_raw(row_helpers::get::<String>(row, 1, "events", "user_id")?),
        event_type: row_helpers::parse_enum(&event_type, "events", "event_type")?,
        payload: row_helpers::parse_json(&payload, "events", "payload")?,
        server_timestamp: row_helpers::parse_timestamp(&timestamp, "events", "server_timestamp")?,
        sequence: row_helpers::get(row, 5, "events", "sequence")?,
    })
}
