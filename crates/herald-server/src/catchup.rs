//! Long-poll catch-up reader.
//!
//! A request waits until its user's stream has something newer than the
//! cursor, or until the deadline passes. The deadline sits below the client's
//! own request timeout so an idle poll ends with an empty answer the client
//! simply re-issues, rather than a timeout.

use std::time::Duration;

use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use herald_core::ids::{EventId, UserId};
use herald_core::Event;
use herald_store::{EventLog, StoreError};

use crate::config::ServerConfig;

#[derive(Debug, thiserror::Error)]
pub enum CatchupError {
    #[error("unknown cursor: {0}")]
    UnknownCursor(EventId),

    #[error("event log error: {0}")]
    Store(StoreError),

    #[error("request cancelled")]
    Cancelled,
}

impl From<StoreError> for CatchupError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::UnknownCursor(id) => CatchupError::UnknownCursor(id),
            other => CatchupError::Store(other),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PollOutcome {
    Events(Vec<Event>),
    /// Deadline reached with nothing newer than the cursor.
    Empty,
}

impl PollOutcome {
    pub fn into_events(self) -> Vec<Event> {
        match self {
            PollOutcome::Events(events) => events,
            PollOutcome::Empty => Vec::new(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct CatchupSettings {
    pub deadline: Duration,
    pub poll_interval: Duration,
    pub default_limit: u32,
    pub max_limit: u32,
}

impl From<&ServerConfig> for CatchupSettings {
    fn from(config: &ServerConfig) -> Self {
        Self {
            deadline: config.catchup_deadline(),
            poll_interval: config.catchup_poll_interval(),
            default_limit: config.catchup_default_limit,
            max_limit: config.catchup_max_limit,
        }
    }
}

#[derive(Clone)]
pub struct CatchupReader {
    log: EventLog,
    settings: CatchupSettings,
}

impl CatchupReader {
    pub fn new(log: EventLog, settings: CatchupSettings) -> Self {
        Self { log, settings }
    }

    /// `0` means the default; anything above the maximum is clamped.
    pub fn effective_limit(&self, requested: Option<u32>) -> u32 {
        match requested {
            None | Some(0) => self.settings.default_limit,
            Some(n) => n.min(self.settings.max_limit),
        }
    }

    /// Wait for events newer than `since` (or the latest events when no cursor
    /// is given). Returns as soon as a read is non-empty; returns
    /// [`PollOutcome::Empty`] once the deadline has passed. Cancellation ends
    /// the wait with [`CatchupError::Cancelled`].
    pub async fn poll(
        &self,
        user_id: &UserId,
        since: Option<&EventId>,
        limit: Option<u32>,
        cancel: &CancellationToken,
    ) -> Result<PollOutcome, CatchupError> {
        let limit = self.effective_limit(limit);
        let deadline = Instant::now() + self.settings.deadline;
        let mut attempts = 0u32;

        loop {
            if cancel.is_cancelled() {
                return Err(CatchupError::Cancelled);
            }

            attempts += 1;
            let events = self.log.read(user_id, since, limit)?;
            if !events.is_empty() {
                debug!(user_id = %user_id, count = events.len(), attempts, "catch-up answered");
                return Ok(PollOutcome::Events(events));
            }

            let now = Instant::now();
            if now >= deadline {
                debug!(user_id = %user_id, attempts, "catch-up deadline reached");
                return Ok(PollOutcome::Empty);
            }

            let wake = (now + self.settings.poll_interval).min(deadline);
            tokio::select! {
                _ = cancel.cancelled() => return Err(CatchupError::Cancelled),
                _ = sleep_until(wake) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use herald_core::EventType;
    use herald_store::Database;
    use serde_json::json;

    const DEADLINE: Duration = Duration::from_secs(59);
    const INTERVAL: Duration = Duration::from_secs(1);

    fn reader() -> (EventLog, CatchupReader) {
        let log = EventLog::new(Database::in_memory().unwrap());
        let settings = CatchupSettings {
            deadline: DEADLINE,
            poll_interval: INTERVAL,
            default_limit: 50,
            max_limit: 500,
        };
        (log.clone(), CatchupReader::new(log, settings))
    }

    fn user(id: &str) -> UserId {
        UserId::from_raw(id)
    }

    #[test]
    fn limit_defaults_and_clamps() {
        let (_, reader) = reader();
        assert_eq!(reader.effective_limit(None), 50);
        assert_eq!(reader.effective_limit(Some(0)), 50);
        assert_eq!(reader.effective_limit(Some(10)), 10);
        assert_eq!(reader.effective_limit(Some(10_000)), 500);
    }

    #[tokio::test(start_paused = true)]
    async fn returns_existing_events_immediately() {
        let (log, reader) = reader();
        let u = user("u1");
        let first = log.append(&u, EventType::GameUpdate, json!({"n": 0})).unwrap();
        log.append(&u, EventType::GameUpdate, json!({"n": 1})).unwrap();

        let started = Instant::now();
        let outcome = reader
            .poll(&u, Some(&first.id), None, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(started.elapsed(), Duration::ZERO);

        let events = outcome.into_events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].payload["n"], 1);
    }

    #[tokio::test(start_paused = true)]
    async fn no_cursor_reads_latest() {
        let (log, reader) = reader();
        let u = user("u1");
        for n in 0..5 {
            log.append(&u, EventType::GameUpdate, json!({"n": n})).unwrap();
        }
        let events = reader
            .poll(&u, None, Some(2), &CancellationToken::new())
            .await
            .unwrap()
            .into_events();
        let ns: Vec<i64> = events.iter().map(|e| e.payload["n"].as_i64().unwrap()).collect();
        assert_eq!(ns, vec![3, 4]);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_append_answers_before_deadline() {
        let (log, reader) = reader();
        let u = user("u1");
        let cursor = log.append(&u, EventType::GameUpdate, json!({"n": 0})).unwrap();

        let writer_log = log.clone();
        let writer_user = u.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(4500)).await;
            writer_log
                .append(&writer_user, EventType::FriendAccepted, json!({"n": 1}))
                .unwrap();
        });

        let started = Instant::now();
        let outcome = reader
            .poll(&u, Some(&cursor.id), None, &CancellationToken::new())
            .await
            .unwrap();
        let waited = started.elapsed();

        let events = outcome.into_events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, EventType::FriendAccepted);
        assert!(waited >= Duration::from_millis(4500));
        assert!(waited < Duration::from_millis(4500) + INTERVAL);
        assert!(waited < DEADLINE);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_poll_returns_empty_within_window() {
        let (log, reader) = reader();
        let u = user("u1");
        let cursor = log.append(&u, EventType::GameUpdate, json!({})).unwrap();

        let started = Instant::now();
        let outcome = reader
            .poll(&u, Some(&cursor.id), None, &CancellationToken::new())
            .await
            .unwrap();
        let waited = started.elapsed();

        assert_eq!(outcome, PollOutcome::Empty);
        assert!(waited >= DEADLINE, "returned after {waited:?}");
        assert!(waited < DEADLINE + INTERVAL, "returned after {waited:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn fresh_user_without_cursor_waits_then_empty() {
        let (_, reader) = reader();
        let outcome = reader
            .poll(&user("nobody"), None, None, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome, PollOutcome::Empty);
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_cursor_fails_fast() {
        let (log, reader) = reader();
        let u = user("u1");
        log.append(&u, EventType::GameUpdate, json!({})).unwrap();

        let started = Instant::now();
        let err = reader
            .poll(
                &u,
                Some(&EventId::from_raw("evt_gone")),
                None,
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, CatchupError::UnknownCursor(_)));
        assert_eq!(started.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_aborts_wait() {
        let (log, reader) = reader();
        let u = user("u1");
        let cursor = log.append(&u, EventType::GameUpdate, json!({})).unwrap();

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(3)).await;
            trigger.cancel();
        });

        let started = Instant::now();
        let err = reader
            .poll(&u, Some(&cursor.id), None, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, CatchupError::Cancelled));
        assert!(started.elapsed() < DEADLINE);
    }
}
