//! Session / episode / action journals
//!
//! Append-only logs with cascade semantics. Within one session, messages and
//! actions preserve insertion order (monotonic row ids). Actions transition
//! out of `pending` exactly once; episodes close exactly once; epochs
//! compress contiguous message ranges that never overlap.

mod types;

pub use types::{
    Action, ActionStatus, Episode, EpisodeStatus, Epoch, Message, MessageRole, Session,
    SessionStatus,
};

use std::sync::Arc;

use chrono::Utc;
use rusqlite::params;

use crate::error::{EngramError, Result};
use crate::storage::Storage;

/// Caller-provided message summarizer used by range compression.
///
/// Without one, the compressor produces a deterministic extractive summary.
pub type Summarizer = dyn Fn(&[Message]) -> String + Send + Sync;

// ============================================================================
// JOURNAL
// ============================================================================

/// Journal operations over an open storage
pub struct SessionJournal {
    storage: Arc<Storage>,
    summarizer: Option<Arc<Summarizer>>,
}

impl SessionJournal {
    /// Bind to an open storage.
    pub fn new(storage: Arc<Storage>) -> Self {
        Self { storage, summarizer: None }
    }

    /// Install a summarizer for range compression.
    pub fn with_summarizer(mut self, summarizer: Arc<Summarizer>) -> Self {
        self.summarizer = Some(summarizer);
        self
    }

    // ------------------------------------------------------------------
    // Sessions
    // ------------------------------------------------------------------

    /// Open a new active session.
    pub fn open_session(
        &self,
        name: Option<&str>,
        metadata: Option<serde_json::Value>,
    ) -> Result<Session> {
        let now = Utc::now().to_rfc3339();
        let name = name
            .map(str::to_string)
            .unwrap_or_else(|| format!("session-{}", uuid::Uuid::new_v4().simple()));
        let meta = metadata.unwrap_or_else(|| serde_json::json!({})).to_string();
        let id = self.storage.with_writer(|conn| {
            conn.execute(
                "INSERT INTO agent_sessions (name, status, metadata, created_at, updated_at) \
                 VALUES (?1, 'active', ?2, ?3, ?3)",
                params![name, meta, now],
            )?;
            Ok(conn.last_insert_rowid())
        })?;
        self.get_session(id)?.ok_or(EngramError::NotFound { entity: "session", id })
    }

    /// Fetch a session by id.
    pub fn get_session(&self, id: i64) -> Result<Option<Session>> {
        self.storage.with_reader(|conn| {
            conn.query_row(
                "SELECT id, name, status, metadata, created_at, updated_at \
                 FROM agent_sessions WHERE id = ?1",
                [id],
                row_to_session,
            )
            .map(Some)
            .or_else(none_on_empty)
        })
    }

    /// Sessions filtered by status, newest first.
    pub fn list_sessions(&self, status: Option<SessionStatus>) -> Result<Vec<Session>> {
        self.storage.with_reader(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, name, status, metadata, created_at, updated_at \
                 FROM agent_sessions \
                 WHERE (?1 IS NULL OR status = ?1) ORDER BY id DESC",
            )?;
            let rows = stmt
                .query_map([status.map(|s| s.as_str())], row_to_session)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
    }

    /// One-way status transition. Closed and archived sessions never
    /// re-open.
    pub fn transition_session(&self, id: i64, next: SessionStatus) -> Result<Session> {
        let current = self
            .get_session(id)?
            .ok_or(EngramError::NotFound { entity: "session", id })?;
        if !current.status.can_become(next) {
            return Err(EngramError::IllegalTransition {
                entity: "session",
                id,
                from: current.status.as_str().to_string(),
                to: next.as_str().to_string(),
            });
        }
        let now = Utc::now().to_rfc3339();
        self.storage.with_writer(|conn| {
            conn.execute(
                "UPDATE agent_sessions SET status = ?1, updated_at = ?2 WHERE id = ?3",
                params![next.as_str(), now, id],
            )
        })?;
        self.get_session(id)?.ok_or(EngramError::NotFound { entity: "session", id })
    }

    /// Close an active session.
    pub fn close_session(&self, id: i64) -> Result<Session> {
        self.transition_session(id, SessionStatus::Closed)
    }

    /// Delete a session; actions, messages, episodes, reflections, and
    /// resource rows cascade with it.
    pub fn delete_session(&self, id: i64) -> Result<bool> {
        let deleted = self
            .storage
            .with_writer(|conn| conn.execute("DELETE FROM agent_sessions WHERE id = ?1", [id]))?;
        Ok(deleted > 0)
    }

    fn require_active(&self, session_id: i64) -> Result<()> {
        let session = self
            .get_session(session_id)?
            .ok_or(EngramError::NotFound { entity: "session", id: session_id })?;
        if session.status != SessionStatus::Active {
            return Err(EngramError::SessionNotActive {
                id: session_id,
                status: session.status.as_str().to_string(),
            });
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Messages
    // ------------------------------------------------------------------

    /// Append an immutable message to an active session.
    pub fn append_message(
        &self,
        session_id: i64,
        role: MessageRole,
        content: &str,
        metadata: Option<serde_json::Value>,
    ) -> Result<Message> {
        self.require_active(session_id)?;
        let now = Utc::now().to_rfc3339();
        let meta = metadata.unwrap_or_else(|| serde_json::json!({})).to_string();
        let id = self.storage.with_writer(|conn| {
            conn.execute(
                "INSERT INTO agent_messages (session_id, role, content, metadata, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![session_id, role.as_str(), content, meta, now],
            )?;
            Ok(conn.last_insert_rowid())
        })?;
        self.get_message(id)?.ok_or(EngramError::NotFound { entity: "message", id })
    }

    /// Fetch a message by id.
    pub fn get_message(&self, id: i64) -> Result<Option<Message>> {
        self.storage.with_reader(|conn| {
            conn.query_row(
                "SELECT id, session_id, role, content, metadata, created_at \
                 FROM agent_messages WHERE id = ?1",
                [id],
                row_to_message,
            )
            .map(Some)
            .or_else(none_on_empty)
        })
    }

    /// Messages of a session in insertion order.
    pub fn list_messages(&self, session_id: i64, limit: Option<u32>) -> Result<Vec<Message>> {
        self.storage.with_reader(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, session_id, role, content, metadata, created_at \
                 FROM agent_messages WHERE session_id = ?1 ORDER BY id ASC LIMIT ?2",
            )?;
            let rows = stmt
                .query_map(params![session_id, limit.map(i64::from).unwrap_or(-1)], row_to_message)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
    }

    // ------------------------------------------------------------------
    // Actions
    // ------------------------------------------------------------------

    /// Append a pending action to an active session.
    pub fn append_action(
        &self,
        session_id: i64,
        tool_name: &str,
        arguments: &str,
        message_id: Option<i64>,
    ) -> Result<Action> {
        self.require_active(session_id)?;
        let now = Utc::now().to_rfc3339();
        let id = self.storage.with_writer(|conn| {
            conn.execute(
                "INSERT INTO agent_actions \
                 (session_id, message_id, tool_name, arguments, status, created_at) \
                 VALUES (?1, ?2, ?3, ?4, 'pending', ?5)",
                params![session_id, message_id, tool_name, arguments, now],
            )?;
            Ok(conn.last_insert_rowid())
        })?;
        self.get_action(id)?.ok_or(EngramError::NotFound { entity: "action", id })
    }

    /// Fetch an action by id.
    pub fn get_action(&self, id: i64) -> Result<Option<Action>> {
        self.storage.with_reader(|conn| {
            conn.query_row(
                "SELECT id, session_id, message_id, tool_name, arguments, outcome, status, \
                        duration_ms, created_at \
                 FROM agent_actions WHERE id = ?1",
                [id],
                row_to_action,
            )
            .map(Some)
            .or_else(none_on_empty)
        })
    }

    /// Actions of a session in insertion order.
    pub fn list_actions(&self, session_id: i64) -> Result<Vec<Action>> {
        self.storage.with_reader(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, session_id, message_id, tool_name, arguments, outcome, status, \
                        duration_ms, created_at \
                 FROM agent_actions WHERE session_id = ?1 ORDER BY id ASC",
            )?;
            let rows = stmt
                .query_map([session_id], row_to_action)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
    }

    /// Atomically transition an action out of `pending`.
    ///
    /// The conditional UPDATE is the atomicity: a second finalization matches
    /// zero rows and fails with `ActionAlreadyFinalized`.
    pub fn complete_action(
        &self,
        action_id: i64,
        status: ActionStatus,
        outcome: &str,
        duration_ms: i64,
    ) -> Result<Action> {
        if status == ActionStatus::Pending {
            return Err(EngramError::Config("an action cannot finalize to pending".into()));
        }
        let changed = self.storage.with_writer(|conn| {
            conn.execute(
                "UPDATE agent_actions \
                 SET status = ?1, outcome = ?2, duration_ms = ?3 \
                 WHERE id = ?4 AND status = 'pending'",
                params![status.as_str(), outcome, duration_ms, action_id],
            )
        })?;
        if changed == 0 {
            return match self.get_action(action_id)? {
                Some(_) => Err(EngramError::ActionAlreadyFinalized(action_id)),
                None => Err(EngramError::NotFound { entity: "action", id: action_id }),
            };
        }
        self.get_action(action_id)?
            .ok_or(EngramError::NotFound { entity: "action", id: action_id })
    }

    // ------------------------------------------------------------------
    // Episodes
    // ------------------------------------------------------------------

    /// Start an episode inside an active session.
    pub fn start_episode(&self, session_id: i64, name: &str) -> Result<Episode> {
        self.require_active(session_id)?;
        let now = Utc::now().to_rfc3339();
        let id = self.storage.with_writer(|conn| {
            conn.execute(
                "INSERT INTO agent_episodes (session_id, name, status, start_time) \
                 VALUES (?1, ?2, 'active', ?3)",
                params![session_id, name, now],
            )?;
            Ok(conn.last_insert_rowid())
        })?;
        self.get_episode(id)?.ok_or(EngramError::NotFound { entity: "episode", id })
    }

    /// Fetch an episode by id.
    pub fn get_episode(&self, id: i64) -> Result<Option<Episode>> {
        self.storage.with_reader(|conn| {
            conn.query_row(
                "SELECT id, session_id, name, summary, status, start_time, end_time \
                 FROM agent_episodes WHERE id = ?1",
                [id],
                row_to_episode,
            )
            .map(Some)
            .or_else(none_on_empty)
        })
    }

    /// Close an episode, setting `end_time` exactly once.
    ///
    /// `end_time` never precedes `start_time`; under clock skew it clamps to
    /// `start_time` with a warning.
    pub fn close_episode(&self, id: i64, summary: Option<&str>) -> Result<Episode> {
        let episode = self
            .get_episode(id)?
            .ok_or(EngramError::NotFound { entity: "episode", id })?;
        if episode.status == EpisodeStatus::Closed {
            return Err(EngramError::IllegalTransition {
                entity: "episode",
                id,
                from: "closed".to_string(),
                to: "closed".to_string(),
            });
        }
        let mut end = Utc::now();
        if end < episode.start_time {
            tracing::warn!(episode = id, "clock skew detected, clamping end_time to start_time");
            end = episode.start_time;
        }
        let changed = self.storage.with_writer(|conn| {
            conn.execute(
                "UPDATE agent_episodes \
                 SET status = 'closed', summary = COALESCE(?1, summary), end_time = ?2 \
                 WHERE id = ?3 AND status = 'active'",
                params![summary, end.to_rfc3339(), id],
            )
        })?;
        if changed == 0 {
            return Err(EngramError::IllegalTransition {
                entity: "episode",
                id,
                from: "closed".to_string(),
                to: "closed".to_string(),
            });
        }
        self.get_episode(id)?.ok_or(EngramError::NotFound { entity: "episode", id })
    }

    /// Episodes of a session in insertion order.
    pub fn list_episodes(&self, session_id: i64) -> Result<Vec<Episode>> {
        self.storage.with_reader(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, session_id, name, summary, status, start_time, end_time \
                 FROM agent_episodes WHERE session_id = ?1 ORDER BY id ASC",
            )?;
            let rows = stmt
                .query_map([session_id], row_to_episode)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
    }

    // ------------------------------------------------------------------
    // Epochs (range compression)
    // ------------------------------------------------------------------

    /// Compress a fully committed, non-overlapping message range into an
    /// epoch. The overlap check and the insert share one transaction.
    pub fn compress_range(
        &self,
        session_id: i64,
        from_msg: i64,
        to_msg: i64,
    ) -> Result<Epoch> {
        if from_msg > to_msg {
            return Err(EngramError::Config(format!(
                "epoch range is inverted ({from_msg} > {to_msg})"
            )));
        }
        self.get_session(session_id)?
            .ok_or(EngramError::NotFound { entity: "session", id: session_id })?;

        let messages: Vec<Message> = self.storage.with_reader(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, session_id, role, content, metadata, created_at \
                 FROM agent_messages \
                 WHERE session_id = ?1 AND id BETWEEN ?2 AND ?3 ORDER BY id ASC",
            )?;
            let rows = stmt
                .query_map(params![session_id, from_msg, to_msg], row_to_message)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })?;
        if messages.first().map(|m| m.id) != Some(from_msg)
            || messages.last().map(|m| m.id) != Some(to_msg)
        {
            return Err(EngramError::IntegrityViolation(format!(
                "message range [{from_msg}, {to_msg}] is not fully committed for session {session_id}"
            )));
        }

        let summary = match &self.summarizer {
            Some(f) => f(&messages),
            None => extractive_summary(&messages),
        };
        let now = Utc::now().to_rfc3339();

        let id = self.storage.transaction(|tx| {
            let overlapping: i64 = tx.query_row(
                "SELECT COUNT(*) FROM agent_epochs \
                 WHERE session_id = ?1 AND start_message_id <= ?2 AND end_message_id >= ?3",
                params![session_id, to_msg, from_msg],
                |row| row.get(0),
            )?;
            if overlapping > 0 {
                return Err(EngramError::IntegrityViolation(format!(
                    "epoch range [{from_msg}, {to_msg}] overlaps an existing epoch"
                )));
            }
            tx.execute(
                "INSERT INTO agent_epochs \
                 (session_id, summary, start_message_id, end_message_id, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![session_id, summary, from_msg, to_msg, now],
            )?;
            Ok(tx.last_insert_rowid())
        })?;

        self.get_epoch(id)?.ok_or(EngramError::NotFound { entity: "epoch", id })
    }

    /// Fetch an epoch by id.
    pub fn get_epoch(&self, id: i64) -> Result<Option<Epoch>> {
        self.storage.with_reader(|conn| {
            conn.query_row(
                "SELECT id, session_id, summary, start_message_id, end_message_id \
                 FROM agent_epochs WHERE id = ?1",
                [id],
                row_to_epoch,
            )
            .map(Some)
            .or_else(none_on_empty)
        })
    }

    /// Epochs of a session ordered by range start.
    pub fn list_epochs(&self, session_id: i64) -> Result<Vec<Epoch>> {
        self.storage.with_reader(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, session_id, summary, start_message_id, end_message_id \
                 FROM agent_epochs WHERE session_id = ?1 ORDER BY start_message_id ASC",
            )?;
            let rows = stmt
                .query_map([session_id], row_to_epoch)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
    }
}

/// Deterministic fallback summary: message count plus first/last excerpts.
fn extractive_summary(messages: &[Message]) -> String {
    let excerpt = |m: &Message| {
        let mut end = m.content.len().min(80);
        while !m.content.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}: {}", m.role.as_str(), &m.content[..end])
    };
    match (messages.first(), messages.last()) {
        (Some(first), Some(last)) if messages.len() > 1 => format!(
            "{} messages compressed | opens {} | closes {}",
            messages.len(),
            excerpt(first),
            excerpt(last)
        ),
        (Some(only), _) => format!("1 message compressed | {}", excerpt(only)),
        _ => "0 messages compressed".to_string(),
    }
}

// ------------------------------------------------------------------
// Row mappers
// ------------------------------------------------------------------

fn none_on_empty<T>(e: rusqlite::Error) -> rusqlite::Result<Option<T>> {
    match e {
        rusqlite::Error::QueryReturnedNoRows => Ok(None),
        other => Err(other),
    }
}

fn parse_time(s: String) -> chrono::DateTime<Utc> {
    s.parse().unwrap_or_else(|_| Utc::now())
}

fn parse_meta(s: String) -> serde_json::Value {
    serde_json::from_str(&s).unwrap_or(serde_json::Value::Null)
}

fn row_to_session(row: &rusqlite::Row<'_>) -> rusqlite::Result<Session> {
    Ok(Session {
        id: row.get(0)?,
        name: row.get(1)?,
        status: SessionStatus::parse_name(&row.get::<_, String>(2)?),
        metadata: parse_meta(row.get(3)?),
        created_at: parse_time(row.get(4)?),
        updated_at: parse_time(row.get(5)?),
    })
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<Message> {
    Ok(Message {
        id: row.get(0)?,
        session_id: row.get(1)?,
        role: MessageRole::parse_name(&row.get::<_, String>(2)?),
        content: row.get(3)?,
        metadata: parse_meta(row.get(4)?),
        created_at: parse_time(row.get(5)?),
    })
}

fn row_to_action(row: &rusqlite::Row<'_>) -> rusqlite::Result<Action> {
    Ok(Action {
        id: row.get(0)?,
        session_id: row.get(1)?,
        message_id: row.get(2)?,
        tool_name: row.get(3)?,
        arguments: row.get(4)?,
        outcome: row.get(5)?,
        status: ActionStatus::parse_name(&row.get::<_, String>(6)?),
        duration_ms: row.get(7)?,
        created_at: parse_time(row.get(8)?),
    })
}

fn row_to_episode(row: &rusqlite::Row<'_>) -> rusqlite::Result<Episode> {
    let end: Option<String> = row.get(6)?;
    Ok(Episode {
        id: row.get(0)?,
        session_id: row.get(1)?,
        name: row.get(2)?,
        summary: row.get(3)?,
        status: EpisodeStatus::parse_name(&row.get::<_, String>(4)?),
        start_time: parse_time(row.get(5)?),
        end_time: end.map(parse_time),
    })
}

fn row_to_epoch(row: &rusqlite::Row<'_>) -> rusqlite::Result<Epoch> {
    Ok(Epoch {
        id: row.get(0)?,
        session_id: row.get(1)?,
        summary: row.get(2)?,
        start_message_id: row.get(3)?,
        end_message_id: row.get(4)?,
    })
}

// ============================================================================
// TESTS
// ============================================================================
