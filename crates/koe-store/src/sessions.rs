use chrono::{DateTime, Duration, Utc};
use rusqlite::{Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use koe_core::clock::to_stored;
use koe_core::dialogue::ChatRole;
use koe_core::ids::{ChatSessionId, OpinionId, UserId};
use koe_core::summary::{Category, SummaryRecord};

use crate::database::Database;
use crate::error::StoreError;
use crate::opinions::{self, OpinionSource};
use crate::{messages, points, row_helpers};

/// Session lifecycle. Transitions only go `Active -> Completed` or
/// `Active -> Abandoned`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Completed,
    Abandoned,
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Completed => write!(f, "completed"),
            Self::Abandoned => write!(f, "abandoned"),
        }
    }
}

impl std::str::FromStr for SessionStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "completed" => Ok(Self::Completed),
            "abandoned" => Ok(Self::Abandoned),
            other => Err(format!("unknown session status: {other}")),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChatSessionRow {
    pub id: ChatSessionId,
    pub user_id: UserId,
    pub status: SessionStatus,
    pub turn_count: u32,
    pub started_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub summary_text: Option<String>,
    pub summary_category: Option<Category>,
    pub summary_emotion_score: Option<u8>,
}

impl ChatSessionRow {
    pub fn is_active(&self) -> bool {
        self.status == SessionStatus::Active
    }

    /// True once no activity has been seen for longer than `timeout`.
    pub fn is_expired(&self, now: DateTime<Utc>, timeout: Duration) -> bool {
        now - self.last_activity_at > timeout
    }
}

/// Outcome of resolving the single active session for a user.
#[derive(Clone, Debug)]
pub struct ResolvedSession {
    pub session: ChatSessionRow,
    /// Older duplicates that were abandoned while resolving.
    pub collapsed: Vec<ChatSessionId>,
    /// Retained session that had timed out and was abandoned.
    pub expired: Option<ChatSessionId>,
    pub created: bool,
}

/// Result of committing a finalized session.
#[derive(Clone, Debug)]
pub struct Completion {
    pub opinion_id: OpinionId,
    pub user_id: UserId,
    pub total_points: i64,
}

const COLUMNS: &str = "id, user_id, status, turn_count, started_at, last_activity_at, completed_at,
                       summary_text, summary_category, summary_emotion_score";

pub struct SessionRepo {
    db: Database,
}

impl SessionRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Create a new active session with no turns.
    #[instrument(skip(self), fields(user = %user_id))]
    pub fn create(&self, user_id: &UserId, now: DateTime<Utc>) -> Result<ChatSessionRow, StoreError> {
        self.db.with_conn(|conn| insert(conn, user_id, now))
    }

    #[instrument(skip(self), fields(session_id = %id))]
    pub fn get(&self, id: &ChatSessionId) -> Result<ChatSessionRow, StoreError> {
        self.db.with_conn(|conn| get(conn, id))
    }

    /// Active sessions for a user, newest first.
    pub fn list_active(&self, user_id: &UserId) -> Result<Vec<ChatSessionRow>, StoreError> {
        self.db.with_conn(|conn| list_active(conn, user_id))
    }

    pub fn count_active(&self, user_id: &UserId) -> Result<i64, StoreError> {
        self.db.with_conn(|conn| {
            Ok(conn.query_row(
                "SELECT COUNT(*) FROM chat_sessions WHERE user_id = ?1 AND status = 'active'",
                [user_id.as_str()],
                |row| row.get(0),
            )?)
        })
    }

    /// Find or create the one active session for a user.
    ///
    /// Runs in a single write transaction: duplicates are collapsed to the
    /// newest, a timed-out survivor is abandoned, and a fresh session is
    /// created if nothing usable is left. Because the transaction holds the
    /// write lock from the start, two processes resolving the same user
    /// cannot both create a session.
    #[instrument(skip(self), fields(user = %user_id))]
    pub fn resolve_active(
        &self,
        user_id: &UserId,
        now: DateTime<Utc>,
        timeout: Duration,
    ) -> Result<ResolvedSession, StoreError> {
        self.db.with_tx(|tx| {
            let mut active = list_active(tx, user_id)?.into_iter();
            let newest = active.next();

            let mut collapsed = Vec::new();
            for stale in active {
                set_abandoned(tx, &stale.id)?;
                collapsed.push(stale.id);
            }
            if !collapsed.is_empty() {
                warn!(
                    user = %user_id,
                    kept = ?newest.as_ref().map(|s| s.id.as_str()),
                    abandoned = collapsed.len(),
                    "collapsed duplicate active sessions"
                );
            }

            let mut expired = None;
            let kept = match newest {
                Some(session) if session.is_expired(now, timeout) => {
                    set_abandoned(tx, &session.id)?;
                    info!(session_id = %session.id, "session timed out");
                    expired = Some(session.id);
                    None
                }
                other => other,
            };

            let (session, created) = match kept {
                Some(session) => (session, false),
                None => (insert(tx, user_id, now)?, true),
            };

            Ok(ResolvedSession {
                session,
                collapsed,
                expired,
                created,
            })
        })
    }

    /// Commit one completed turn: both messages plus the turn increment.
    ///
    /// The update only applies if the session is still active, still at
    /// `expected_turn`, and below `max_turns`; otherwise nothing is written
    /// and `Conflict` is returned.
    #[instrument(skip(self, user_text, assistant_text), fields(session_id = %session_id))]
    pub fn record_turn(
        &self,
        session_id: &ChatSessionId,
        expected_turn: u32,
        max_turns: u32,
        user_text: &str,
        assistant_text: &str,
        now: DateTime<Utc>,
    ) -> Result<u32, StoreError> {
        self.db.with_tx(|tx| {
            let updated = tx.execute(
                "UPDATE chat_sessions SET turn_count = turn_count + 1, last_activity_at = ?1
                 WHERE id = ?2 AND status = 'active' AND turn_count = ?3 AND turn_count < ?4",
                rusqlite::params![to_stored(now), session_id.as_str(), expected_turn, max_turns],
            )?;
            if updated == 0 {
                return Err(StoreError::Conflict(format!(
                    "session {session_id} moved on from turn {expected_turn}"
                )));
            }
            messages::insert(tx, session_id, ChatRole::User, user_text, now)?;
            messages::insert(tx, session_id, ChatRole::Assistant, assistant_text, now)?;
            Ok(expected_turn + 1)
        })
    }

    /// Append a message without counting a turn. Only active sessions accept
    /// messages.
    #[instrument(skip(self, content), fields(session_id = %session_id, role = %role))]
    pub fn append_message(
        &self,
        session_id: &ChatSessionId,
        role: ChatRole,
        content: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.db.with_tx(|tx| {
            let updated = tx.execute(
                "UPDATE chat_sessions SET last_activity_at = ?1 WHERE id = ?2 AND status = 'active'",
                rusqlite::params![to_stored(now), session_id.as_str()],
            )?;
            if updated == 0 {
                return Err(StoreError::Conflict(format!("session {session_id} is not active")));
            }
            messages::insert(tx, session_id, role, content, now)?;
            Ok(())
        })
    }

    /// Abandon one session. Returns false if it was not active.
    #[instrument(skip(self), fields(session_id = %id))]
    pub fn abandon(&self, id: &ChatSessionId) -> Result<bool, StoreError> {
        self.db.with_conn(|conn| set_abandoned(conn, id))
    }

    /// Abandon every active session of a user. Returns how many changed.
    #[instrument(skip(self), fields(user = %user_id))]
    pub fn abandon_all_active(&self, user_id: &UserId) -> Result<usize, StoreError> {
        self.db.with_conn(|conn| {
            Ok(conn.execute(
                "UPDATE chat_sessions SET status = 'abandoned' WHERE user_id = ?1 AND status = 'active'",
                [user_id.as_str()],
            )?)
        })
    }

    /// Mark a session completed, record its opinion and award points, all in
    /// one transaction. A session that is no longer active yields `Conflict`
    /// and writes nothing, so a session is never rewarded twice.
    #[instrument(skip(self, summary), fields(session_id = %session_id, category = %summary.category))]
    pub fn complete_with_opinion(
        &self,
        session_id: &ChatSessionId,
        summary: &SummaryRecord,
        points_awarded: i64,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<Completion, StoreError> {
        self.db.with_tx(|tx| {
            let updated = tx.execute(
                "UPDATE chat_sessions
                 SET status = 'completed', completed_at = ?1, last_activity_at = ?1,
                     summary_text = ?2, summary_category = ?3, summary_emotion_score = ?4
                 WHERE id = ?5 AND status = 'active'",
                rusqlite::params![
                    to_stored(now),
                    summary.summary,
                    summary.category.as_str(),
                    summary.emotion_score,
                    session_id.as_str(),
                ],
            )?;
            if updated == 0 {
                return Err(StoreError::Conflict(format!("session {session_id} is not active")));
            }

            let user_id = UserId::from_raw(tx.query_row(
                "SELECT user_id FROM chat_sessions WHERE id = ?1",
                [session_id.as_str()],
                |row| row.get::<_, String>(0),
            )?);
            let opinion_id = opinions::insert(
                tx,
                Some(&user_id),
                OpinionSource::Chat,
                summary,
                Some(session_id),
                now,
            )?;
            let total_points = points::add_points(
                tx,
                &user_id,
                points_awarded,
                reason,
                Some(opinion_id.as_str()),
                now,
            )?;

            Ok(Completion {
                opinion_id,
                user_id,
                total_points,
            })
        })
    }
}

fn insert(conn: &Connection, user_id: &UserId, now: DateTime<Utc>) -> Result<ChatSessionRow, StoreError> {
    let id = ChatSessionId::new();
    let stamp = to_stored(now);
    conn.execute(
        "INSERT INTO chat_sessions (id, user_id, status, turn_count, started_at, last_activity_at)
         VALUES (?1, ?2, 'active', 0, ?3, ?3)",
        rusqlite::params![id.as_str(), user_id.as_str(), stamp],
    )?;
    Ok(ChatSessionRow {
        id,
        user_id: user_id.clone(),
        status: SessionStatus::Active,
        turn_count: 0,
        started_at: now,
        last_activity_at: now,
        completed_at: None,
        summary_text: None,
        summary_category: None,
        summary_emotion_score: None,
    })
}

fn get(conn: &Connection, id: &ChatSessionId) -> Result<ChatSessionRow, StoreError> {
    conn.query_row(
        &format!("SELECT {COLUMNS} FROM chat_sessions WHERE id = ?1"),
        [id.as_str()],
        |row| Ok(row_to_session(row)),
    )
    .optional()?
    .unwrap_or_else(|| Err(StoreError::NotFound(format!("session {id}"))))
}

fn list_active(conn: &Connection, user_id: &UserId) -> Result<Vec<ChatSessionRow>, StoreError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {COLUMNS} FROM chat_sessions
         WHERE user_id = ?1 AND status = 'active'
         ORDER BY started_at DESC, id DESC"
    ))?;
    let mut rows = stmt.query([user_id.as_str()])?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        out.push(row_to_session(row)?);
    }
    Ok(out)
}

fn set_abandoned(conn: &Connection, id: &ChatSessionId) -> Result<bool, StoreError> {
    let n = conn.execute(
        "UPDATE chat_sessions SET status = 'abandoned' WHERE id = ?1 AND status = 'active'",
        [id.as_str()],
    )?;
    Ok(n > 0)
}

fn row_to_session(row: &rusqlite::Row<'_>) -> Result<ChatSessionRow, StoreError> {
    let status: String = row_helpers::get(row, 2, "chat_sessions", "status")?;
    let category = row_helpers::get_opt::<String>(row, 8, "chat_sessions", "summary_category")?
        .map(|raw| row_helpers::parse_enum(&raw, "chat_sessions", "summary_category"))
        .transpose()?;
    Ok(ChatSessionRow {
        id: ChatSessionId::from_raw(row_helpers::get::<String>(row, 0, "chat_sessions", "id")?),
        user_id: UserId::from_raw(row_helpers::get::<String>(row, 1, "chat_sessions", "user_id")?),
        status: row_helpers::parse_enum(&status, "chat_sessions", "status")?,
        turn_count: row_helpers::get(row, 3, "chat_sessions", "turn_count")?,
        started_at: row_helpers::get_time(row, 4, "chat_sessions", "started_at")?,
        last_activity_at: row_helpers::get_time(row, 5, "chat_sessions", "last_activity_at")?,
        completed_at: row_helpers::get_time_opt(row, 6, "chat_sessions", "completed_at")?,
        summary_text: row_helpers::get_opt(row, 7, "chat_sessions", "summary_text")?,
        summary_category: category,
        summary_emotion_score: row_helpers::get_opt(row, 9, "chat_sessions", "summary_emotion_score")?,
    })
}
