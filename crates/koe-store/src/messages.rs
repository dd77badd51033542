use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use koe_core::clock::to_stored;
use koe_core::dialogue::{ChatRole, HistoryEntry};
use koe_core::ids::{ChatSessionId, MessageId};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MessageRow {
    pub id: MessageId,
    pub session_id: ChatSessionId,
    pub sequence: i64,
    pub role: ChatRole,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

impl MessageRow {
    pub fn to_history(&self) -> HistoryEntry {
        HistoryEntry {
            role: self.role,
            content: self.content.clone(),
        }
    }
}

/// Append one message. Messages are insert-only; there is no update path.
pub(crate) fn insert(
    conn: &Connection,
    session_id: &ChatSessionId,
    role: ChatRole,
    content: &str,
    now: DateTime<Utc>,
) -> Result<MessageId, StoreError> {
    let id = MessageId::new();
    conn.execute(
        "INSERT INTO chat_messages (id, session_id, sequence, role, content, created_at)
         VALUES (?1, ?2,
                 (SELECT COALESCE(MAX(sequence), 0) + 1 FROM chat_messages WHERE session_id = ?2),
                 ?3, ?4, ?5)",
        rusqlite::params![id.as_str(), session_id.as_str(), role.to_string(), content, to_stored(now)],
    )?;
    Ok(id)
}

pub(crate) fn list(conn: &Connection, session_id: &ChatSessionId) -> Result<Vec<MessageRow>, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT id, session_id, sequence, role, content, created_at
         FROM chat_messages WHERE session_id = ?1 ORDER BY sequence ASC",
    )?;
    let mut rows = stmt.query([session_id.as_str()])?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        out.push(row_to_message(row)?);
    }
    Ok(out)
}

pub struct MessageRepo {
    db: Database,
}

impl MessageRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Ordered history of a session, oldest first.
    #[instrument(skip(self), fields(session_id = %session_id))]
    pub fn list(&self, session_id: &ChatSessionId) -> Result<Vec<MessageRow>, StoreError> {
        self.db.with_conn(|conn| list(conn, session_id))
    }

    /// History in the shape the dialogue engine consumes. Blank messages are
    /// left out.
    pub fn history(&self, session_id: &ChatSessionId) -> Result<Vec<HistoryEntry>, StoreError> {
        Ok(self
            .list(session_id)?
            .iter()
            .filter(|m| !m.content.trim().is_empty())
            .map(MessageRow::to_history)
            .collect())
    }

    pub fn count(&self, session_id: &ChatSessionId) -> Result<i64, StoreError> {
        self.db.with_conn(|conn| {
            Ok(conn.query_row(
                "SELECT COUNT(*) FROM chat_messages WHERE session_id = ?1",
                [session_id.as_str()],
                |row| row.get(0),
            )?)
        })
    }
}

fn row_to_message(row: &rusqlite::Row<'_>) -> Result<MessageRow, StoreError> {
    let role: String = row_helpers::get(row, 3, "chat_messages", "role")?;
    Ok(MessageRow {
        id: MessageId::from_raw(row_helpers::get::<String>(row, 0, "chat_messages", "id")?),
        session_id: ChatSessionId::from_raw(row_helpers::get::<String>(row, 1, "chat_messages", "session_id")?),
        sequence: row_helpers::get(row, 2, "chat_messages", "sequence")?,
        role: row_helpers::parse_enum(&role, "chat_messages", "role")?,
        content: row_helpers::get(row, 4, "chat_messages", "content")?,
        created_at: row_helpers::get_time(row, 5, "chat_messages", "created_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sessions::SessionRepo;
    use crate::users::UserRepo;
    use secrecy::SecretString;

    fn setup() -> (Database, ChatSessionId) {
        let db = Database::in_memory().unwrap();
        let user = UserRepo::new(db.clone())
            .get_or_create("U1", &SecretString::from("s".to_string()), Utc::now())
            .unwrap();
        let session = SessionRepo::new(db.clone()).create(&user.id, Utc::now()).unwrap();
        (db, session.id)
    }

    #[test]
    fn messages_keep_insertion_order() {
        let (db, sid) = setup();
        let now = Utc::now();
        db.with_conn(|conn| {
            insert(conn, &sid, ChatRole::User, "first", now)?;
            insert(conn, &sid, ChatRole::Assistant, "second", now)?;
            insert(conn, &sid, ChatRole::User, "third", now)?;
            Ok(())
        })
        .unwrap();

        let repo = MessageRepo::new(db);
        let rows = repo.list(&sid).unwrap();
        let contents: Vec<_> = rows.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, ["first", "second", "third"]);
        assert_eq!(rows.iter().map(|m| m.sequence).collect::<Vec<_>>(), [1, 2, 3]);
        assert_eq!(repo.count(&sid).unwrap(), 3);
    }

    #[test]
    fn history_skips_blank_messages() {
        let (db, sid) = setup();
        db.with_conn(|conn| {
            insert(conn, &sid, ChatRole::User, "  ", Utc::now())?;
            insert(conn, &sid, ChatRole::User, "bus stop is far", Utc::now())?;
            Ok(())
        })
        .unwrap();
        let history = MessageRepo::new(db).history(&sid).unwrap();
        assert_eq!(history, vec![HistoryEntry::user("bus stop is far")]);
    }

    #[test]
    fn unknown_role_is_corrupt_row() {
        let (db, sid) = setup();
        db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO chat_messages (id, session_id, sequence, role, content, created_at)
                 VALUES ('msg_x', ?1, 1, 'system', 'hi', ?2)",
                rusqlite::params![sid.as_str(), to_stored(Utc::now())],
            )?;
            Ok(())
        })
        .unwrap();
        let err = MessageRepo::new(db).list(&sid).unwrap_err();
        assert!(matches!(err, StoreError::CorruptRow { column: "role", .. }));
    }
}
