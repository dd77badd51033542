//! Append-only points ledger. Every balance change writes one history row
//! in the same transaction; entries are never updated or deleted.

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use koe_core::clock::to_stored;
use koe_core::ids::{LedgerEntryId, UserId};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

pub const REASON_CHAT_OPINION: &str = "chat_opinion";

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: LedgerEntryId,
    pub user_id: Option<UserId>,
    pub points: i64,
    pub reason: String,
    pub reference_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Credit `delta` points and return the new balance. Not idempotent: the
/// caller must not invoke it twice for one event.
pub(crate) fn add_points(
    conn: &Connection,
    user_id: &UserId,
    delta: i64,
    reason: &str,
    reference_id: Option<&str>,
    now: DateTime<Utc>,
) -> Result<i64, StoreError> {
    let now = to_stored(now);
    let updated = conn.execute(
        "UPDATE users SET total_points = total_points + ?1, updated_at = ?2 WHERE id = ?3",
        rusqlite::params![delta, now, user_id.as_str()],
    )?;
    if updated == 0 {
        return Err(StoreError::NotFound(format!("user {user_id}")));
    }
    conn.execute(
        "INSERT INTO points_history (id, user_id, points, reason, reference_id, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        rusqlite::params![
            LedgerEntryId::new().as_str(),
            user_id.as_str(),
            delta,
            reason,
            reference_id,
            now,
        ],
    )?;
    Ok(conn.query_row(
        "SELECT total_points FROM users WHERE id = ?1",
        [user_id.as_str()],
        |row| row.get(0),
    )?)
}

pub struct PointsRepo {
    db: Database,
}

impl PointsRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    #[instrument(skip(self), fields(user = %user_id, delta, reason))]
    pub fn add_points(
        &self,
        user_id: &UserId,
        delta: i64,
        reason: &str,
        reference_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<i64, StoreError> {
        self.db
            .with_tx(|tx| add_points(tx, user_id, delta, reason, reference_id, now))
    }

    /// Ledger entries for a user, newest first.
    pub fn history(&self, user_id: &UserId) -> Result<Vec<LedgerEntry>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, user_id, points, reason, reference_id, created_at
                 FROM points_history WHERE user_id = ?1
                 ORDER BY created_at DESC, id DESC",
            )?;
            let mut rows = stmt.query([user_id.as_str()])?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                out.push(row_to_entry(row)?);
            }
            Ok(out)
        })
    }

    pub fn count_all(&self) -> Result<i64, StoreError> {
        self.db.with_conn(|conn| {
            Ok(conn.query_row("SELECT COUNT(*) FROM points_history", [], |row| row.get(0))?)
        })
    }
}

fn row_to_entry(row: &rusqlite::Row<'_>) -> Result<LedgerEntry, StoreError> {
    Ok(LedgerEntry {
        id: LedgerEntryId::from_raw(row_helpers::get::<String>(row, 0, "points_history", "id")?),
        user_id: row_helpers::get_opt::<String>(row, 1, "points_history", "user_id")?.map(UserId::from_raw),
        points: row_helpers::get(row, 2, "points_history", "points")?,
        reason: row_helpers::get(row, 3, "points_history", "reason")?,
        reference_id: row_helpers::get_opt(row, 4, "points_history", "reference_id")?,
        created_at: row_helpers::get_time(row, 5, "points_history", "created_at")?,
    })
}
