use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::instrument;

use koe_core::clock::to_stored;
use koe_core::ids::{ChatSessionId, OpinionId, UserId};
use koe_core::summary::{Category, SummaryRecord};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

/// Channel an opinion arrived through.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpinionSource {
    Chat,
    FreeForm,
    TextMessage,
}

impl std::fmt::Display for OpinionSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Chat => write!(f, "chat"),
            Self::FreeForm => write!(f, "free_form"),
            Self::TextMessage => write!(f, "text_message"),
        }
    }
}

impl std::str::FromStr for OpinionSource {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "chat" => Ok(Self::Chat),
            "free_form" => Ok(Self::FreeForm),
            "text_message" => Ok(Self::TextMessage),
            other => Err(format!("unknown opinion source: {other}")),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OpinionRow {
    pub id: OpinionId,
    pub user_id: Option<UserId>,
    pub source: OpinionSource,
    pub content: String,
    pub category: Category,
    pub emotion_score: u8,
    pub session_id: Option<ChatSessionId>,
    pub created_at: DateTime<Utc>,
}

/// Opinion count and mean emotion for one category.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CategoryStat {
    pub category: Category,
    pub count: i64,
    pub mean_emotion: f64,
}

const COLUMNS: &str =
    "id, user_id, source_type, content, category, emotion_score, session_id, created_at";

pub(crate) fn insert(
    conn: &Connection,
    user_id: Option<&UserId>,
    source: OpinionSource,
    summary: &SummaryRecord,
    session_id: Option<&ChatSessionId>,
    now: DateTime<Utc>,
) -> Result<OpinionId, StoreError> {
    let id = OpinionId::new();
    conn.execute(
        "INSERT INTO opinions (id, user_id, source_type, content, category, emotion_score, session_id, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        rusqlite::params![
            id.as_str(),
            user_id.map(UserId::as_str),
            source.to_string(),
            summary.summary,
            summary.category.as_str(),
            summary.emotion_score,
            session_id.map(ChatSessionId::as_str),
            to_stored(now),
        ],
    )
    .map_err(|e| {
        if e.sqlite_error_code() == Some(rusqlite::ErrorCode::ConstraintViolation) {
            StoreError::Conflict(format!("opinion already recorded: {e}"))
        } else {
            e.into()
        }
    })?;
    Ok(id)
}

pub struct OpinionRepo {
    db: Database,
}

impl OpinionRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Record an opinion that did not come from a chat session.
    #[instrument(skip(self, summary))]
    pub fn create(
        &self,
        user_id: Option<&UserId>,
        source: OpinionSource,
        summary: &SummaryRecord,
        now: DateTime<Utc>,
    ) -> Result<OpinionId, StoreError> {
        self.db
            .with_tx(|tx| insert(tx, user_id, source, summary, None, now))
    }

    pub fn get(&self, id: &OpinionId) -> Result<OpinionRow, StoreError> {
        self.db.with_conn(|conn| {
            conn.query_row(
                &format!("SELECT {COLUMNS} FROM opinions WHERE id = ?1"),
                [id.as_str()],
                |row| Ok(row_to_opinion(row)),
            )
            .optional()?
            .unwrap_or_else(|| Err(StoreError::NotFound(format!("opinion {id}"))))
        })
    }

    pub fn by_session(&self, session_id: &ChatSessionId) -> Result<Option<OpinionRow>, StoreError> {
        self.db.with_conn(|conn| {
            conn.query_row(
                &format!("SELECT {COLUMNS} FROM opinions WHERE session_id = ?1"),
                [session_id.as_str()],
                |row| Ok(row_to_opinion(row)),
            )
            .optional()?
            .transpose()
        })
    }

    /// Opinions newest first, optionally restricted to one category.
    pub fn list(&self, category: Option<Category>, limit: u32) -> Result<Vec<OpinionRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {COLUMNS} FROM opinions
                 WHERE (?1 IS NULL OR category = ?1)
                 ORDER BY created_at DESC, id DESC LIMIT ?2"
            ))?;
            let mut rows = stmt.query(rusqlite::params![category.map(|c| c.as_str()), limit])?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                out.push(row_to_opinion(row)?);
            }
            Ok(out)
        })
    }

    pub fn count(&self) -> Result<i64, StoreError> {
        self.db.with_conn(|conn| {
            Ok(conn.query_row("SELECT COUNT(*) FROM opinions", [], |row| row.get(0))?)
        })
    }

    /// Per-category counts in the fixed category order. Categories with no
    /// opinions are included with a zero count.
    pub fn category_stats(&self) -> Result<Vec<CategoryStat>, StoreError> {
        self.db.with_conn(|conn| category_stats(conn))
    }
}

pub(crate) fn category_stats(conn: &Connection) -> Result<Vec<CategoryStat>, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT category, COUNT(*), AVG(emotion_score) FROM opinions GROUP BY category",
    )?;
    let mut rows = stmt.query([])?;
    let mut found = Vec::new();
    while let Some(row) = rows.next()? {
        let raw: String = row_helpers::get(row, 0, "opinions", "category")?;
        let category: Category = row_helpers::parse_enum(&raw, "opinions", "category")?;
        let count: i64 = row_helpers::get(row, 1, "opinions", "category")?;
        let mean: f64 = row_helpers::get(row, 2, "opinions", "emotion_score")?;
        found.push((category, count, mean));
    }
    Ok(Category::ALL
        .into_iter()
        .map(|category| {
            let (count, mean_emotion) = found
                .iter()
                .find(|(c, _, _)| *c == category)
                .map(|(_, n, m)| (*n, *m))
                .unwrap_or((0, 0.0));
            CategoryStat {
                category,
                count,
                mean_emotion,
            }
        })
        .collect())
}

fn row_to_opinion(row: &rusqlite::Row<'_>) -> Result<OpinionRow, StoreError> {
    let source: String = row_helpers::get(row, 2, "opinions", "source_type")?;
    let category: String = row_helpers::get(row, 4, "opinions", "category")?;
    Ok(OpinionRow {
        id: OpinionId::from_raw(row_helpers::get::<String>(row, 0, "opinions", "id")?),
        user_id: row_helpers::get_opt::<String>(row, 1, "opinions", "user_id")?.map(UserId::from_raw),
        source: row_helpers::parse_enum(&source, "opinions", "source_type")?,
        content: row_helpers::get(row, 3, "opinions", "content")?,
        category: row_helpers::parse_enum(&category, "opinions", "category")?,
        emotion_score: row_helpers::get(row, 5, "opinions", "emotion_score")?,
        session_id: row_helpers::get_opt::<String>(row, 6, "opinions", "session_id")?
            .map(ChatSessionId::from_raw),
        created_at: row_helpers::get_time(row, 7, "opinions", "created_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::users::UserRepo;
    use secrecy::SecretString;

    fn record(category: Category, score: u8) -> SummaryRecord {
        SummaryRecord {
            summary: "More buses in the evening".into(),
            category,
            emotion_score: score,
        }
    }

    fn user(db: &Database) -> UserId {
        UserRepo::new(db.clone())
            .get_or_create("U1", &SecretString::from("s".to_string()), Utc::now())
            .unwrap()
            .id
    }

    #[test]
    fn create_and_get() {
        let db = Database::in_memory().unwrap();
        let uid = user(&db);
        let repo = OpinionRepo::new(db);
        let id = repo
            .create(Some(&uid), OpinionSource::FreeForm, &record(Category::Transportation, 7), Utc::now())
            .unwrap();
        let row = repo.get(&id).unwrap();
        assert_eq!(row.user_id, Some(uid));
        assert_eq!(row.source, OpinionSource::FreeForm);
        assert_eq!(row.category, Category::Transportation);
        assert_eq!(row.emotion_score, 7);
        assert!(row.session_id.is_none());
    }

    #[test]
    fn user_deletion_nullifies_reference() {
        let db = Database::in_memory().unwrap();
        let uid = user(&db);
        let repo = OpinionRepo::new(db.clone());
        let id = repo
            .create(Some(&uid), OpinionSource::Chat, &record(Category::Welfare, 3), Utc::now())
            .unwrap();
        UserRepo::new(db).delete(&uid).unwrap();
        let row = repo.get(&id).unwrap();
        assert!(row.user_id.is_none());
        assert_eq!(row.content, "More buses in the evening");
    }

    #[test]
    fn list_filters_by_category() {
        let db = Database::in_memory().unwrap();
        let repo = OpinionRepo::new(db);
        for c in [Category::Education, Category::Education, Category::Other] {
            repo.create(None, OpinionSource::TextMessage, &record(c, 5), Utc::now()).unwrap();
        }
        assert_eq!(repo.list(Some(Category::Education), 10).unwrap().len(), 2);
        assert_eq!(repo.list(None, 10).unwrap().len(), 3);
        assert_eq!(repo.list(None, 1).unwrap().len(), 1);
        assert_eq!(repo.count().unwrap(), 3);
    }

    #[test]
    fn category_stats_cover_every_category() {
        let db = Database::in_memory().unwrap();
        let repo = OpinionRepo::new(db);
        repo.create(None, OpinionSource::Chat, &record(Category::Healthcare, 2), Utc::now()).unwrap();
        repo.create(None, OpinionSource::Chat, &record(Category::Healthcare, 6), Utc::now()).unwrap();

        let stats = repo.category_stats().unwrap();
        assert_eq!(stats.len(), Category::ALL.len());
        let health = stats.iter().find(|s| s.category == Category::Healthcare).unwrap();
        assert_eq!(health.count, 2);
        assert!((health.mean_emotion - 4.0).abs() < f64::EPSILON);
        let other = stats.iter().find(|s| s.category == Category::Other).unwrap();
        assert_eq!(other.count, 0);
    }

    #[test]
    fn source_round_trip_strings() {
        for s in [OpinionSource::Chat, OpinionSource::FreeForm, OpinionSource::TextMessage] {
            assert_eq!(s.to_string().parse::<OpinionSource>().unwrap(), s);
        }
        assert!("email".parse::<OpinionSource>().is_err());
    }
}
