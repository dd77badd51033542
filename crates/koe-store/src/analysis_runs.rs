use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use koe_core::clock::{to_stored, Clock};
use koe_core::ids::AnalysisRunId;

use crate::database::Database;
use crate::error::StoreError;
use crate::opinions::{self, CategoryStat};
use crate::row_helpers;

/// One completed batch analysis. Only successful runs are recorded.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AnalysisRunRow {
    pub id: AnalysisRunId,
    pub job: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub elapsed_ms: i64,
    pub result: serde_json::Value,
}

pub(crate) fn insert(
    conn: &Connection,
    job: &str,
    started_at: DateTime<Utc>,
    finished_at: DateTime<Utc>,
    result: &serde_json::Value,
) -> Result<AnalysisRunId, StoreError> {
    let id = AnalysisRunId::new();
    let elapsed_ms = (finished_at - started_at).num_milliseconds().max(0);
    conn.execute(
        "INSERT INTO analysis_runs (id, job, started_at, finished_at, elapsed_ms, result)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        rusqlite::params![
            id.as_str(),
            job,
            to_stored(started_at),
            to_stored(finished_at),
            elapsed_ms,
            serde_json::to_string(result)?,
        ],
    )?;
    Ok(id)
}

pub struct AnalysisRunRepo {
    db: Database,
}

impl AnalysisRunRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Snapshot the per-category statistics and record them as one run, in a
    /// single transaction. `finished_at` is read from `clock` once the
    /// statistics are computed.
    #[instrument(skip(self, clock))]
    pub fn record_category_tally(
        &self,
        job: &str,
        started_at: DateTime<Utc>,
        clock: &dyn Clock,
    ) -> Result<(AnalysisRunId, Vec<CategoryStat>), StoreError> {
        self.db.with_tx(|tx| {
            let stats = opinions::category_stats(tx)?;
            let result = serde_json::to_value(&stats)?;
            let id = insert(tx, job, started_at, clock.now(), &result)?;
            Ok((id, stats))
        })
    }

    /// Most recent runs first.
    pub fn list(&self, limit: u32) -> Result<Vec<AnalysisRunRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, job, started_at, finished_at, elapsed_ms, result
                 FROM analysis_runs ORDER BY started_at DESC, id DESC LIMIT ?1",
            )?;
            let mut rows = stmt.query([limit])?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                out.push(row_to_run(row)?);
            }
            Ok(out)
        })
    }
}

fn row_to_run(row: &rusqlite::Row<'_>) -> Result<AnalysisRunRow, StoreError> {
    let raw: String = row_helpers::get(row, 5, "analysis_runs", "result")?;
    let result = serde_json::from_str(&raw).map_err(|e| StoreError::CorruptRow {
        table: "analysis_runs",
        column: "result",
        detail: e.to_string(),
    })?;
    Ok(AnalysisRunRow {
        id: AnalysisRunId::from_raw(row_helpers::get::<String>(row, 0, "analysis_runs", "id")?),
        job: row_helpers::get(row, 1, "analysis_runs", "job")?,
        started_at: row_helpers::get_time(row, 2, "analysis_runs", "started_at")?,
        finished_at: row_helpers::get_time(row, 3, "analysis_runs", "finished_at")?,
        elapsed_ms: row_helpers::get(row, 4, "analysis_runs", "elapsed_ms")?,
        result,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::opinions::{OpinionRepo, OpinionSource};
    use chrono::{Duration, TimeZone};
    use koe_core::clock::{ManualClock, SystemClock};
    use koe_core::summary::{Category, SummaryRecord};
    use parking_lot::Mutex;

    /// Moves forward by a fixed step every time it is read.
    struct SteppingClock {
        now: Mutex<DateTime<Utc>>,
        step: Duration,
    }

    impl Clock for SteppingClock {
        fn now(&self) -> DateTime<Utc> {
            let mut now = self.now.lock();
            *now += self.step;
            *now
        }
    }

    #[test]
    fn finish_time_is_taken_after_the_tally() {
        let start = Utc.with_ymd_and_hms(2026, 4, 1, 9, 0, 0).unwrap();
        let clock = SteppingClock {
            now: Mutex::new(start),
            step: Duration::milliseconds(1500),
        };
        let repo = AnalysisRunRepo::new(Database::in_memory().unwrap());
        let (id, _) = repo.record_category_tally("category_tally", start, &clock).unwrap();

        let runs = repo.list(10).unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].id, id);
        assert_eq!(runs[0].finished_at, start + Duration::milliseconds(1500));
        assert_eq!(runs[0].elapsed_ms, 1500);
    }

    #[test]
    fn clock_behind_start_records_zero_elapsed() {
        let start = Utc.with_ymd_and_hms(2026, 4, 1, 9, 0, 0).unwrap();
        let clock = ManualClock::new(start - Duration::seconds(3));
        let repo = AnalysisRunRepo::new(Database::in_memory().unwrap());
        repo.record_category_tally("category_tally", start, &clock).unwrap();
        assert_eq!(repo.list(1).unwrap()[0].elapsed_ms, 0);
    }

    #[test]
    fn category_tally_snapshot() {
        let db = Database::in_memory().unwrap();
        OpinionRepo::new(db.clone())
            .create(
                None,
                OpinionSource::Chat,
                &SummaryRecord {
                    summary: "Flooding on the river path".into(),
                    category: Category::DisasterPrevention,
                    emotion_score: 2,
                },
                Utc::now(),
            )
            .unwrap();

        let repo = AnalysisRunRepo::new(db);
        let (_, stats) = repo
            .record_category_tally("category_tally", Utc::now(), &SystemClock)
            .unwrap();
        let disaster = stats
            .iter()
            .find(|s| s.category == Category::DisasterPrevention)
            .unwrap();
        assert_eq!(disaster.count, 1);

        let runs = repo.list(1).unwrap();
        assert_eq!(runs[0].job, "category_tally");
        assert!(runs[0].result.as_array().is_some_and(|a| a.len() == Category::ALL.len()));
    }

    #[test]
    fn corrupt_result_is_reported() {
        let db = Database::in_memory().unwrap();
        db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO analysis_runs (id, job, started_at, finished_at, elapsed_ms, result)
                 VALUES ('run_x', 'j', ?1, ?1, 0, 'not json')",
                [to_stored(Utc::now())],
            )?;
            Ok(())
        })
        .unwrap();
        let err = AnalysisRunRepo::new(db).list(5).unwrap_err();
        assert!(matches!(err, StoreError::CorruptRow { column: "result", .. }));
    }
}
