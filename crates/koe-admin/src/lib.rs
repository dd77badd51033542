//! Admin trigger for the batch analysis job. At most one job runs at a time
//! across all processes sharing the lock directory.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Serialize;
use tracing::{info, instrument, warn};

use koe_core::clock::Clock;
use koe_lock::{AnalysisLock, LockError};
use koe_store::analysis_runs::AnalysisRunRepo;
use koe_store::{Database, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum AdminError {
    /// Another analysis is running. Retry later.
    #[error("analysis already running, try again later")]
    Busy,

    #[error(transparent)]
    Lock(LockError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("job failed: {0}")]
    Job(String),
}

impl AdminError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Busy)
    }
}

impl From<LockError> for AdminError {
    fn from(e: LockError) -> Self {
        match e {
            LockError::Timeout(_) => Self::Busy,
            other => Self::Lock(other),
        }
    }
}

/// A long-running, non-reentrant batch job. Implementations persist their
/// output in one transaction at the end, so a failed run leaves nothing
/// behind.
#[async_trait]
pub trait AnalysisJob: Send + Sync {
    fn name(&self) -> &str;

    async fn run(&self) -> Result<serde_json::Value, AdminError>;
}

#[derive(Clone, Debug, Serialize)]
pub struct AnalysisReport {
    pub job: String,
    pub elapsed: Duration,
    pub summary: serde_json::Value,
}

/// Counts opinions per category with their mean emotion score.
pub struct CategoryTally {
    db: Database,
    clock: Arc<dyn Clock>,
}

impl CategoryTally {
    pub const NAME: &'static str = "category_tally";

    pub fn new(db: Database, clock: Arc<dyn Clock>) -> Self {
        Self { db, clock }
    }
}

#[async_trait]
impl AnalysisJob for CategoryTally {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn run(&self) -> Result<serde_json::Value, AdminError> {
        let started = self.clock.now();
        let (run_id, stats) = AnalysisRunRepo::new(self.db.clone()).record_category_tally(
            Self::NAME,
            started,
            self.clock.as_ref(),
        )?;
        let total: i64 = stats.iter().map(|s| s.count).sum();
        Ok(serde_json::json!({
            "run_id": run_id,
            "total_opinions": total,
            "categories": stats,
        }))
    }
}

/// Run `job` under the analysis lock, waiting at most `timeout` for it.
/// `AdminError::Busy` means another run holds the lock.
#[instrument(skip(lock, job), fields(job = job.name(), owner = lock.owner()))]
pub async fn run_analysis(
    lock: &AnalysisLock,
    job: &dyn AnalysisJob,
    timeout: Duration,
) -> Result<AnalysisReport, AdminError> {
    let outcome = lock
        .run_exclusive(timeout, || async {
            let started = Instant::now();
            let result = job.run().await;
            (result, started.elapsed())
        })
        .await;

    let (result, elapsed) = match outcome {
        Ok(done) => done,
        Err(e) => {
            let e = AdminError::from(e);
            if e.is_retryable() {
                info!(?timeout, "analysis skipped, lock busy");
            }
            return Err(e);
        }
    };

    match result {
        Ok(summary) => {
            info!(elapsed_ms = elapsed.as_millis() as u64, "analysis finished");
            Ok(AnalysisReport {
                job: job.name().to_string(),
                elapsed,
                summary,
            })
        }
        Err(e) => {
            warn!(error = %e, elapsed_ms = elapsed.as_millis() as u64, "analysis failed");
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use koe_core::clock::SystemClock;
    use koe_core::summary::{Category, SummaryRecord};
    use koe_lock::LockConfig;
    use koe_store::opinions::{OpinionRepo, OpinionSource};

    fn lock_config() -> LockConfig {
        LockConfig {
            dir: std::env::temp_dir().join(format!("koe-admin-test-{}", uuid::Uuid::now_v7())),
            name: "analysis".into(),
            max_age: Duration::from_secs(600),
            poll_interval: Duration::from_millis(20),
        }
    }

    struct FailingJob;

    #[async_trait]
    impl AnalysisJob for FailingJob {
        fn name(&self) -> &str {
            "failing"
        }

        async fn run(&self) -> Result<serde_json::Value, AdminError> {
            Err(AdminError::Job("embedding service down".into()))
        }
    }

    fn seed(db: &Database) {
        let repo = OpinionRepo::new(db.clone());
        for (category, score) in [(Category::Childcare, 8), (Category::Childcare, 4), (Category::Other, 1)] {
            repo.create(
                None,
                OpinionSource::Chat,
                &SummaryRecord {
                    summary: "More daycare slots".into(),
                    category,
                    emotion_score: score,
                },
                Utc::now(),
            )
            .unwrap();
        }
    }

    #[tokio::test]
    async fn tally_runs_and_reports() {
        let cfg = lock_config();
        let db = Database::in_memory().unwrap();
        seed(&db);
        let lock = AnalysisLock::new(cfg.clone());
        let job = CategoryTally::new(db.clone(), Arc::new(SystemClock));

        let report = run_analysis(&lock, &job, Duration::ZERO).await.unwrap();
        assert_eq!(report.job, CategoryTally::NAME);
        assert_eq!(report.summary["total_opinions"], 3);
        let childcare = report.summary["categories"]
            .as_array()
            .unwrap()
            .iter()
            .find(|c| c["category"] == "childcare")
            .unwrap()
            .clone();
        assert_eq!(childcare["count"], 2);
        assert_eq!(childcare["mean_emotion"], 6.0);

        assert_eq!(AnalysisRunRepo::new(db).list(10).unwrap().len(), 1);
        assert!(!lock.is_locked().unwrap());
        let _ = std::fs::remove_dir_all(&cfg.dir);
    }

    #[tokio::test]
    async fn busy_lock_is_retryable_and_persists_nothing() {
        let cfg = lock_config();
        let db = Database::in_memory().unwrap();
        let holder = AnalysisLock::new(cfg.clone());
        assert!(holder.acquire(Duration::ZERO).await.unwrap());

        let lock = AnalysisLock::new(cfg.clone());
        let job = CategoryTally::new(db.clone(), Arc::new(SystemClock));
        let err = run_analysis(&lock, &job, Duration::from_millis(60)).await.unwrap_err();
        assert!(matches!(err, AdminError::Busy));
        assert!(err.is_retryable());
        assert!(AnalysisRunRepo::new(db).list(10).unwrap().is_empty());
        assert!(holder.is_locked().unwrap());
        let _ = std::fs::remove_dir_all(&cfg.dir);
    }

    #[tokio::test]
    async fn failed_job_releases_lock() {
        let cfg = lock_config();
        let lock = AnalysisLock::new(cfg.clone());
        let err = run_analysis(&lock, &FailingJob, Duration::ZERO).await.unwrap_err();
        assert!(matches!(err, AdminError::Job(_)));
        assert!(!err.is_retryable());
        assert!(!lock.is_locked().unwrap());
        let _ = std::fs::remove_dir_all(&cfg.dir);
    }
}
