//! Exclusive, cross-process lock for the batch analysis job.
//!
//! The lock is a JSON record file stamped with the holder's owner id and
//! acquisition time. Creation is atomic (the full record is written to a
//! private temp file and hard-linked into place), release only removes a
//! record the caller owns, and a record older than the configured max age
//! may be removed by anyone. Stale removal is serialized by a reclaim guard
//! file and goes through a rename, so it does not delete a record another
//! caller just created.

use std::future::Future;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use koe_core::settings::LockSettings;

pub const DEFAULT_LOCK_NAME: &str = "analysis";

#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("lock io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("lock record serialization: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Another holder kept the lock for the whole wait. Retry later.
    #[error("lock not acquired within {0:?}")]
    Timeout(Duration),
}

impl LockError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }
}

#[derive(Clone, Debug)]
pub struct LockConfig {
    pub dir: PathBuf,
    pub name: String,
    pub max_age: Duration,
    pub poll_interval: Duration,
}

impl From<&LockSettings> for LockConfig {
    fn from(settings: &LockSettings) -> Self {
        Self {
            dir: settings.dir.clone(),
            name: DEFAULT_LOCK_NAME.to_string(),
            max_age: Duration::from_secs(settings.max_age_secs),
            poll_interval: Duration::from_millis(settings.poll_interval_ms),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    pub owner: String,
    pub acquired_at: DateTime<Utc>,
}

/// Snapshot of the current holder.
#[derive(Clone, Debug)]
pub struct LockInfo {
    pub owner: String,
    pub acquired_at: DateTime<Utc>,
    pub age: chrono::Duration,
    pub stale: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReleaseOutcome {
    Released,
    /// No record existed.
    NotHeld,
    /// Someone else holds the lock; it was left alone.
    NotOwner(String),
    /// The record could not be parsed. The next acquire purges it.
    Unreadable,
}

enum Observed {
    Free,
    Held(LockRecord),
    Corrupt(String),
}

pub struct AnalysisLock {
    config: LockConfig,
    owner: String,
}

impl AnalysisLock {
    /// Lock handle with a fresh owner id unique to this process and handle.
    pub fn new(config: LockConfig) -> Self {
        let owner = format!("{}:{}", std::process::id(), uuid::Uuid::now_v7());
        Self::with_owner(config, owner)
    }

    pub fn with_owner(config: LockConfig, owner: impl Into<String>) -> Self {
        Self {
            config,
            owner: owner.into(),
        }
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn path(&self) -> PathBuf {
        self.config.dir.join(format!("{}.lock", self.config.name))
    }

    /// Try to take the lock, polling until `timeout` elapses. Returns false
    /// if it is still held by someone else at the deadline; the existing
    /// record is never touched unless it is stale.
    pub async fn acquire(&self, timeout: Duration) -> Result<bool, LockError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            self.reclaim_if_stale()?;
            if self.try_create()? {
                info!(owner = %self.owner, path = %self.path().display(), "analysis lock acquired");
                return Ok(true);
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                debug!(owner = %self.owner, ?timeout, "analysis lock busy");
                return Ok(false);
            }
            tokio::time::sleep(self.config.poll_interval.min(deadline - now)).await;
        }
    }

    /// Remove the record if this handle owns it.
    pub fn release(&self) -> Result<ReleaseOutcome, LockError> {
        match self.observe()? {
            Observed::Held(record) if record.owner == self.owner => {
                remove_if_exists(&self.path())?;
                info!(owner = %self.owner, "analysis lock released");
                Ok(ReleaseOutcome::Released)
            }
            Observed::Held(record) => {
                warn!(owner = %self.owner, holder = %record.owner, "release by non-owner ignored");
                Ok(ReleaseOutcome::NotOwner(record.owner))
            }
            Observed::Corrupt(_) => {
                warn!(owner = %self.owner, "release found an unreadable record, left for reclaim");
                Ok(ReleaseOutcome::Unreadable)
            }
            Observed::Free => {
                debug!(owner = %self.owner, "release with no lock held");
                Ok(ReleaseOutcome::NotHeld)
            }
        }
    }

    /// True if a non-stale record exists.
    pub fn is_locked(&self) -> Result<bool, LockError> {
        Ok(self.info()?.is_some_and(|info| !info.stale))
    }

    pub fn info(&self) -> Result<Option<LockInfo>, LockError> {
        Ok(match self.observe()? {
            Observed::Held(record) => {
                let age = Utc::now() - record.acquired_at;
                Some(LockInfo {
                    stale: self.is_stale(&record),
                    owner: record.owner,
                    acquired_at: record.acquired_at,
                    age,
                })
            }
            Observed::Free | Observed::Corrupt(_) => None,
        })
    }

    /// Acquire, run `job`, and release, even if the job future is dropped
    /// early. A busy lock yields `LockError::Timeout` and `job` never runs.
    pub async fn run_exclusive<F, Fut, T>(&self, timeout: Duration, job: F) -> Result<T, LockError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        if !self.acquire(timeout).await? {
            return Err(LockError::Timeout(timeout));
        }
        let _guard = ReleaseOnDrop(self);
        Ok(job().await)
    }

    fn is_stale(&self, record: &LockRecord) -> bool {
        match (Utc::now() - record.acquired_at).to_std() {
            Ok(age) => age > self.config.max_age,
            // Timestamp in the future: not stale.
            Err(_) => false,
        }
    }

    fn read_raw(&self) -> Result<Option<String>, LockError> {
        match std::fs::read_to_string(self.path()) {
            Ok(raw) => Ok(Some(raw)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn observe(&self) -> Result<Observed, LockError> {
        Ok(match self.read_raw()? {
            None => Observed::Free,
            Some(raw) => parse_record(&raw),
        })
    }

    fn guard_path(&self) -> PathBuf {
        self.config.dir.join(format!("{}.reclaim", self.config.name))
    }

    /// Remove a stale or unreadable record. Only one caller reclaims at a
    /// time; a caller that finds the reclaim guard taken leaves the record
    /// to the guard holder.
    fn reclaim_if_stale(&self) -> Result<(), LockError> {
        let Some(raw) = self.read_raw()? else {
            return Ok(());
        };
        let observed = parse_record(&raw);
        if let Observed::Held(record) = &observed {
            if !self.is_stale(record) {
                return Ok(());
            }
        }

        let Some(_guard) = ReclaimGuard::try_take(self.guard_path())? else {
            return Ok(());
        };
        // Another reclaimer may have replaced the record before we got the
        // guard.
        if self.read_raw()?.as_deref() != Some(raw.as_str()) {
            return Ok(());
        }
        if !self.remove_if_unchanged(&raw)? {
            return Ok(());
        }
        match observed {
            Observed::Held(record) => warn!(
                holder = %record.owner,
                age_secs = (Utc::now() - record.acquired_at).num_seconds(),
                "reclaimed stale analysis lock"
            ),
            Observed::Corrupt(detail) => warn!(%detail, "purged unreadable analysis lock record"),
            Observed::Free => {}
        }
        Ok(())
    }

    /// Delete the record only if it still reads `expected`.
    ///
    /// The record is first renamed to a private tombstone, which only one
    /// caller can do. If the tombstone turns out to hold a newer record, it
    /// is linked back into place.
    fn remove_if_unchanged(&self, expected: &str) -> Result<bool, LockError> {
        let path = self.path();
        let tombstone = self.config.dir.join(format!(
            ".{}.{}.reclaim",
            self.config.name,
            uuid::Uuid::now_v7()
        ));
        match std::fs::rename(&path, &tombstone) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        }

        let claimed = std::fs::read_to_string(&tombstone);
        let unchanged = matches!(&claimed, Ok(raw) if raw == expected);
        let restored = if unchanged {
            Ok(())
        } else {
            std::fs::hard_link(&tombstone, &path)
        };
        remove_if_exists(&tombstone)?;
        claimed?;

        match restored {
            Ok(()) => Ok(unchanged),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                // A third caller took the free path before the restore.
                error!(path = %path.display(), "lock record replaced during stale reclaim");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn try_create(&self) -> Result<bool, LockError> {
        std::fs::create_dir_all(&self.config.dir)?;
        let record = LockRecord {
            owner: self.owner.clone(),
            acquired_at: Utc::now(),
        };
        let tmp = self.config.dir.join(format!(
            ".{}.{}.tmp",
            self.config.name,
            uuid::Uuid::now_v7()
        ));
        std::fs::write(&tmp, serde_json::to_vec(&record)?)?;
        let linked = std::fs::hard_link(&tmp, self.path());
        remove_if_exists(&tmp)?;
        match linked {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

/// Marker file held for the few calls of a stale reclaim. Removed on drop.
struct ReclaimGuard(PathBuf);

impl ReclaimGuard {
    /// A guard left behind by a crashed reclaimer is removed once it is this
    /// old.
    const ABANDONED_AFTER: Duration = Duration::from_secs(30);

    fn try_take(path: PathBuf) -> Result<Option<Self>, LockError> {
        match std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
        {
            Ok(_) => Ok(Some(Self(path))),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                let abandoned = std::fs::metadata(&path)
                    .and_then(|m| m.modified())
                    .ok()
                    .and_then(|modified| modified.elapsed().ok())
                    .is_some_and(|age| age > Self::ABANDONED_AFTER);
                if abandoned {
                    remove_if_exists(&path)?;
                    warn!(path = %path.display(), "removed abandoned reclaim guard");
                }
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }
}

impl Drop for ReclaimGuard {
    fn drop(&mut self) {
        if let Err(e) = remove_if_exists(&self.0) {
            warn!(path = %self.0.display(), error = %e, "failed to remove reclaim guard");
        }
    }
}

struct ReleaseOnDrop<'a>(&'a AnalysisLock);

impl Drop for ReleaseOnDrop<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.0.release() {
            warn!(owner = %self.0.owner, error = %e, "failed to release analysis lock");
        }
    }
}

fn parse_record(raw: &str) -> Observed {
    match serde_json::from_str::<LockRecord>(raw) {
        Ok(record) => Observed::Held(record),
        Err(e) => Observed::Corrupt(e.to_string()),
    }
}

fn remove_if_exists(path: &Path) -> std::io::Result<()> {
    match std::fs::remove_file(path) {
        Err(e) if e.kind() != ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}
