//! Durable [`Driver`] that stores one job per file.
//!
//! Layout, rooted at the directory passed to [`FileDriver::open`]:
//!
//! ```text
//! <root>/waiting/<invPriority>-<pushedAtNanos>-<id>.job
//! <root>/reserved/<id>.job
//! <root>/done/<id>.job
//! ```
//!
//! The waiting filename encodes the sort key so a lexicographically-sorted
//! directory listing already yields reserve order: highest priority first,
//! ties broken by earliest push. Reservation is a `rename` from `waiting/`
//! into `reserved/<id>.job` — an atomic move used as a directory-based
//! compare-and-swap: only one reserver's rename of a given source file can
//! succeed, everyone else sees `NotFound` and moves to the next candidate.
//! A crash between moves loses nothing: `recover_expired_leases` scans
//! `reserved/` for stale leases on every `reserve`.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use queue_core::{
    lease_expiry_transition, AddJobOptions, Driver, DriverCapabilities, JobMeta, JobStatus,
    LeaseToken, QueueError, QueueResult, ReservedJob,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Serialize, Deserialize)]
struct FileRecord {
    meta: JobMeta,
    payload: Vec<u8>,
    lease_token: LeaseToken,
    last_error: Option<String>,
}

/// A directory-backed [`Driver`]. Jobs survive a process restart; concurrent
/// reservation across processes is correct as long as they share the same
/// filesystem and it honors atomic rename.
pub struct FileDriver {
    root: PathBuf,
}

impl FileDriver {
    /// Open (creating if necessary) a queue rooted at `root`.
    pub async fn open(root: impl Into<PathBuf>) -> std::io::Result<Self> {
        let root = root.into();
        for sub in ["waiting", "reserved", "done"] {
            tokio::fs::create_dir_all(root.join(sub)).await?;
        }
        Ok(Self { root })
    }

    fn waiting_dir(&self) -> PathBuf {
        self.root.join("waiting")
    }

    fn reserved_dir(&self) -> PathBuf {
        self.root.join("reserved")
    }

    fn done_dir(&self) -> PathBuf {
        self.root.join("done")
    }

    fn reserved_path(&self, id: Uuid) -> PathBuf {
        self.reserved_dir().join(format!("{id}.job"))
    }

    fn done_path(&self, id: Uuid) -> PathBuf {
        self.done_dir().join(format!("{id}.job"))
    }

    async fn write_record(path: &Path, record: &FileRecord) -> std::io::Result<()> {
        let bytes = serde_json::to_vec_pretty(record).expect("FileRecord always serializes");
        let tmp = path.with_extension("job.tmp");
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }

    async fn read_record(path: &Path) -> std::io::Result<FileRecord> {
        let bytes = tokio::fs::read(path).await?;
        serde_json::from_slice(&bytes)
            .map_err(|e| std::io::Error::new(ErrorKind::InvalidData, e))
    }

    async fn load_reserved(&self, id: Uuid) -> QueueResult<Option<FileRecord>> {
        match Self::read_record(&self.reserved_path(id)).await {
            Ok(record) => Ok(Some(record)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(QueueError::Backend(e.into())),
        }
    }

    /// Sweep `reserved/` for leases past their expiry, per the shared
    /// recovery contract. Jobs that run out of attempts become `done`; the
    /// rest go back to `waiting/` with a bumped attempt count.
    async fn recover(&self, now: DateTime<Utc>) -> QueueResult<u64> {
        let mut recovered = 0u64;
        let mut entries = match tokio::fs::read_dir(self.reserved_dir()).await {
            Ok(entries) => entries,
            Err(e) => return Err(QueueError::Backend(e.into())),
        };

        while let Some(entry) = entries.next_entry().await.map_err(|e| QueueError::Backend(e.into()))? {
            let path = entry.path();
            let Ok(mut record) = Self::read_record(&path).await else {
                continue;
            };
            if record.meta.status != JobStatus::Reserved {
                continue;
            }
            let Some(expires_at) = record.meta.lease_expires_at else {
                continue;
            };
            if expires_at > now {
                continue;
            }

            let (next_attempt, became_dead) = lease_expiry_transition(&record.meta);
            record.meta.reserved_at = None;
            record.meta.lease_expires_at = None;
            record.lease_token = LeaseToken::NONE;
            record.last_error = Some("lease expired".to_string());

            if became_dead {
                record.meta.status = JobStatus::Done;
                Self::write_record(&self.done_path(record.meta.id), &record)
                    .await
                    .map_err(|e| QueueError::Backend(e.into()))?;
            } else {
                record.meta.status = JobStatus::Waiting;
                record.meta.attempt = next_attempt;
                let target = self.waiting_dir().join(waiting_filename(&record.meta));
                Self::write_record(&target, &record)
                    .await
                    .map_err(|e| QueueError::Backend(e.into()))?;
            }

            let _ = tokio::fs::remove_file(&path).await;
            recovered += 1;
        }

        if recovered > 0 {
            tracing::warn!(recovered, "recovered expired leases");
        }
        Ok(recovered)
    }
}

fn priority_key(priority: i64) -> u64 {
    let biased = (priority as i128 - i64::MIN as i128) as u64;
    u64::MAX - biased
}

fn waiting_filename(meta: &JobMeta) -> String {
    let nanos = meta.pushed_at.timestamp_nanos_opt().unwrap_or(0);
    format!(
        "{:020}-{:020}-{}.job",
        priority_key(meta.priority),
        nanos,
        meta.id
    )
}

#[async_trait]
impl Driver for FileDriver {
    async fn push(&self, payload: Vec<u8>, name: &str, opts: &AddJobOptions) -> QueueResult<Uuid> {
        let id = Uuid::new_v4();
        let now = Utc::now();
        let meta = JobMeta::new(id, name, opts, now);
        let record = FileRecord {
            meta,
            payload,
            lease_token: LeaseToken::NONE,
            last_error: None,
        };

        let path = self.waiting_dir().join(waiting_filename(&record.meta));
        Self::write_record(&path, &record)
            .await
            .map_err(|e| QueueError::Backend(e.into()))?;
        tracing::debug!(job_id = %id, job_name = name, "pushed job");
        Ok(id)
    }

    async fn reserve(&self, _poll_timeout: Duration) -> QueueResult<Option<ReservedJob>> {
        self.recover(Utc::now()).await?;
        self.try_reserve_one(Utc::now()).await
    }

    async fn complete(&self, id: Uuid, lease_token: LeaseToken) -> QueueResult<bool> {
        let Some(mut record) = self.load_reserved(id).await? else {
            return Ok(false);
        };
        if record.meta.status != JobStatus::Reserved || record.lease_token != lease_token {
            return Ok(false);
        }
        record.meta.status = JobStatus::Done;
        record.meta.reserved_at = None;
        record.meta.lease_expires_at = None;

        Self::write_record(&self.done_path(id), &record)
            .await
            .map_err(|e| QueueError::Backend(e.into()))?;
        tokio::fs::remove_file(self.reserved_path(id))
            .await
            .map_err(|e| QueueError::Backend(e.into()))?;
        Ok(true)
    }

    async fn fail(&self, id: Uuid, lease_token: LeaseToken, error: &str) -> QueueResult<bool> {
        let Some(mut record) = self.load_reserved(id).await? else {
            return Ok(false);
        };
        if record.meta.status != JobStatus::Reserved || record.lease_token != lease_token {
            return Ok(false);
        }
        record.meta.status = JobStatus::Done;
        record.meta.reserved_at = None;
        record.meta.lease_expires_at = None;
        record.last_error = Some(error.to_string());

        Self::write_record(&self.done_path(id), &record)
            .await
            .map_err(|e| QueueError::Backend(e.into()))?;
        tokio::fs::remove_file(self.reserved_path(id))
            .await
            .map_err(|e| QueueError::Backend(e.into()))?;
        Ok(true)
    }

    async fn retry(
        &self,
        id: Uuid,
        lease_token: LeaseToken,
        next_attempt: u32,
        delay: Duration,
    ) -> QueueResult<bool> {
        let Some(mut record) = self.load_reserved(id).await? else {
            return Ok(false);
        };
        if record.meta.status != JobStatus::Reserved || record.lease_token != lease_token {
            return Ok(false);
        }

        record.meta.status = JobStatus::Waiting;
        record.meta.attempt = next_attempt;
        record.meta.reserved_at = None;
        record.meta.lease_expires_at = None;
        record.lease_token = LeaseToken::NONE;
        if !delay.is_zero() {
            record.meta.delay_until = Some(
                Utc::now() + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero()),
            );
        } else {
            record.meta.delay_until = None;
        }

        let target = self.waiting_dir().join(waiting_filename(&record.meta));
        Self::write_record(&target, &record)
            .await
            .map_err(|e| QueueError::Backend(e.into()))?;
        tokio::fs::remove_file(self.reserved_path(id))
            .await
            .map_err(|e| QueueError::Backend(e.into()))?;
        Ok(true)
    }

    async fn recover_expired_leases(&self, now: DateTime<Utc>) -> QueueResult<u64> {
        self.recover(now).await
    }

    async fn status(&self, id: Uuid) -> QueueResult<Option<JobStatus>> {
        if let Ok(record) = Self::read_record(&self.done_path(id)).await {
            return Ok(Some(record.meta.status));
        }
        if let Ok(record) = Self::read_record(&self.reserved_path(id)).await {
            return Ok(Some(record.meta.status));
        }

        let suffix = format!("-{id}.job");
        let mut entries = match tokio::fs::read_dir(self.waiting_dir()).await {
            Ok(entries) => entries,
            Err(e) => return Err(QueueError::Backend(e.into())),
        };
        while let Some(entry) = entries.next_entry().await.map_err(|e| QueueError::Backend(e.into()))? {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.ends_with(&suffix) {
                return Ok(Some(JobStatus::Waiting));
            }
        }
        Ok(None)
    }

    fn capabilities(&self) -> DriverCapabilities {
        DriverCapabilities {
            supports_priority: true,
            supports_delayed_jobs: true,
            supports_blocking_reserve: false,
        }
    }
}

impl FileDriver {
    /// Single reservation attempt: scan `waiting/` in sort order, skip
    /// records that aren't eligible yet, and claim the first one whose
    /// rename wins the race.
    async fn try_reserve_one(&self, now: DateTime<Utc>) -> QueueResult<Option<ReservedJob>> {
        let mut names = Vec::new();
        let mut entries = match tokio::fs::read_dir(self.waiting_dir()).await {
            Ok(entries) => entries,
            Err(e) => return Err(QueueError::Backend(e.into())),
        };
        while let Some(entry) = entries.next_entry().await.map_err(|e| QueueError::Backend(e.into()))? {
            names.push(entry.path());
        }
        names.sort();

        for path in names {
            let Ok(record) = Self::read_record(&path).await else {
                continue;
            };
            if !record.meta.is_eligible(now) {
                continue;
            }

            let id = record.meta.id;
            let dest = self.reserved_path(id);
            if tokio::fs::rename(&path, &dest).await.is_err() {
                continue;
            }

            let mut record = record;
            let token = LeaseToken(fastrand::u64(1..=u64::MAX));
            record.meta.status = JobStatus::Reserved;
            record.meta.reserved_at = Some(now);
            record.meta.lease_expires_at =
                Some(now + chrono::Duration::seconds(record.meta.ttr_secs as i64));
            record.lease_token = token;

            Self::write_record(&dest, &record)
                .await
                .map_err(|e| QueueError::Backend(e.into()))?;

            tracing::debug!(job_id = %id, "reserved job");
            return Ok(Some(ReservedJob {
                id,
                name: record.meta.name.clone(),
                payload: record.payload,
                meta: record.meta,
                lease_token: token,
            }));
        }

        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn driver() -> (FileDriver, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let driver = FileDriver::open(dir.path()).await.unwrap();
        (driver, dir)
    }

    #[tokio::test]
    async fn push_then_reserve_round_trip() {
        let (driver, _dir) = driver().await;
        let id = driver
            .push(b"hi".to_vec(), "greet", &AddJobOptions::new())
            .await
            .unwrap();

        let reserved = driver
            .reserve(Duration::from_millis(10))
            .await
            .unwrap()
            .expect("job should be reserved");
        assert_eq!(reserved.id, id);
        assert_eq!(reserved.payload, b"hi");

        assert!(driver.complete(id, reserved.lease_token).await.unwrap());
        assert_eq!(driver.status(id).await.unwrap(), Some(JobStatus::Done));
    }

    #[tokio::test]
    async fn higher_priority_reserved_first() {
        let (driver, _dir) = driver().await;
        let low = driver
            .push(b"low".to_vec(), "job", &AddJobOptions::new().with_priority(0))
            .await
            .unwrap();
        let high = driver
            .push(b"high".to_vec(), "job", &AddJobOptions::new().with_priority(10))
            .await
            .unwrap();

        let first = driver.reserve(Duration::from_millis(10)).await.unwrap().unwrap();
        assert_eq!(first.id, high);
        driver.complete(high, first.lease_token).await.unwrap();

        let second = driver.reserve(Duration::from_millis(10)).await.unwrap().unwrap();
        assert_eq!(second.id, low);
    }

    #[tokio::test]
    async fn delayed_job_not_eligible_until_delay_elapses() {
        let (driver, _dir) = driver().await;
        driver
            .push(b"later".to_vec(), "job", &AddJobOptions::new().with_delay(3600))
            .await
            .unwrap();

        let reserved = driver.reserve(Duration::from_millis(10)).await.unwrap();
        assert!(reserved.is_none());
    }

    #[tokio::test]
    async fn survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let id = {
            let driver = FileDriver::open(dir.path()).await.unwrap();
            driver
                .push(b"x".to_vec(), "job", &AddJobOptions::new())
                .await
                .unwrap()
        };

        let reopened = FileDriver::open(dir.path()).await.unwrap();
        let reserved = reopened
            .reserve(Duration::from_millis(10))
            .await
            .unwrap()
            .expect("job should survive reopen");
        assert_eq!(reserved.id, id);
    }

    #[tokio::test]
    async fn recover_expired_leases_requeues_job() {
        let (driver, _dir) = driver().await;
        let id = driver
            .push(
                b"x".to_vec(),
                "job",
                &AddJobOptions::new().with_ttr(1).with_max_attempts(3),
            )
            .await
            .unwrap();
        driver.reserve(Duration::from_millis(10)).await.unwrap();

        let far_future = Utc::now() + chrono::Duration::seconds(5);
        let recovered = driver.recover_expired_leases(far_future).await.unwrap();
        assert_eq!(recovered, 1);
        assert_eq!(driver.status(id).await.unwrap(), Some(JobStatus::Waiting));
    }
}
