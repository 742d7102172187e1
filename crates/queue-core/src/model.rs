//! Job record shapes shared by every driver.
//!
//! The driver owns mutation of these records; the queue core only ever reads
//! them through a [`ReservedJob`] handle.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque handle identifying the current lease holder for a reserved job.
///
/// Required to detect a stale worker trying to complete a job whose lease
/// has already expired and been re-reserved by someone else.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LeaseToken(pub u64);

impl LeaseToken {
    /// The token before any lease has ever been acquired for a job.
    pub const NONE: LeaseToken = LeaseToken(0);

    /// Return the next token in sequence.
    pub fn next(self) -> LeaseToken {
        LeaseToken(self.0 + 1)
    }
}

/// Status of a job record, as seen from outside the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    /// Eligible (or will become eligible once `delay_until` passes) for reserve.
    Waiting,
    /// Currently leased by a worker.
    Reserved,
    /// Terminal: completed successfully or failed permanently.
    Done,
}

/// Scheduling and retry options for [`crate::queue::QueueCore::add_job`].
///
/// Built exclusively through the per-call fluent methods below; there is no
/// shared mutable builder state, so concurrent producers never step on each
/// other's options.
#[derive(Debug, Clone)]
pub struct AddJobOptions {
    pub(crate) ttr_secs: u64,
    pub(crate) delay_secs: u64,
    pub(crate) priority: i64,
    pub(crate) max_attempts: u32,
}

impl Default for AddJobOptions {
    fn default() -> Self {
        Self {
            ttr_secs: 60,
            delay_secs: 0,
            priority: 0,
            max_attempts: 1,
        }
    }
}

impl AddJobOptions {
    /// Start from defaults: `ttr` 60s, no delay, priority 0, no retries.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the lease duration, in seconds, once the job is reserved.
    pub fn with_ttr(mut self, secs: u64) -> Self {
        self.ttr_secs = secs;
        self
    }

    /// Delay eligibility by this many seconds from the moment of `add_job`.
    pub fn with_delay(mut self, secs: u64) -> Self {
        self.delay_secs = secs;
        self
    }

    /// Set the job's priority; higher sorts earlier.
    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    /// Set the maximum number of attempts. `1` means no retry.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub(crate) fn validate(&self) -> Result<(), crate::error::QueueError> {
        if self.ttr_secs == 0 {
            return Err(crate::error::QueueError::Validation(
                "ttr must be greater than zero".into(),
            ));
        }
        if self.max_attempts == 0 {
            return Err(crate::error::QueueError::Validation(
                "max_attempts must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Metadata describing a job, visible to drivers and to handler contexts.
///
/// This is the data every [`crate::driver::Driver`] persists alongside the
/// opaque payload bytes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobMeta {
    pub id: Uuid,
    pub name: String,
    pub priority: i64,
    pub delay_until: Option<DateTime<Utc>>,
    pub ttr_secs: u64,
    pub attempt: u32,
    pub max_attempts: u32,
    pub pushed_at: DateTime<Utc>,
    pub reserved_at: Option<DateTime<Utc>>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub status: JobStatus,
}

impl JobMeta {
    /// Construct the metadata for a freshly pushed job.
    pub fn new(id: Uuid, name: impl Into<String>, opts: &AddJobOptions, now: DateTime<Utc>) -> Self {
        let delay_until = if opts.delay_secs > 0 {
            Some(now + chrono::Duration::seconds(opts.delay_secs as i64))
        } else {
            None
        };
        Self {
            id,
            name: name.into(),
            priority: opts.priority,
            delay_until,
            ttr_secs: opts.ttr_secs,
            attempt: 0,
            max_attempts: opts.max_attempts,
            pushed_at: now,
            reserved_at: None,
            lease_expires_at: None,
            status: JobStatus::Waiting,
        }
    }

    /// Whether this job is eligible for reservation at `now`.
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Waiting && self.delay_until.map(|d| d <= now).unwrap_or(true)
    }
}

/// A job handed to a worker by [`crate::driver::Driver::reserve`].
///
/// Carries everything the queue core needs to dispatch the job and, later,
/// to call back into the driver with `complete`/`fail`/`retry`.
#[derive(Debug, Clone)]
pub struct ReservedJob {
    pub id: Uuid,
    pub name: String,
    pub payload: Vec<u8>,
    pub meta: JobMeta,
    pub lease_token: LeaseToken,
}

/// Declares what a driver variant supports, so the queue core can adapt its
/// polling behavior instead of assuming every backend looks the same.
#[derive(Debug, Clone, Copy)]
pub struct DriverCapabilities {
    pub supports_priority: bool,
    pub supports_delayed_jobs: bool,
    pub supports_blocking_reserve: bool,
}
