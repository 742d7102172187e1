//! The driver contract: the single source of truth for ordering, leases,
//! and crash recovery.
//!
//! Variants (memory, file, SQL-table, remote-broker) each own persistence
//! and lease state; `reserve` must be linearizable against concurrent
//! `reserve`, `complete`, `retry`, and `recover_expired_leases` calls on the
//! same queue.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::QueueResult;
use crate::model::{AddJobOptions, DriverCapabilities, JobMeta, JobStatus, LeaseToken, ReservedJob};

/// Storage/transport backend implementing the reservation protocol.
///
/// Implementors MUST uphold the invariants from the data model: a job is in
/// exactly one status at a time, a reserved job always carries a non-null
/// lease token and `lease_expires_at > reserved_at`, two workers can never
/// hold the same `(id, lease_token)` simultaneously, `attempt <= max_attempts`
/// always, and a job with `delay_until > now` is never reserved.
#[async_trait]
pub trait Driver: Send + Sync + 'static {
    /// Persist a new `waiting` record and return its stable id.
    async fn push(&self, payload: Vec<u8>, name: &str, opts: &AddJobOptions) -> QueueResult<Uuid>;

    /// Atomically select and lease the next eligible job.
    ///
    /// Eligibility: `status = waiting` AND (`delay_until` absent OR
    /// `delay_until <= now`). Ordering: primary `priority DESC`, secondary
    /// `pushed_at ASC`, ties broken by `id`. May block up to `poll_timeout`
    /// if the driver supports blocking receives; otherwise returns
    /// immediately with `None`.
    async fn reserve(&self, poll_timeout: std::time::Duration) -> QueueResult<Option<ReservedJob>>;

    /// Transition the held record to `done`, only if the lease is still
    /// valid. A stale/rotated lease token is a no-op that returns
    /// `Ok(false)` rather than an error — the caller (queue core) treats the
    /// job's outcome as already handled by whoever re-reserved it.
    async fn complete(&self, id: Uuid, lease_token: LeaseToken) -> QueueResult<bool>;

    /// Mark the held record as terminally failed, persisting the error text
    /// at the driver's discretion. Same lease-validity semantics as
    /// `complete`.
    async fn fail(&self, id: Uuid, lease_token: LeaseToken, error: &str) -> QueueResult<bool>;

    /// Atomically release a held record back to `waiting` with an updated
    /// attempt count and optional backoff delay, invalidating the current
    /// lease token. Same lease-validity semantics as `complete`.
    async fn retry(
        &self,
        id: Uuid,
        lease_token: LeaseToken,
        next_attempt: u32,
        delay: std::time::Duration,
    ) -> QueueResult<bool>;

    /// Sweep for reserved jobs whose lease has expired: reset them to
    /// `waiting`, bump `attempt`, and clear lease fields; jobs that hit
    /// `max_attempts` become `done` with a synthetic "lease lost" failure.
    ///
    /// Drivers that cannot recover implicitly (no triggers, no background
    /// task) MUST call this at the top of `reserve`. Drivers that recover
    /// implicitly may implement this as a no-op.
    async fn recover_expired_leases(&self, now: DateTime<Utc>) -> QueueResult<u64>;

    /// Look up the externally-visible status of a job. `None` means unknown
    /// (the driver may not track terminal history indefinitely).
    async fn status(&self, id: Uuid) -> QueueResult<Option<JobStatus>>;

    /// Declare which optional behaviors this backend supports.
    fn capabilities(&self) -> DriverCapabilities;
}

/// Shared helper for in-process driver implementations: decide how a stored
/// [`JobMeta`] should transition when a lease has expired.
///
/// Returns `(next_attempt, became_dead)` — `became_dead` is true when the
/// bumped attempt count reached `max_attempts`, in which case the driver
/// should mark the record `done` with a synthetic failure instead of
/// `waiting`.
pub fn lease_expiry_transition(meta: &JobMeta) -> (u32, bool) {
    let next_attempt = meta.attempt + 1;
    let became_dead = next_attempt >= meta.max_attempts;
    (next_attempt, became_dead)
}
