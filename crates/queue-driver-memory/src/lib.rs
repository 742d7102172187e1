//! Non-durable, single-process [`Driver`] backed by a mutex-guarded heap.
//!
//! Useful for tests, demos, and embedding a queue inside a process that
//! doesn't need jobs to survive a restart. Every record lives only as long
//! as the `MemoryDriver` value does.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use queue_core::{
    lease_expiry_transition, AddJobOptions, Driver, DriverCapabilities, JobMeta, JobStatus,
    LeaseToken, QueueError, QueueResult, ReservedJob,
};
use tokio::sync::Notify;
use uuid::Uuid;

struct StoredJob {
    meta: JobMeta,
    payload: Vec<u8>,
    lease_token: LeaseToken,
}

/// Ordering key for the ready heap: highest `priority` first, ties broken by
/// earliest `pushed_at`, final tie-break by `id` for a total order.
#[derive(Debug, Clone, Eq, PartialEq)]
struct ReadyEntry {
    priority: i64,
    pushed_at: DateTime<Utc>,
    id: Uuid,
}

impl Ord for ReadyEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.pushed_at.cmp(&self.pushed_at))
            .then_with(|| other.id.cmp(&self.id))
    }
}

impl PartialOrd for ReadyEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Ordering key for the delayed heap: earliest `ready_at` first (a min-heap,
/// via reversed `Ord`).
#[derive(Debug, Clone, Eq, PartialEq)]
struct DelayedEntry {
    ready_at: DateTime<Utc>,
    id: Uuid,
}

impl Ord for DelayedEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .ready_at
            .cmp(&self.ready_at)
            .then_with(|| other.id.cmp(&self.id))
    }
}

impl PartialOrd for DelayedEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

struct MemoryState {
    jobs: HashMap<Uuid, StoredJob>,
    ready: BinaryHeap<ReadyEntry>,
    delayed: BinaryHeap<DelayedEntry>,
    capacity: Option<usize>,
}

impl MemoryState {
    /// Sweep reserved jobs whose lease has expired back to waiting (or to
    /// done, if they've exhausted their attempts). Shared by the explicit
    /// `recover_expired_leases` call and the implicit sweep at the top of
    /// `reserve` — this driver has no background task, so it must run this
    /// itself per the driver contract.
    fn recover_expired(&mut self, now: DateTime<Utc>) -> u64 {
        let expired: Vec<Uuid> = self
            .jobs
            .iter()
            .filter(|(_, job)| {
                job.meta.status == JobStatus::Reserved
                    && job.meta.lease_expires_at.map(|t| t <= now).unwrap_or(false)
            })
            .map(|(id, _)| *id)
            .collect();

        let recovered = expired.len() as u64;
        for id in expired {
            let Some(job) = self.jobs.get_mut(&id) else {
                continue;
            };
            let (next_attempt, became_dead) = lease_expiry_transition(&job.meta);
            job.meta.reserved_at = None;
            job.meta.lease_expires_at = None;
            job.lease_token = LeaseToken::NONE;
            if became_dead {
                job.meta.status = JobStatus::Done;
            } else {
                job.meta.status = JobStatus::Waiting;
                job.meta.attempt = next_attempt;
                self.ready.push(ReadyEntry {
                    priority: job.meta.priority,
                    pushed_at: job.meta.pushed_at,
                    id,
                });
            }
        }
        recovered
    }

    /// Move any delayed entries whose time has come into the ready heap.
    fn promote_delayed(&mut self, now: DateTime<Utc>) {
        while let Some(entry) = self.delayed.peek() {
            if entry.ready_at > now {
                break;
            }
            let entry = self.delayed.pop().unwrap();
            if let Some(job) = self.jobs.get(&entry.id) {
                if job.meta.status == JobStatus::Waiting {
                    self.ready.push(ReadyEntry {
                        priority: job.meta.priority,
                        pushed_at: job.meta.pushed_at,
                        id: entry.id,
                    });
                }
            }
        }
    }
}

/// An in-memory, non-durable [`Driver`]. Supports priority, delayed jobs, and
/// blocking reserve (bounded by the caller's `poll_timeout`).
pub struct MemoryDriver {
    state: Mutex<MemoryState>,
    notify: Notify,
    next_lease: AtomicU64,
}

impl Default for MemoryDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryDriver {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MemoryState {
                jobs: HashMap::new(),
                ready: BinaryHeap::new(),
                delayed: BinaryHeap::new(),
                capacity: None,
            }),
            notify: Notify::new(),
            next_lease: AtomicU64::new(1),
        }
    }

    /// Reject new pushes once this many jobs are tracked (waiting or
    /// reserved). Terminal (done) jobs don't count against the cap since
    /// this driver never evicts them on its own.
    pub fn with_capacity(capacity: usize) -> Self {
        let mut driver = Self::new();
        driver.state.get_mut().unwrap().capacity = Some(capacity);
        driver
    }

    fn next_lease_token(&self) -> LeaseToken {
        LeaseToken(self.next_lease.fetch_add(1, AtomicOrdering::SeqCst))
    }
}

#[async_trait]
impl Driver for MemoryDriver {
    async fn push(&self, payload: Vec<u8>, name: &str, opts: &AddJobOptions) -> QueueResult<Uuid> {
        let id = Uuid::new_v4();
        let now = Utc::now();
        let meta = JobMeta::new(id, name, opts, now);

        let mut state = self.state.lock().unwrap();
        if let Some(capacity) = state.capacity {
            let live = state
                .jobs
                .values()
                .filter(|j| j.meta.status != JobStatus::Done)
                .count();
            if live >= capacity {
                tracing::warn!(job_name = name, capacity, "memory driver at capacity, rejecting push");
                return Err(QueueError::Backend(anyhow::anyhow!(
                    "memory driver at capacity ({capacity} live jobs)"
                )));
            }
        }

        if let Some(delay_until) = meta.delay_until {
            state.delayed.push(DelayedEntry {
                ready_at: delay_until,
                id,
            });
        } else {
            state.ready.push(ReadyEntry {
                priority: meta.priority,
                pushed_at: meta.pushed_at,
                id,
            });
        }

        state.jobs.insert(
            id,
            StoredJob {
                meta,
                payload,
                lease_token: LeaseToken::NONE,
            },
        );
        drop(state);
        self.notify.notify_one();

        tracing::debug!(job_id = %id, job_name = name, "pushed job");
        Ok(id)
    }

    async fn reserve(&self, poll_timeout: Duration) -> QueueResult<Option<ReservedJob>> {
        let deadline = Instant::now() + poll_timeout;

        loop {
            let wait_until = {
                let mut state = self.state.lock().unwrap();
                let now = Utc::now();
                state.recover_expired(now);
                state.promote_delayed(now);

                if let Some(entry) = state.ready.pop() {
                    let Some(job) = state.jobs.get_mut(&entry.id) else {
                        continue;
                    };
                    let token = self.next_lease_token();
                    job.meta.status = JobStatus::Reserved;
                    job.meta.reserved_at = Some(now);
                    job.meta.lease_expires_at =
                        Some(now + chrono::Duration::seconds(job.meta.ttr_secs as i64));
                    job.lease_token = token;

                    tracing::debug!(job_id = %entry.id, "reserved job");
                    return Ok(Some(ReservedJob {
                        id: entry.id,
                        name: job.meta.name.clone(),
                        payload: job.payload.clone(),
                        meta: job.meta.clone(),
                        lease_token: token,
                    }));
                }

                state.delayed.peek().map(|d| d.ready_at)
            };

            if Instant::now() >= deadline {
                return Ok(None);
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            let wait_for = match wait_until {
                Some(ready_at) => {
                    let until_ready = (ready_at - Utc::now())
                        .to_std()
                        .unwrap_or(Duration::ZERO);
                    remaining.min(until_ready)
                }
                None => remaining,
            };

            if wait_for.is_zero() {
                continue;
            }

            tokio::select! {
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep(wait_for) => {}
            }
        }
    }

    async fn complete(&self, id: Uuid, lease_token: LeaseToken) -> QueueResult<bool> {
        let mut state = self.state.lock().unwrap();
        let Some(job) = state.jobs.get_mut(&id) else {
            return Ok(false);
        };
        if job.meta.status != JobStatus::Reserved || job.lease_token != lease_token {
            return Ok(false);
        }
        job.meta.status = JobStatus::Done;
        job.meta.reserved_at = None;
        job.meta.lease_expires_at = None;
        Ok(true)
    }

    async fn fail(&self, id: Uuid, lease_token: LeaseToken, _error: &str) -> QueueResult<bool> {
        let mut state = self.state.lock().unwrap();
        let Some(job) = state.jobs.get_mut(&id) else {
            return Ok(false);
        };
        if job.meta.status != JobStatus::Reserved || job.lease_token != lease_token {
            return Ok(false);
        }
        job.meta.status = JobStatus::Done;
        job.meta.reserved_at = None;
        job.meta.lease_expires_at = None;
        Ok(true)
    }

    async fn retry(
        &self,
        id: Uuid,
        lease_token: LeaseToken,
        next_attempt: u32,
        delay: Duration,
    ) -> QueueResult<bool> {
        let mut state = self.state.lock().unwrap();
        let Some(job) = state.jobs.get_mut(&id) else {
            return Ok(false);
        };
        if job.meta.status != JobStatus::Reserved || job.lease_token != lease_token {
            return Ok(false);
        }

        job.meta.status = JobStatus::Waiting;
        job.meta.attempt = next_attempt;
        job.meta.reserved_at = None;
        job.meta.lease_expires_at = None;
        job.lease_token = LeaseToken::NONE;

        if delay.is_zero() {
            state.ready.push(ReadyEntry {
                priority: job.meta.priority,
                pushed_at: job.meta.pushed_at,
                id,
            });
        } else {
            let ready_at = Utc::now()
                + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
            state.delayed.push(DelayedEntry { ready_at, id });
        }
        drop(state);
        self.notify.notify_one();
        Ok(true)
    }

    async fn recover_expired_leases(&self, now: DateTime<Utc>) -> QueueResult<u64> {
        let mut state = self.state.lock().unwrap();
        let recovered = state.recover_expired(now);
        if recovered > 0 {
            tracing::warn!(recovered, "recovered expired leases");
            drop(state);
            self.notify.notify_one();
        }
        Ok(recovered)
    }

    async fn status(&self, id: Uuid) -> QueueResult<Option<JobStatus>> {
        let state = self.state.lock().unwrap();
        Ok(state.jobs.get(&id).map(|j| j.meta.status))
    }

    fn capabilities(&self) -> DriverCapabilities {
        DriverCapabilities {
            supports_priority: true,
            supports_delayed_jobs: true,
            supports_blocking_reserve: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn push_then_reserve_round_trip() {
        let driver = MemoryDriver::new();
        let id = driver
            .push(b"hi".to_vec(), "greet", &AddJobOptions::new())
            .await
            .unwrap();

        let reserved = driver
            .reserve(Duration::from_millis(50))
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
        let driver = MemoryDriver::new();
        let low = driver
            .push(b"low".to_vec(), "job", &AddJobOptions::new().with_priority(0))
            .await
            .unwrap();
        let high = driver
            .push(b"high".to_vec(), "job", &AddJobOptions::new().with_priority(10))
            .await
            .unwrap();

        let first = driver
            .reserve(Duration::from_millis(50))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.id, high);
        driver.complete(high, first.lease_token).await.unwrap();

        let second = driver
            .reserve(Duration::from_millis(50))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second.id, low);
    }

    #[tokio::test]
    async fn delayed_job_not_eligible_until_delay_elapses() {
        let driver = MemoryDriver::new();
        driver
            .push(b"later".to_vec(), "job", &AddJobOptions::new().with_delay(3600))
            .await
            .unwrap();

        let reserved = driver.reserve(Duration::from_millis(20)).await.unwrap();
        assert!(reserved.is_none());
    }

    #[tokio::test]
    async fn stale_lease_token_rejected_on_complete() {
        let driver = MemoryDriver::new();
        let id = driver
            .push(b"x".to_vec(), "job", &AddJobOptions::new())
            .await
            .unwrap();
        driver.reserve(Duration::from_millis(50)).await.unwrap();

        let ok = driver.complete(id, LeaseToken(9999)).await.unwrap();
        assert!(!ok);
    }

    #[tokio::test]
    async fn recover_expired_leases_requeues_job() {
        let driver = MemoryDriver::new();
        let id = driver
            .push(
                b"x".to_vec(),
                "job",
                &AddJobOptions::new().with_ttr(1).with_max_attempts(3),
            )
            .await
            .unwrap();
        driver.reserve(Duration::from_millis(50)).await.unwrap();

        let far_future = Utc::now() + chrono::Duration::seconds(5);
        let recovered = driver.recover_expired_leases(far_future).await.unwrap();
        assert_eq!(recovered, 1);
        assert_eq!(driver.status(id).await.unwrap(), Some(JobStatus::Waiting));

        let reserved = driver
            .reserve(Duration::from_millis(50))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reserved.meta.attempt, 1);
    }

    #[tokio::test]
    async fn reserve_implicitly_recovers_expired_leases() {
        let driver = MemoryDriver::new();
        let id = driver
            .push(
                b"x".to_vec(),
                "job",
                &AddJobOptions::new().with_ttr(0).with_max_attempts(3),
            )
            .await
            .unwrap();
        driver.reserve(Duration::from_millis(50)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        // No explicit call to recover_expired_leases: reserve must sweep on its own.
        let reserved = driver
            .reserve(Duration::from_millis(50))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reserved.id, id);
        assert_eq!(reserved.meta.attempt, 1);
    }

    #[tokio::test]
    async fn capacity_limit_rejects_push() {
        let driver = MemoryDriver::with_capacity(1);
        driver
            .push(b"a".to_vec(), "job", &AddJobOptions::new())
            .await
            .unwrap();
        let err = driver
            .push(b"b".to_vec(), "job", &AddJobOptions::new())
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::Backend(_)));
    }
}
