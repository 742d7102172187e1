//! Remote-broker [`Driver`]: adapts a message-broker's receive/delete/
//! change-visibility primitives to the reservation contract.
//!
//! The actual broker SDK is an external collaborator pinned behind
//! [`BrokerTransport`] — this crate never talks to a wire protocol directly.
//! [`MockTransport`] is an in-process stand-in with SQS-like visibility
//! timeout semantics, for tests and the bundled demo; a production
//! deployment supplies its own `BrokerTransport` over a real broker SDK.
//!
//! Lease tokens don't exist on the broker side (receipt handles do); this
//! driver keeps a small in-memory table mapping each in-flight job id to its
//! current lease token and receipt handle, rotated on every receive.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use queue_core::{
    AddJobOptions, Driver, DriverCapabilities, JobMeta, JobStatus, LeaseToken, QueueError,
    QueueResult, ReservedJob,
};
use uuid::Uuid;

/// Attributes carried alongside the message body — the broker-native analog
/// of a job record's scheduling metadata.
#[derive(Debug, Clone)]
pub struct MessageAttributes {
    pub job_id: Uuid,
    pub name: String,
    pub ttr_secs: u64,
    pub attempt: u32,
    pub max_attempts: u32,
    pub priority: i64,
    pub pushed_at: DateTime<Utc>,
}

/// A message handed back by [`BrokerTransport::receive`].
#[derive(Debug, Clone)]
pub struct BrokerMessage {
    pub receipt_handle: String,
    pub body: Vec<u8>,
    pub attributes: MessageAttributes,
}

/// The broker SDK boundary. Implement this over whatever message broker is
/// actually deployed (SQS, Pub/Sub, Service Bus, ...); this crate only
/// depends on this trait.
#[async_trait]
pub trait BrokerTransport: Send + Sync + 'static {
    async fn send(
        &self,
        body: Vec<u8>,
        attributes: MessageAttributes,
        delay: Duration,
    ) -> anyhow::Result<()>;

    async fn receive(
        &self,
        visibility_timeout: Duration,
        wait_time: Duration,
    ) -> anyhow::Result<Option<BrokerMessage>>;

    async fn delete(&self, receipt_handle: &str) -> anyhow::Result<()>;

    async fn change_visibility(
        &self,
        receipt_handle: &str,
        visibility_timeout: Duration,
    ) -> anyhow::Result<()>;
}

struct LeaseEntry {
    token: LeaseToken,
    receipt_handle: String,
    payload: Vec<u8>,
    attributes: MessageAttributes,
}

/// [`Driver`] over a [`BrokerTransport`]. Declares `supports_priority =
/// false`: most broker backends have no priority channel, so jobs dispatch
/// in roughly arrival order regardless of the `priority` option.
pub struct BrokerDriver<T: BrokerTransport> {
    transport: T,
    in_flight: Mutex<HashMap<Uuid, LeaseEntry>>,
    last_status: Mutex<HashMap<Uuid, JobStatus>>,
    next_token: Mutex<u64>,
}

impl<T: BrokerTransport> BrokerDriver<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            in_flight: Mutex::new(HashMap::new()),
            last_status: Mutex::new(HashMap::new()),
            next_token: Mutex::new(1),
        }
    }

    fn allocate_token(&self) -> LeaseToken {
        let mut next = self.next_token.lock().unwrap();
        let token = LeaseToken(*next);
        *next += 1;
        token
    }
}

#[async_trait]
impl<T: BrokerTransport> Driver for BrokerDriver<T> {
    async fn push(&self, payload: Vec<u8>, name: &str, opts: &AddJobOptions) -> QueueResult<Uuid> {
        let id = Uuid::new_v4();
        let now = Utc::now();
        let meta = JobMeta::new(id, name, opts, now);

        let delay = meta
            .delay_until
            .map(|at| (at - now).to_std().unwrap_or(Duration::ZERO))
            .unwrap_or(Duration::ZERO);

        self.transport
            .send(
                payload,
                MessageAttributes {
                    job_id: id,
                    name: name.to_string(),
                    ttr_secs: meta.ttr_secs,
                    attempt: meta.attempt,
                    max_attempts: meta.max_attempts,
                    priority: meta.priority,
                    pushed_at: meta.pushed_at,
                },
                delay,
            )
            .await
            .map_err(QueueError::Backend)?;

        self.last_status
            .lock()
            .unwrap()
            .insert(id, JobStatus::Waiting);
        tracing::debug!(job_id = %id, job_name = name, "pushed job");
        Ok(id)
    }

    async fn reserve(&self, poll_timeout: Duration) -> QueueResult<Option<ReservedJob>> {
        let Some(message) = self
            .transport
            .receive(
                Duration::from_secs(60),
                poll_timeout,
            )
            .await
            .map_err(QueueError::Backend)?
        else {
            return Ok(None);
        };

        let attrs = &message.attributes;
        self.transport
            .change_visibility(&message.receipt_handle, Duration::from_secs(attrs.ttr_secs))
            .await
            .map_err(QueueError::Backend)?;

        let token = self.allocate_token();
        let now = Utc::now();
        let meta = JobMeta {
            id: attrs.job_id,
            name: attrs.name.clone(),
            priority: attrs.priority,
            delay_until: None,
            ttr_secs: attrs.ttr_secs,
            attempt: attrs.attempt,
            max_attempts: attrs.max_attempts,
            pushed_at: attrs.pushed_at,
            reserved_at: Some(now),
            lease_expires_at: Some(now + chrono::Duration::seconds(attrs.ttr_secs as i64)),
            status: JobStatus::Reserved,
        };

        self.in_flight.lock().unwrap().insert(
            attrs.job_id,
            LeaseEntry {
                token,
                receipt_handle: message.receipt_handle,
                payload: message.body.clone(),
                attributes: attrs.clone(),
            },
        );
        self.last_status
            .lock()
            .unwrap()
            .insert(attrs.job_id, JobStatus::Reserved);

        tracing::debug!(job_id = %attrs.job_id, "reserved job");
        Ok(Some(ReservedJob {
            id: attrs.job_id,
            name: attrs.name.clone(),
            payload: message.body,
            meta,
            lease_token: token,
        }))
    }

    async fn complete(&self, id: Uuid, lease_token: LeaseToken) -> QueueResult<bool> {
        let receipt = {
            let mut in_flight = self.in_flight.lock().unwrap();
            match in_flight.get(&id) {
                Some(entry) if entry.token == lease_token => in_flight.remove(&id).unwrap().receipt_handle,
                _ => return Ok(false),
            }
        };

        self.transport
            .delete(&receipt)
            .await
            .map_err(QueueError::Backend)?;
        self.last_status.lock().unwrap().insert(id, JobStatus::Done);
        Ok(true)
    }

    async fn fail(&self, id: Uuid, lease_token: LeaseToken, error: &str) -> QueueResult<bool> {
        tracing::warn!(job_id = %id, error, "job terminally failed");
        self.complete(id, lease_token).await
    }

    async fn retry(
        &self,
        id: Uuid,
        lease_token: LeaseToken,
        next_attempt: u32,
        delay: Duration,
    ) -> QueueResult<bool> {
        let entry = {
            let mut in_flight = self.in_flight.lock().unwrap();
            match in_flight.get(&id) {
                Some(entry) if entry.token == lease_token => in_flight.remove(&id).unwrap(),
                _ => return Ok(false),
            }
        };

        self.transport
            .delete(&entry.receipt_handle)
            .await
            .map_err(QueueError::Backend)?;

        let mut attributes = entry.attributes;
        attributes.attempt = next_attempt;
        self.transport
            .send(entry.payload, attributes, delay)
            .await
            .map_err(QueueError::Backend)?;

        self.last_status
            .lock()
            .unwrap()
            .insert(id, JobStatus::Waiting);
        Ok(true)
    }

    async fn recover_expired_leases(&self, _now: DateTime<Utc>) -> QueueResult<u64> {
        // The broker's own visibility timeout already returns unacknowledged
        // messages to the queue; nothing to sweep on this side.
        Ok(0)
    }

    async fn status(&self, id: Uuid) -> QueueResult<Option<JobStatus>> {
        Ok(self.last_status.lock().unwrap().get(&id).copied())
    }

    fn capabilities(&self) -> DriverCapabilities {
        DriverCapabilities {
            supports_priority: false,
            supports_delayed_jobs: true,
            supports_blocking_reserve: true,
        }
    }
}

/// In-process [`BrokerTransport`] with SQS-like visibility-timeout
/// semantics: a received message is invisible to other receivers until its
/// visibility timeout elapses, at which point it reappears unless deleted.
pub struct MockTransport {
    state: Mutex<MockState>,
    notify: tokio::sync::Notify,
}

struct MockState {
    visible: VecDeque<(Vec<u8>, MessageAttributes)>,
    in_flight: HashMap<String, (Vec<u8>, MessageAttributes, DateTime<Utc>)>,
    next_receipt: u64,
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState {
                visible: VecDeque::new(),
                in_flight: HashMap::new(),
                next_receipt: 1,
            }),
            notify: tokio::sync::Notify::new(),
        }
    }

    fn reap_expired(&self, state: &mut MockState, now: DateTime<Utc>) {
        let expired: Vec<String> = state
            .in_flight
            .iter()
            .filter(|(_, (_, _, visible_at))| *visible_at <= now)
            .map(|(receipt, _)| receipt.clone())
            .collect();
        for receipt in expired {
            if let Some((body, attrs, _)) = state.in_flight.remove(&receipt) {
                state.visible.push_back((body, attrs));
            }
        }
    }
}

#[async_trait]
impl BrokerTransport for MockTransport {
    async fn send(
        &self,
        body: Vec<u8>,
        attributes: MessageAttributes,
        delay: Duration,
    ) -> anyhow::Result<()> {
        if delay.is_zero() {
            self.state.lock().unwrap().visible.push_back((body, attributes));
            self.notify.notify_one();
        } else {
            let mut state = self.state.lock().unwrap();
            let receipt = format!("delayed-{}", state.next_receipt);
            state.next_receipt += 1;
            let visible_at = Utc::now()
                + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
            state.in_flight.insert(receipt, (body, attributes, visible_at));
        }
        Ok(())
    }

    async fn receive(
        &self,
        visibility_timeout: Duration,
        wait_time: Duration,
    ) -> anyhow::Result<Option<BrokerMessage>> {
        let deadline = tokio::time::Instant::now() + wait_time;
        loop {
            {
                let mut state = self.state.lock().unwrap();
                self.reap_expired(&mut state, Utc::now());
                if let Some((body, attributes)) = state.visible.pop_front() {
                    let receipt = format!("r-{}", state.next_receipt);
                    state.next_receipt += 1;
                    let visible_at = Utc::now()
                        + chrono::Duration::from_std(visibility_timeout)
                            .unwrap_or_else(|_| chrono::Duration::zero());
                    state
                        .in_flight
                        .insert(receipt.clone(), (body.clone(), attributes.clone(), visible_at));
                    return Ok(Some(BrokerMessage {
                        receipt_handle: receipt,
                        body,
                        attributes,
                    }));
                }
            }

            if tokio::time::Instant::now() >= deadline {
                return Ok(None);
            }
            tokio::select! {
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep(Duration::from_millis(20)) => {}
            }
        }
    }

    async fn delete(&self, receipt_handle: &str) -> anyhow::Result<()> {
        self.state.lock().unwrap().in_flight.remove(receipt_handle);
        Ok(())
    }

    async fn change_visibility(
        &self,
        receipt_handle: &str,
        visibility_timeout: Duration,
    ) -> anyhow::Result<()> {
        let mut state = self.state.lock().unwrap();
        if let Some((_, _, visible_at)) = state.in_flight.get_mut(receipt_handle) {
            *visible_at = Utc::now()
                + chrono::Duration::from_std(visibility_timeout)
                    .unwrap_or_else(|_| chrono::Duration::zero());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn push_then_reserve_round_trip() {
        let driver = BrokerDriver::new(MockTransport::new());
        let id = driver
            .push(b"hi".to_vec(), "greet", &AddJobOptions::new())
            .await
            .unwrap();

        let reserved = driver
            .reserve(Duration::from_millis(50))
            .await
            .unwrap()
            .expect("message should be reserved");
        assert_eq!(reserved.id, id);
        assert_eq!(reserved.payload, b"hi");

        assert!(driver.complete(id, reserved.lease_token).await.unwrap());
        assert_eq!(driver.status(id).await.unwrap(), Some(JobStatus::Done));
    }

    #[tokio::test]
    async fn stale_lease_token_rejected() {
        let driver = BrokerDriver::new(MockTransport::new());
        let id = driver
            .push(b"x".to_vec(), "job", &AddJobOptions::new())
            .await
            .unwrap();
        driver.reserve(Duration::from_millis(50)).await.unwrap();

        assert!(!driver.complete(id, LeaseToken(999)).await.unwrap());
    }

    #[tokio::test]
    async fn capabilities_disable_priority() {
        let driver = BrokerDriver::new(MockTransport::new());
        assert!(!driver.capabilities().supports_priority);
    }

    #[tokio::test]
    async fn empty_queue_times_out_with_none() {
        let driver = BrokerDriver::new(MockTransport::new());
        let reserved = driver.reserve(Duration::from_millis(30)).await.unwrap();
        assert!(reserved.is_none());
    }
}
