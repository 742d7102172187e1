//! Driver-agnostic orchestrator: job submission, the run loop, handler
//! dispatch keyed by job name, and the retry policy.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use crate::codec::{JsonCodec, PayloadCodec};
use crate::driver::Driver;
use crate::error::{QueueError, QueueResult};
use crate::events::{QueueEvent, QueueObserver, TracingObserver};
use crate::model::{AddJobOptions, JobMeta, JobStatus};
use crate::plugin::Plugin;

/// What a handler receives: an immutable snapshot of the job's payload and
/// metadata, plus a handle back into the owning queue.
#[derive(Clone)]
pub struct JobContext {
    pub id: Uuid,
    pub name: String,
    pub payload: serde_json::Value,
    pub meta: JobMeta,
    pub queue: Arc<QueueCore>,
}

type HandlerFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;
type BoxedHandler = Arc<dyn Fn(JobContext) -> HandlerFuture + Send + Sync>;
type BackoffFn = Arc<dyn Fn(u32) -> Duration + Send + Sync>;

/// The default backoff: deterministic and zero, per the retry policy design.
fn zero_backoff(_next_attempt: u32) -> Duration {
    Duration::ZERO
}

/// Builds a [`QueueCore`]. The handler map and observer/plugin lists must be
/// fully populated before `build()` — mutating them after the queue starts
/// running is undefined, so the builder consumes itself and the resulting
/// `QueueCore` exposes no further mutation methods.
pub struct QueueCoreBuilder {
    driver: Arc<dyn Driver>,
    codec: Arc<dyn PayloadCodec>,
    handlers: HashMap<String, BoxedHandler>,
    observers: Vec<Arc<dyn QueueObserver>>,
    plugins: Vec<Arc<dyn Plugin>>,
    backoff: BackoffFn,
}

impl QueueCoreBuilder {
    pub fn new(driver: Arc<dyn Driver>) -> Self {
        Self {
            driver,
            codec: Arc::new(JsonCodec),
            handlers: HashMap::new(),
            observers: vec![Arc::new(TracingObserver)],
            plugins: Vec::new(),
            backoff: Arc::new(zero_backoff),
        }
    }

    /// Replace the default JSON codec.
    pub fn with_codec(mut self, codec: impl PayloadCodec) -> Self {
        self.codec = Arc::new(codec);
        self
    }

    /// Register a handler for a job name.
    ///
    /// `F` returns a future so handlers may perform async work; the queue
    /// core awaits it directly, there is no separate sync/async split.
    pub fn with_handler<F, Fut>(mut self, name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(JobContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.handlers
            .insert(name.into(), Arc::new(move |ctx| Box::pin(handler(ctx))));
        self
    }

    /// Register several handlers at once.
    pub fn with_handlers<F, Fut>(mut self, handlers: impl IntoIterator<Item = (&'static str, F)>) -> Self
    where
        F: Fn(JobContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        for (name, handler) in handlers {
            self = self.with_handler(name, handler);
        }
        self
    }

    /// Register a lifecycle observer. The default registers a
    /// [`TracingObserver`]; call this to add more (it does not replace the
    /// default).
    pub fn with_observer(mut self, observer: impl QueueObserver) -> Self {
        self.observers.push(Arc::new(observer));
        self
    }

    /// Register a plugin.
    pub fn with_plugin(mut self, plugin: impl Plugin) -> Self {
        self.plugins.push(Arc::new(plugin));
        self
    }

    /// Override the retry backoff. Given the attempt number about to run
    /// (1-based), return how long to delay it.
    pub fn with_backoff(mut self, backoff: impl Fn(u32) -> Duration + Send + Sync + 'static) -> Self {
        self.backoff = Arc::new(backoff);
        self
    }

    pub fn build(self) -> Arc<QueueCore> {
        Arc::new(QueueCore {
            driver: self.driver,
            codec: self.codec,
            handlers: self.handlers,
            observers: self.observers,
            plugins: self.plugins,
            backoff: self.backoff,
        })
    }
}

/// The driver-agnostic queue orchestrator. Construct via [`QueueCoreBuilder`].
pub struct QueueCore {
    driver: Arc<dyn Driver>,
    codec: Arc<dyn PayloadCodec>,
    handlers: HashMap<String, BoxedHandler>,
    observers: Vec<Arc<dyn QueueObserver>>,
    plugins: Vec<Arc<dyn Plugin>>,
    backoff: BackoffFn,
}

impl QueueCore {
    /// Start building a queue over the given driver.
    pub fn builder(driver: Arc<dyn Driver>) -> QueueCoreBuilder {
        QueueCoreBuilder::new(driver)
    }

    fn emit(&self, event: QueueEvent) {
        for observer in &self.observers {
            observer.on_event(&event);
        }
    }

    /// Submit a new job. Validates `opts`, emits `BeforePush`/`AfterPush`,
    /// and returns the driver-assigned id.
    pub async fn add_job(
        &self,
        name: &str,
        payload: serde_json::Value,
        opts: AddJobOptions,
    ) -> QueueResult<Uuid> {
        opts.validate()?;

        self.emit(QueueEvent::BeforePush {
            name: name.to_string(),
        });

        let encoded = self
            .codec
            .encode(name, &payload)
            .map_err(QueueError::Backend)?;

        let id = self.driver.push(encoded, name, &opts).await?;

        self.emit(QueueEvent::AfterPush {
            id,
            name: name.to_string(),
        });

        Ok(id)
    }

    /// Look up the externally-visible status of a job.
    pub async fn status(&self, id: Uuid) -> QueueResult<Option<JobStatus>> {
        self.driver.status(id).await
    }

    /// Access the underlying driver, e.g. for driver-specific maintenance
    /// calls not part of the common contract.
    pub fn driver(&self) -> &Arc<dyn Driver> {
        &self.driver
    }

    /// Run the main loop.
    ///
    /// Each iteration: reserve a job, dispatch to its handler, and apply the
    /// retry policy on failure. If `repeat` is false, returns as soon as a
    /// single reserve attempt comes back empty or after dispatching one job.
    pub async fn run(self: &Arc<Self>, repeat: bool, poll_timeout: Duration) -> QueueResult<()> {
        loop {
            for plugin in &self.plugins {
                plugin.on_before_reserve().await;
            }

            let reserved = match self.driver.reserve(poll_timeout).await {
                Ok(Some(job)) => job,
                Ok(None) => {
                    if !repeat {
                        return Ok(());
                    }
                    if !self.driver.capabilities().supports_blocking_reserve {
                        tokio::time::sleep(poll_timeout).await;
                    }
                    if !self.all_plugins_want_to_continue() {
                        return Ok(());
                    }
                    continue;
                }
                Err(QueueError::Backend(e)) => {
                    tracing::error!(error = %e, "backend error during reserve, retrying after backoff");
                    tokio::time::sleep(Duration::from_millis(250)).await;
                    if !repeat {
                        return Err(QueueError::Backend(e));
                    }
                    continue;
                }
                Err(other) => return Err(other),
            };

            self.dispatch_one(reserved).await;

            for plugin in &self.plugins {
                plugin.on_after_complete().await;
            }

            if !repeat || !self.all_plugins_want_to_continue() {
                return Ok(());
            }
        }
    }

    fn all_plugins_want_to_continue(&self) -> bool {
        self.plugins.iter().all(|p| p.should_keep_running())
    }

    async fn dispatch_one(self: &Arc<Self>, reserved: crate::model::ReservedJob) {
        let id = reserved.id;
        let name = reserved.name.clone();
        let meta = reserved.meta.clone();
        let lease_token = reserved.lease_token;

        self.emit(QueueEvent::BeforeExec {
            id,
            name: name.clone(),
        });

        let outcome = self.execute_handler(&reserved).await;

        match outcome {
            Ok(()) => {
                self.emit(QueueEvent::AfterExec {
                    id,
                    name: name.clone(),
                });
                match self.driver.complete(id, lease_token).await {
                    Ok(true) => {}
                    Ok(false) => {
                        tracing::debug!(job_id = %id, "complete was a no-op: lease lost");
                    }
                    Err(e) => {
                        tracing::error!(job_id = %id, error = %e, "backend error completing job");
                    }
                }
            }
            Err(err) => {
                self.emit(QueueEvent::AfterError {
                    id,
                    name: name.clone(),
                    error: err.to_string(),
                });
                self.apply_retry_policy(id, lease_token, &meta, err).await;
            }
        }
    }

    async fn execute_handler(
        self: &Arc<Self>,
        reserved: &crate::model::ReservedJob,
    ) -> Result<(), QueueError> {
        let Some(handler) = self.handlers.get(reserved.name.as_str()) else {
            return Err(QueueError::UnhandledJobType {
                job_id: reserved.id,
                name: reserved.name.clone(),
            });
        };

        let (_name, payload) = self
            .codec
            .decode(&reserved.payload)
            .map_err(QueueError::Backend)?;

        let ctx = JobContext {
            id: reserved.id,
            name: reserved.name.clone(),
            payload,
            meta: reserved.meta.clone(),
            queue: self.clone(),
        };

        handler(ctx).await.map_err(|source| QueueError::Handler {
            job_id: reserved.id,
            source,
        })
    }

    async fn apply_retry_policy(
        &self,
        id: Uuid,
        lease_token: crate::model::LeaseToken,
        meta: &JobMeta,
        err: QueueError,
    ) {
        if err.is_terminal() {
            if let Err(e) = self.driver.fail(id, lease_token, &err.to_string()).await {
                tracing::error!(job_id = %id, error = %e, "backend error failing job");
            }
            return;
        }

        let next_attempt = meta.attempt + 1;
        if next_attempt >= meta.max_attempts {
            if let Err(e) = self.driver.fail(id, lease_token, &err.to_string()).await {
                tracing::error!(job_id = %id, error = %e, "backend error failing job");
            }
            return;
        }

        let delay = (self.backoff)(next_attempt);
        if let Err(e) = self.driver.retry(id, lease_token, next_attempt, delay).await {
            tracing::error!(job_id = %id, error = %e, "backend error retrying job");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::Driver;
    use crate::model::{DriverCapabilities, LeaseToken, ReservedJob};
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Mutex;

    /// Minimal single-slot driver used to exercise the queue core's dispatch
    /// and retry logic in isolation from any real driver implementation.
    struct OneSlotDriver {
        job: Mutex<Option<(JobMeta, Vec<u8>)>>,
        next_token: AtomicU64,
        last_status: Mutex<Option<JobStatus>>,
    }

    impl OneSlotDriver {
        fn new() -> Self {
            Self {
                job: Mutex::new(None),
                next_token: AtomicU64::new(1),
                last_status: Mutex::new(None),
            }
        }
    }

    #[async_trait]
    impl Driver for OneSlotDriver {
        async fn push(
            &self,
            payload: Vec<u8>,
            name: &str,
            opts: &AddJobOptions,
        ) -> QueueResult<Uuid> {
            let id = Uuid::new_v4();
            let meta = JobMeta::new(id, name, opts, Utc::now());
            *self.job.lock().unwrap() = Some((meta, payload));
            *self.last_status.lock().unwrap() = Some(JobStatus::Waiting);
            Ok(id)
        }

        async fn reserve(&self, _poll_timeout: Duration) -> QueueResult<Option<ReservedJob>> {
            let mut guard = self.job.lock().unwrap();
            let Some((meta, payload)) = guard.as_mut() else {
                return Ok(None);
            };
            if meta.status != JobStatus::Waiting {
                return Ok(None);
            }
            let token = LeaseToken(self.next_token.fetch_add(1, Ordering::SeqCst));
            meta.status = JobStatus::Reserved;
            meta.reserved_at = Some(Utc::now());
            meta.lease_expires_at = Some(Utc::now() + chrono::Duration::seconds(meta.ttr_secs as i64));
            *self.last_status.lock().unwrap() = Some(JobStatus::Reserved);
            Ok(Some(ReservedJob {
                id: meta.id,
                name: meta.name.clone(),
                payload: payload.clone(),
                meta: meta.clone(),
                lease_token: token,
            }))
        }

        async fn complete(&self, id: Uuid, _lease_token: LeaseToken) -> QueueResult<bool> {
            let mut guard = self.job.lock().unwrap();
            if let Some((meta, _)) = guard.as_mut() {
                if meta.id == id {
                    meta.status = JobStatus::Done;
                    *self.last_status.lock().unwrap() = Some(JobStatus::Done);
                    return Ok(true);
                }
            }
            Ok(false)
        }

        async fn fail(&self, id: Uuid, _lease_token: LeaseToken, _error: &str) -> QueueResult<bool> {
            let mut guard = self.job.lock().unwrap();
            if let Some((meta, _)) = guard.as_mut() {
                if meta.id == id {
                    meta.status = JobStatus::Done;
                    *self.last_status.lock().unwrap() = Some(JobStatus::Done);
                    return Ok(true);
                }
            }
            Ok(false)
        }

        async fn retry(
            &self,
            id: Uuid,
            _lease_token: LeaseToken,
            next_attempt: u32,
            _delay: Duration,
        ) -> QueueResult<bool> {
            let mut guard = self.job.lock().unwrap();
            if let Some((meta, _)) = guard.as_mut() {
                if meta.id == id {
                    meta.status = JobStatus::Waiting;
                    meta.attempt = next_attempt;
                    meta.reserved_at = None;
                    meta.lease_expires_at = None;
                    *self.last_status.lock().unwrap() = Some(JobStatus::Waiting);
                    return Ok(true);
                }
            }
            Ok(false)
        }

        async fn recover_expired_leases(&self, _now: DateTime<Utc>) -> QueueResult<u64> {
            Ok(0)
        }

        async fn status(&self, _id: Uuid) -> QueueResult<Option<JobStatus>> {
            Ok(*self.last_status.lock().unwrap())
        }

        fn capabilities(&self) -> DriverCapabilities {
            DriverCapabilities {
                supports_priority: true,
                supports_delayed_jobs: true,
                supports_blocking_reserve: false,
            }
        }
    }

    #[tokio::test]
    async fn dispatches_and_completes_successful_job() {
        let driver = Arc::new(OneSlotDriver::new());
        let ran = Arc::new(AtomicU64::new(0));
        let ran2 = ran.clone();

        let queue = QueueCore::builder(driver.clone())
            .with_handler("greet", move |_ctx| {
                let ran = ran2.clone();
                async move {
                    ran.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .build();

        let id = queue
            .add_job("greet", serde_json::json!({"m": "hi"}), AddJobOptions::new())
            .await
            .unwrap();

        queue.run(false, Duration::from_millis(10)).await.unwrap();

        assert_eq!(ran.load(Ordering::SeqCst), 1);
        assert_eq!(queue.status(id).await.unwrap(), Some(JobStatus::Done));
    }

    /// Records every [`QueueEvent`] it sees, in order, for later assertion.
    /// The shared `Vec` is handed out separately so the observer itself can
    /// be moved into the builder while the test still holds a way to read
    /// what it recorded.
    struct RecordingObserver {
        events: Arc<Mutex<Vec<QueueEvent>>>,
    }

    impl RecordingObserver {
        fn new() -> (Self, Arc<Mutex<Vec<QueueEvent>>>) {
            let events = Arc::new(Mutex::new(Vec::new()));
            (
                Self {
                    events: events.clone(),
                },
                events,
            )
        }
    }

    impl QueueObserver for RecordingObserver {
        fn on_event(&self, event: &QueueEvent) {
            self.events.lock().unwrap().push(event.clone());
        }
    }

    fn event_kind(event: &QueueEvent) -> &'static str {
        match event {
            QueueEvent::BeforePush { .. } => "BeforePush",
            QueueEvent::AfterPush { .. } => "AfterPush",
            QueueEvent::BeforeExec { .. } => "BeforeExec",
            QueueEvent::AfterExec { .. } => "AfterExec",
            QueueEvent::AfterError { .. } => "AfterError",
        }
    }

    #[tokio::test]
    async fn events_fire_in_order_for_one_successful_job() {
        let driver = Arc::new(OneSlotDriver::new());
        let (observer, events) = RecordingObserver::new();

        let queue = QueueCore::builder(driver.clone())
            .with_observer(observer)
            .with_handler("greet", |_ctx| async move { Ok(()) })
            .build();

        queue
            .add_job("greet", serde_json::json!({"m": "hi"}), AddJobOptions::new())
            .await
            .unwrap();

        queue.run(false, Duration::from_millis(10)).await.unwrap();

        let kinds: Vec<&'static str> = events.lock().unwrap().iter().map(event_kind).collect();
        assert_eq!(
            kinds,
            vec!["BeforePush", "AfterPush", "BeforeExec", "AfterExec"]
        );
    }

    #[tokio::test]
    async fn unhandled_job_type_is_terminal_without_retry() {
        let driver = Arc::new(OneSlotDriver::new());
        let queue = QueueCore::builder(driver.clone()).build();

        let id = queue
            .add_job(
                "nope",
                serde_json::json!({}),
                AddJobOptions::new().with_max_attempts(3),
            )
            .await
            .unwrap();

        queue.run(false, Duration::from_millis(10)).await.unwrap();

        assert_eq!(queue.status(id).await.unwrap(), Some(JobStatus::Done));
    }

    #[tokio::test]
    async fn retries_until_max_attempts_then_fails() {
        let driver = Arc::new(OneSlotDriver::new());
        let attempts = Arc::new(AtomicU64::new(0));
        let attempts2 = attempts.clone();

        let queue = QueueCore::builder(driver.clone())
            .with_handler("boom", move |_ctx| {
                let attempts = attempts2.clone();
                async move {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    Err(anyhow::anyhow!("always fails"))
                }
            })
            .build();

        let id = queue
            .add_job(
                "boom",
                serde_json::json!({}),
                AddJobOptions::new().with_max_attempts(3),
            )
            .await
            .unwrap();

        for _ in 0..3 {
            queue.run(false, Duration::from_millis(10)).await.unwrap();
        }

        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert_eq!(queue.status(id).await.unwrap(), Some(JobStatus::Done));
    }
}
