//! Lifecycle events emitted by the queue core around push and dispatch.
//!
//! Observers are invoked synchronously on the dispatching worker; they must
//! not block for long or they will delay the run loop.

use uuid::Uuid;

/// A lifecycle event fired by [`crate::queue::QueueCore`].
///
/// For one successful job, events fire strictly in order: `BeforePush`,
/// `AfterPush`, `BeforeExec`, `AfterExec`.
#[derive(Debug, Clone)]
pub enum QueueEvent {
    BeforePush {
        name: String,
    },
    AfterPush {
        id: Uuid,
        name: String,
    },
    BeforeExec {
        id: Uuid,
        name: String,
    },
    AfterExec {
        id: Uuid,
        name: String,
    },
    AfterError {
        id: Uuid,
        name: String,
        error: String,
    },
}

/// Observes queue lifecycle events.
///
/// Implementors should treat `on_event` as a fast, synchronous callback —
/// the queue core calls it inline on the dispatching worker.
pub trait QueueObserver: Send + Sync + 'static {
    fn on_event(&self, event: &QueueEvent);
}

/// An observer backed by `tracing`, used as the default when none is
/// supplied: logs every lifecycle event at `debug`, and `AfterError` at
/// `warn`.
#[derive(Debug, Default)]
pub struct TracingObserver;

impl QueueObserver for TracingObserver {
    fn on_event(&self, event: &QueueEvent) {
        match event {
            QueueEvent::BeforePush { name } => {
                tracing::debug!(job_name = %name, "before push");
            }
            QueueEvent::AfterPush { id, name } => {
                tracing::debug!(job_id = %id, job_name = %name, "after push");
            }
            QueueEvent::BeforeExec { id, name } => {
                tracing::debug!(job_id = %id, job_name = %name, "before exec");
            }
            QueueEvent::AfterExec { id, name } => {
                tracing::debug!(job_id = %id, job_name = %name, "after exec");
            }
            QueueEvent::AfterError { id, name, error } => {
                tracing::warn!(job_id = %id, job_name = %name, error = %error, "after error");
            }
        }
    }
}
