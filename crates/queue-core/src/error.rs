//! Structured error taxonomy for the job queue runtime.
//!
//! `QueueError` provides pattern-matchable errors instead of generic
//! `anyhow::Error`, the same way `SeesawError` does for the coordination
//! layer this crate's lineage descends from.
//!
//! # The propagation rule
//!
//! The queue core never panics out of `run`: `Backend` and `Handler` errors
//! are converted into lifecycle events and the loop continues.
//! `Validation` and `Backend` errors from `add_job` propagate directly to the
//! caller. `Configuration` errors are fatal at startup.

use thiserror::Error;
use uuid::Uuid;

/// The six-member error taxonomy from the runtime's error handling design.
#[derive(Debug, Error)]
pub enum QueueError {
    /// Bad `add_job` arguments. Raised synchronously; no record is created.
    #[error("validation error: {0}")]
    Validation(String),

    /// Transient storage/transport failure during push, reserve, complete,
    /// retry, or fail.
    #[error("backend error: {0}")]
    Backend(#[source] anyhow::Error),

    /// Failure returned by the user-supplied handler for a dispatched job.
    #[error("handler error for job {job_id}: {source}")]
    Handler {
        job_id: Uuid,
        #[source]
        source: anyhow::Error,
    },

    /// No handler registered for the reserved job's name. Terminal; the job
    /// is marked failed without retry regardless of remaining attempts.
    #[error("no handler registered for job type {name:?} (job {job_id})")]
    UnhandledJobType { job_id: Uuid, name: String },

    /// `complete`/`fail`/`retry` issued against an expired or rotated lease.
    /// Swallowed by the queue core: the job is already owned by whoever
    /// re-reserved it, or was already recovered.
    #[error("lease lost for job {0}")]
    LeaseLost(Uuid),

    /// Invalid driver setup (e.g. a missing queue URL). Fatal at startup.
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl QueueError {
    /// True for errors the retry policy should treat as immediately terminal
    /// regardless of how many attempts remain.
    pub fn is_terminal(&self) -> bool {
        matches!(self, QueueError::UnhandledJobType { .. })
    }
}

/// Convenience alias used throughout the driver contract.
pub type QueueResult<T> = Result<T, QueueError>;
