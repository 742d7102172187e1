//! Driver-agnostic core of a durable job queue: a payload codec, the
//! storage/transport driver contract, the dispatch loop and retry policy,
//! and lifecycle hooks for host integration.
//!
//! A concrete queue is a [`driver::Driver`] implementation plus a
//! [`queue::QueueCore`] built over it. This crate defines the contract and
//! the orchestration; `queue-driver-*` crates provide the storage variants.

mod codec;
mod driver;
mod error;
mod events;
mod model;
mod plugin;
mod queue;

pub use codec::{JsonCodec, PayloadCodec};
pub use driver::{lease_expiry_transition, Driver};
pub use error::{QueueError, QueueResult};
pub use events::{QueueEvent, QueueObserver, TracingObserver};
pub use model::{
    AddJobOptions, DriverCapabilities, JobMeta, JobStatus, LeaseToken, ReservedJob,
};
pub use plugin::{Plugin, SignalPlugin};
pub use queue::{JobContext, QueueCore, QueueCoreBuilder};
