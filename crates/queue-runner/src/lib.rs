//! Worker Runner: drives [`queue_core::QueueCore::run`] with a repeat/timeout
//! policy, plus an isolated execution mode that runs each job in a
//! subordinate process instead of an in-process closure.

mod isolated;
mod runner;

pub use isolated::isolated_handler;
pub use runner::{RunnerHandle, WorkerRunner};
