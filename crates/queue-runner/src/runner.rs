//! In-process worker runner: drives [`QueueCore::run`] and exposes a handle
//! that can hard-stop it independent of any registered plugin.

use std::sync::Arc;
use std::time::Duration;

use queue_core::{QueueCore, QueueResult};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// Builds and spawns a runner loop over a [`QueueCore`].
pub struct WorkerRunner {
    queue: Arc<QueueCore>,
    repeat: bool,
    poll_timeout: Duration,
}

impl WorkerRunner {
    pub fn new(queue: Arc<QueueCore>) -> Self {
        Self {
            queue,
            repeat: true,
            poll_timeout: Duration::from_secs(5),
        }
    }

    /// `false` makes the runner process at most one job then return.
    pub fn with_repeat(mut self, repeat: bool) -> Self {
        self.repeat = repeat;
        self
    }

    pub fn with_poll_timeout(mut self, poll_timeout: Duration) -> Self {
        self.poll_timeout = poll_timeout;
        self
    }

    /// Spawn the loop on the current Tokio runtime.
    pub fn spawn(self) -> RunnerHandle {
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let queue = self.queue;
        let repeat = self.repeat;
        let poll_timeout = self.poll_timeout;

        tracing::debug!(repeat, ?poll_timeout, "spawning runner loop");
        let join = tokio::spawn(async move {
            tokio::select! {
                result = queue.run(repeat, poll_timeout) => result,
                _ = shutdown_rx => Ok(()),
            }
        });

        RunnerHandle {
            shutdown_tx: Some(shutdown_tx),
            join,
        }
    }
}

/// Handle to a spawned runner.
///
/// `shutdown` is a hard stop: it cancels the run loop immediately, possibly
/// mid-dispatch. For a graceful stop that lets the in-flight job finish,
/// register a [`queue_core::Plugin`] (e.g. `SignalPlugin`) instead and let
/// `should_keep_running` end the loop between iterations.
pub struct RunnerHandle {
    shutdown_tx: Option<oneshot::Sender<()>>,
    join: JoinHandle<QueueResult<()>>,
}

impl RunnerHandle {
    /// Request a hard stop and wait for the loop task to finish.
    pub async fn shutdown(mut self) -> QueueResult<()> {
        if let Some(tx) = self.shutdown_tx.take() {
            tracing::debug!("runner shutdown requested");
            let _ = tx.send(());
        }
        match self.join.await {
            Ok(result) => result,
            Err(_join_err) => Ok(()),
        }
    }

    /// Wait for the loop to finish on its own (e.g. `repeat = false`, or a
    /// plugin vetoed further iterations).
    pub async fn join(self) -> QueueResult<()> {
        match self.join.await {
            Ok(result) => result,
            Err(_join_err) => Ok(()),
        }
    }
}
