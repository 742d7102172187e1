//! Plugin hooks: cooperative observers that react to queue lifecycle to
//! integrate external signals, such as a host-termination notice.
//!
//! Plugins hold no write access to job records — they only read queue state
//! and may veto further dispatch via [`Plugin::should_keep_running`].

use async_trait::async_trait;

/// A plugin observing the run loop around each iteration.
///
/// `should_keep_running` returning `false` causes the runner to exit
/// cleanly after the current job completes — the intended integration point
/// for container-termination signals.
#[async_trait]
pub trait Plugin: Send + Sync + 'static {
    /// Called before each `reserve` attempt.
    async fn on_before_reserve(&self) {}

    /// Called after a job completes (success or terminal failure).
    async fn on_after_complete(&self) {}

    /// Whether the run loop should continue to the next iteration.
    fn should_keep_running(&self) -> bool {
        true
    }
}

/// A plugin that hooks the process's termination signal (`SIGTERM`/Ctrl-C)
/// and flips `should_keep_running` to `false` once received, letting the
/// current job finish before the runner exits.
///
/// This is the concrete answer to "graceful integration with a host
/// lifecycle signal" — register it with [`crate::queue::QueueCore`] and the
/// worker runner will stop polling for new work as soon as the host asks the
/// process to shut down.
pub struct SignalPlugin {
    triggered: std::sync::Arc<std::sync::atomic::AtomicBool>,
}

impl SignalPlugin {
    /// Install the plugin and spawn the background task that waits for the
    /// termination signal.
    pub fn install() -> Self {
        let triggered = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
        let flag = triggered.clone();
        tokio::spawn(async move {
            wait_for_shutdown_signal().await;
            flag.store(true, std::sync::atomic::Ordering::SeqCst);
            tracing::info!("termination signal received, finishing in-flight work");
        });
        Self { triggered }
    }

    /// Manually trip the flag (used by tests and by hosts that detect
    /// shutdown through a channel other than OS signals).
    pub fn trigger(&self) {
        self.triggered
            .store(true, std::sync::atomic::Ordering::SeqCst);
    }
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate()).expect("install SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

#[async_trait]
impl Plugin for SignalPlugin {
    fn should_keep_running(&self) -> bool {
        !self.triggered.load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct AlwaysStop;

    #[async_trait]
    impl Plugin for AlwaysStop {
        fn should_keep_running(&self) -> bool {
            false
        }
    }

    #[test]
    fn default_plugin_keeps_running() {
        struct Noop;
        #[async_trait]
        impl Plugin for Noop {}
        assert!(Noop.should_keep_running());
    }

    #[test]
    fn plugin_can_veto() {
        assert!(!AlwaysStop.should_keep_running());
    }

    #[test]
    fn signal_plugin_trigger_flips_flag_without_waiting_on_os_signal() {
        let triggered = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
        let plugin = SignalPlugin {
            triggered: triggered.clone(),
        };
        assert!(plugin.should_keep_running());
        plugin.trigger();
        assert!(!plugin.should_keep_running());
    }
}
