//! Periodic eviction of old traces.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::service::ObservabilityService;

/// Handle to a running cleanup task. Dropping it leaves the task running.
pub struct JanitorHandle {
    shutdown_tx: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl JanitorHandle {
    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Signals the task to stop and waits for it to exit.
    pub async fn shutdown(mut self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                tracing::warn!("Cleanup task ended abnormally: {}", e);
            }
        }
    }
}

/// Runs [`ObservabilityService::cleanup_old_traces`] every `interval_ms`.
///
/// An interval of zero disables the task.
pub fn spawn_cleanup_task(service: Arc<ObservabilityService>, interval_ms: u64) -> JanitorHandle {
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

    if interval_ms == 0 {
        tracing::warn!("Cleanup interval is 0, background eviction disabled");
        return JanitorHandle {
            shutdown_tx,
            task: None,
        };
    }

    let task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_millis(interval_ms));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // First tick completes immediately.
        ticker.tick().await;

        tracing::debug!(interval_ms, "Cleanup task started");
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    service.cleanup_old_traces().await;
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::debug!("Cleanup task stopped");
    });

    JanitorHandle {
        shutdown_tx,
        task: Some(task),
    }
}
