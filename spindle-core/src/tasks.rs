//! Cancellable background task handles
//!
//! Background tasks started to run a service are independent of the
//! caller's lifetime. Each one is owned through a [`TaskHandle`]: an
//! explicit, idempotent stop path that requests termination without waiting
//! for the task to notice, a hard abort, and a separate bounded join for
//! callers who want to block until completion.

use std::future::Future;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Handle to a spawned background task.
pub struct TaskHandle {
    name: String,
    shutdown_tx: Mutex<Option<oneshot::Sender<()>>>,
    join_handle: Mutex<Option<JoinHandle<()>>>,
}

impl TaskHandle {
    /// Spawn a task. The closure receives the shutdown receiver and should
    /// select on it alongside its own work.
    pub fn spawn<F, Fut>(name: impl Into<String>, task: F) -> Self
    where
        F: FnOnce(oneshot::Receiver<()>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let name = name.into();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let join_handle = tokio::spawn(task(shutdown_rx));
        debug!(task = %name, "background task started");
        Self {
            name,
            shutdown_tx: Mutex::new(Some(shutdown_tx)),
            join_handle: Mutex::new(Some(join_handle)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Request termination without waiting for the task to notice.
    /// Idempotent: later calls are no-ops.
    pub fn request_stop(&self) {
        if let Some(tx) = self.shutdown_tx.lock().take() {
            // The task may already have exited; a closed channel is fine.
            let _ = tx.send(());
            debug!(task = %self.name, "stop requested");
        }
    }

    /// Whether a stop has already been requested.
    pub fn is_stop_requested(&self) -> bool {
        self.shutdown_tx.lock().is_none()
    }

    /// Hard-cancel the task at the next await point.
    pub fn abort(&self) {
        if let Some(handle) = self.join_handle.lock().as_ref() {
            handle.abort();
        }
    }

    /// Whether the task has finished (completed, aborted, or joined).
    pub fn is_finished(&self) -> bool {
        match self.join_handle.lock().as_ref() {
            Some(handle) => handle.is_finished(),
            None => true,
        }
    }

    /// Wait for the task to finish, bounded by `timeout`. Returns false if
    /// the task was still running (or already joined) when the bound
    /// elapsed.
    pub async fn join(&self, timeout: Duration) -> bool {
        let handle = self.join_handle.lock().take();
        let Some(handle) = handle else {
            return false;
        };
        match tokio::time::timeout(timeout, handle).await {
            Ok(Ok(())) => true,
            Ok(Err(join_err)) => {
                // Aborted tasks land here; anything else is a panic worth noting.
                if !join_err.is_cancelled() {
                    warn!(task = %self.name, error = %join_err, "background task panicked");
                }
                true
            }
            Err(_) => {
                warn!(task = %self.name, ?timeout, "background task did not stop in time");
                false
            }
        }
    }

    /// Request stop and join with a bound, in one call.
    pub async fn stop_and_join(&self, timeout: Duration) -> bool {
        self.request_stop();
        self.join(timeout).await
    }
}

impl Drop for TaskHandle {
    fn drop(&mut self) {
        self.request_stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn stop_is_idempotent_and_join_is_bounded() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = ticks.clone();
        let handle = TaskHandle::spawn("ticker", move |mut shutdown| async move {
            let mut interval = tokio::time::interval(Duration::from_millis(5));
            loop {
                tokio::select! {
                    _ = &mut shutdown => break,
                    _ = interval.tick() => {
                        counter.fetch_add(1, Ordering::SeqCst);
                    }
                }
            }
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        handle.request_stop();
        handle.request_stop();
        assert!(handle.is_stop_requested());
        assert!(handle.join(Duration::from_secs(1)).await);
        assert!(handle.is_finished());
        assert!(ticks.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test]
    async fn abort_cancels_a_deaf_task() {
        let handle = TaskHandle::spawn("deaf", |_shutdown| async {
            // Ignores its shutdown channel entirely.
            loop {
                tokio::time::sleep(Duration::from_secs(60)).await;
            }
        });

        handle.request_stop();
        handle.abort();
        assert!(handle.join(Duration::from_secs(1)).await);
    }

    #[tokio::test]
    async fn join_after_join_reports_false() {
        let handle = TaskHandle::spawn("oneshot", |_shutdown| async {});
        assert!(handle.join(Duration::from_secs(1)).await);
        assert!(!handle.join(Duration::from_millis(10)).await);
    }
}
