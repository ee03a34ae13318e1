//! Tokio-backed [Timer] implementation and the cancelable task handle
//! used for poll and expiry timers.

use fount_api::{BoxFut, DynTimer, Timer};
use std::sync::Arc;
use std::time::Duration;

/// Production [Timer] backed by [tokio::time::sleep].
///
/// Respects tokio's paused test clock, so engine tests can advance
/// virtual time instead of waiting on the wall clock.
#[derive(Debug)]
pub struct TokioTimer;

impl TokioTimer {
    /// Construct a new TokioTimer.
    pub fn create() -> DynTimer {
        Arc::new(Self)
    }
}

impl Timer for TokioTimer {
    fn sleep(&self, dur: Duration) -> BoxFut<'static, ()> {
        Box::pin(tokio::time::sleep(dur))
    }
}

/// A delayed callback running on its own task.
///
/// Dropping the handle cancels the callback if it has not fired yet.
/// A callback that is itself the one dropping the handle must call
/// [TimerTask::detach] instead, so it does not abort its own task.
pub(crate) struct TimerTask {
    task: Option<tokio::task::JoinHandle<()>>,
}

impl std::fmt::Debug for TimerTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimerTask").finish()
    }
}

impl TimerTask {
    pub fn spawn<F>(timer: DynTimer, dur: Duration, cb: F) -> Self
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let task = tokio::task::spawn(async move {
            timer.sleep(dur).await;
            cb.await;
        });
        Self { task: Some(task) }
    }

    /// Release the handle without canceling the task.
    pub fn detach(mut self) {
        self.task.take();
    }
}

impl Drop for TimerTask {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}
