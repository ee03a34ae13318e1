//! Prioritized dispatch of fetch invocations.
//!
//! A fetch flagged "needed" is one a consumer cannot proceed without.
//! Needed fetches execute immediately and concurrently with each other.
//! A not-needed fetch is deferred by one scheduling tick so that needed
//! fetches queued in the same synchronous batch are observed first; if
//! any needed fetch is still in flight at that point, the not-needed
//! invocation is parked instead of run. When the last in-flight needed
//! fetch completes, the entire parked backlog is drained.
//!
//! Every scheduled fetch receives a strictly increasing fetch id, which
//! resource entries use to discard stale completions.

use fount_api::BoxFut;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;

/// A scheduled fetch invocation. Receives the assigned fetch id and
/// the force flag it was scheduled with.
pub type FetchJob = Box<dyn FnOnce(u64, bool) -> BoxFut<'static, ()> + Send>;

struct QueuedJob {
    job: FetchJob,
    fetch_id: u64,
    force: bool,
    done: oneshot::Sender<()>,
}

#[derive(Default)]
struct State {
    needed_in_flight: usize,
    not_needed_queue: VecDeque<QueuedJob>,
}

struct Inner {
    state: Mutex<State>,
    fetch_id_seq: AtomicU64,
}

/// Orders and prioritizes pending fetch invocations. Cheaply clonable;
/// clones share one queue.
#[derive(Clone)]
pub struct FetchScheduler {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for FetchScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock().unwrap();
        f.debug_struct("FetchScheduler")
            .field("needed_in_flight", &state.needed_in_flight)
            .field("not_needed_queued", &state.not_needed_queue.len())
            .finish()
    }
}

impl Default for FetchScheduler {
    fn default() -> Self {
        Self::new()
    }
}

/// Restores the needed-fetch count when a needed job finishes,
/// draining the parked backlog if it was the last one.
struct NeededGuard(FetchScheduler);

impl Drop for NeededGuard {
    fn drop(&mut self) {
        self.0.needed_done();
    }
}

impl FetchScheduler {
    /// Construct a new FetchScheduler.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::default()),
                fetch_id_seq: AtomicU64::new(0),
            }),
        }
    }

    /// Schedule a fetch invocation.
    ///
    /// The returned future resolves once the job has run to completion,
    /// which for a not-needed job may be after an arbitrary number of
    /// needed fetches have drained.
    pub fn schedule(
        &self,
        force: bool,
        needed: bool,
        job: FetchJob,
    ) -> BoxFut<'static, ()> {
        let fetch_id = self.inner.fetch_id_seq.fetch_add(1, Ordering::Relaxed);
        let (done_tx, done_rx) = oneshot::channel();

        if needed {
            // Claim the slot synchronously, so a not-needed job scheduled
            // in the same synchronous batch observes this fetch as
            // already in flight.
            self.inner.state.lock().unwrap().needed_in_flight += 1;
            let guard = NeededGuard(self.clone());
            tokio::task::spawn(async move {
                let _guard = guard;
                job(fetch_id, force).await;
                let _ = done_tx.send(());
            });
        } else {
            let this = self.clone();
            tokio::task::spawn(async move {
                // Defer one tick in case needed fetches are still being
                // queued by the same caller.
                tokio::task::yield_now().await;

                let run_now = {
                    let mut state = this.inner.state.lock().unwrap();
                    if state.needed_in_flight > 0 {
                        state.not_needed_queue.push_back(QueuedJob {
                            job,
                            fetch_id,
                            force,
                            done: done_tx,
                        });
                        None
                    } else {
                        Some((job, done_tx))
                    }
                };

                if let Some((job, done_tx)) = run_now {
                    job(fetch_id, force).await;
                    let _ = done_tx.send(());
                }
            });
        }

        Box::pin(async move {
            let _ = done_rx.await;
        })
    }

    fn needed_done(&self) {
        let drained = {
            let mut state = self.inner.state.lock().unwrap();
            state.needed_in_flight -= 1;
            if state.needed_in_flight == 0 {
                std::mem::take(&mut state.not_needed_queue)
            } else {
                VecDeque::new()
            }
        };

        for queued in drained {
            tokio::task::spawn(async move {
                (queued.job)(queued.fetch_id, queued.force).await;
                let _ = queued.done.send(());
            });
        }
    }
}
