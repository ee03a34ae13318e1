//! The per-resource data provider state machine.
//!
//! A [ResourceEntry] owns everything about one logical resource: the
//! injected fetch operation, the consumers currently interested in it,
//! and the fetch / retry / poll / expiry lifecycle. Entries move
//! through `Idle -> Fetching -> {Loaded | Error}` with an orthogonal
//! suspended flag while the keep-alive grace timer runs, and a terminal
//! expired state once it fires.
//!
//! ### Fetch cycles
//!
//! A fetch cycle is one full attempt to obtain and process data:
//!
//! - The raw data is retrieved with a timeout race: the fetch operation
//!   is raced against a timer; if the timer wins, another attempt is
//!   issued while earlier attempts are kept alive. The first attempt to
//!   complete successfully wins; losing attempts are discarded, not
//!   canceled. Exhausting the retry budget without any attempt
//!   completing fails the cycle.
//! - The raw result passes through the response handler, which may
//!   accept it, reject it, or request another full cycle.
//! - Results are committed last-fetch-wins: a completion whose fetch id
//!   is older than the last committed one is discarded as stale.
//!
//! A failed background poll keeps the last good data; only initial
//! loads and forced refetches surface their failure through the abort
//! callback.

use crate::scheduler::FetchScheduler;
use crate::timer::TimerTask;
use bytes::Bytes;
use fount_api::*;
use futures::stream::{FuturesUnordered, StreamExt};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Callback into the registry when the keep-alive grace timer fires.
pub(crate) type OnExpire = Arc<dyn Fn(ResourceId) + 'static + Send + Sync>;

/// Per-consumer registration state for one resource.
#[derive(Clone)]
pub(crate) struct ConsumerConfig {
    pub needed: bool,
    pub polling_interval: Option<Duration>,
    /// False during the keep-alive grace period after the consumer
    /// detached.
    pub enabled: bool,
    pub on_refresh: Option<DynOnRefresh>,
}

struct EntryState {
    consumers: HashMap<ConsumerId, ConsumerConfig>,
    loaded: bool,
    has_error: bool,
    /// Supports overlapping forced fetches. Incremented when a cycle
    /// starts and decremented exactly once when it ends, success or
    /// failure.
    fetching_count: u32,
    expired: bool,
    /// Highest fetch sequence number that completed successfully.
    /// Monotonically non-decreasing; prevents stale in-flight fetches
    /// from overwriting newer data.
    last_fetch_id: u64,
    poll_timer: Option<TimerTask>,
    expiry_timer: Option<TimerTask>,
}

/// A single keyed, independently fetchable unit of data and the state
/// machine keeping it fresh for its current consumers.
pub struct ResourceEntry {
    id: ResourceId,
    key: ResourceKey,
    fetch_fn: DynFetchFn,
    on_data: DynOnData,
    on_abort: Option<DynOnAbort>,
    response_handler: Option<DynResponseHandler>,
    keep_alive_for: Option<Duration>,
    scheduler: FetchScheduler,
    timer: DynTimer,
    tunables: Arc<Mutex<Tunables>>,
    on_expire: OnExpire,
    state: Mutex<EntryState>,
}

impl std::fmt::Debug for ResourceEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock().unwrap();
        f.debug_struct("ResourceEntry")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("loaded", &state.loaded)
            .field("has_error", &state.has_error)
            .field("expired", &state.expired)
            .field("consumers", &state.consumers.len())
            .finish()
    }
}

/// Restores `fetching_count` when a fetch cycle ends, no matter how.
struct FetchingGuard<'a>(&'a ResourceEntry);

impl Drop for FetchingGuard<'_> {
    fn drop(&mut self) {
        self.0.state.lock().unwrap().fetching_count -= 1;
    }
}

/// What one fetch cycle produced, before committing.
enum CycleOutcome {
    Data(Bytes),
    Failed {
        partial: Option<Bytes>,
        err: FountError,
    },
}

impl ResourceEntry {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: ResourceId,
        key: ResourceKey,
        fetch_fn: DynFetchFn,
        on_data: DynOnData,
        on_abort: Option<DynOnAbort>,
        response_handler: Option<DynResponseHandler>,
        keep_alive_for: Option<Duration>,
        scheduler: FetchScheduler,
        timer: DynTimer,
        tunables: Arc<Mutex<Tunables>>,
        on_expire: OnExpire,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            key,
            fetch_fn,
            on_data,
            on_abort,
            response_handler,
            keep_alive_for,
            scheduler,
            timer,
            tunables,
            on_expire,
            state: Mutex::new(EntryState {
                consumers: HashMap::new(),
                loaded: false,
                has_error: false,
                fetching_count: 0,
                expired: false,
                last_fetch_id: 0,
                poll_timer: None,
                expiry_timer: None,
            }),
        })
    }

    pub(crate) fn id(&self) -> ResourceId {
        self.id
    }

    /// The key identifying this resource.
    pub fn key(&self) -> &ResourceKey {
        &self.key
    }

    pub(crate) fn fetch_fn(&self) -> &DynFetchFn {
        &self.fetch_fn
    }

    pub(crate) fn on_data(&self) -> &DynOnData {
        &self.on_data
    }

    pub(crate) fn on_abort(&self) -> Option<&DynOnAbort> {
        self.on_abort.as_ref()
    }

    pub(crate) fn has_keep_alive(&self) -> bool {
        self.keep_alive_for.is_some()
    }

    /// Whether a successful fetch has been committed (or initial data
    /// was seeded) and not since invalidated.
    pub fn is_loaded(&self) -> bool {
        self.state.lock().unwrap().loaded
    }

    /// Whether the last surfaced fetch cycle failed.
    pub fn has_error(&self) -> bool {
        self.state.lock().unwrap().has_error
    }

    /// Minimum polling interval over all enabled consumers.
    /// `None` means no consumer wants polling.
    pub fn effective_polling(&self) -> Option<Duration> {
        self.state
            .lock()
            .unwrap()
            .consumers
            .values()
            .filter(|c| c.enabled)
            .filter_map(|c| c.polling_interval)
            .min()
    }

    /// Whether any enabled consumer needs this resource before it can
    /// proceed.
    pub fn effective_needed(&self) -> bool {
        self.state
            .lock()
            .unwrap()
            .consumers
            .values()
            .any(|c| c.enabled && c.needed)
    }

    /// A canceled resource no longer fetches or commits results.
    pub fn is_canceled(&self) -> bool {
        self.canceled_locked(&self.state.lock().unwrap())
    }

    /// Whether the keep-alive grace timer is running.
    pub fn is_suspended(&self) -> bool {
        self.state.lock().unwrap().expiry_timer.is_some()
    }

    fn canceled_locked(&self, state: &EntryState) -> bool {
        state.expired
            || (self.keep_alive_for.is_none()
                && !state.consumers.values().any(|c| c.enabled))
    }

    fn effective_polling_locked(state: &EntryState) -> Option<Duration> {
        state
            .consumers
            .values()
            .filter(|c| c.enabled)
            .filter_map(|c| c.polling_interval)
            .min()
    }

    fn all_polling_locked(state: &EntryState) -> Option<Duration> {
        state
            .consumers
            .values()
            .filter_map(|c| c.polling_interval)
            .min()
    }

    /// Minimum polling interval over all configs, disabled grace-period
    /// configs included. A revival snapshots this before purging the
    /// disabled configs, so the prior aggregate it compares against is
    /// the one that was actually in effect.
    pub(crate) fn polling_including_disabled(&self) -> Option<Duration> {
        Self::all_polling_locked(&self.state.lock().unwrap())
    }

    /// Number of consumer configs, enabled or disabled.
    pub(crate) fn consumer_count(&self) -> usize {
        self.state.lock().unwrap().consumers.len()
    }

    /// This consumer's (needed, entry loaded, entry error) status, if
    /// it has an enabled config here.
    pub(crate) fn status_for(
        &self,
        consumer: &ConsumerId,
    ) -> Option<(bool, bool, bool)> {
        let state = self.state.lock().unwrap();
        state
            .consumers
            .get(consumer)
            .filter(|c| c.enabled)
            .map(|c| (c.needed, state.loaded, state.has_error))
    }

    /// Mark the entry loaded from initial data, without a fetch.
    /// Must happen before the first registration.
    pub(crate) fn mark_seeded(&self) {
        self.state.lock().unwrap().loaded = true;
    }

    /// Deliver seeded initial data. Runs outside any registry lock
    /// since the callback may re-enter the registry.
    pub(crate) fn emit_initial(&self, data: Bytes) {
        (self.on_data)(&self.key, data);
    }

    /// Upsert a consumer config and trigger a fetch if this entry now
    /// requires one: first registration ever, a polling interval
    /// decreased below the prior aggregate, or never-loaded data with
    /// no poll pending. `prior_polling` is the aggregate as it stood
    /// before any revival purge, disabled grace-period configs
    /// included, so reviving a kept-alive poller is not mistaken for a
    /// decrease.
    pub(crate) fn register(
        self: &Arc<Self>,
        consumer: ConsumerId,
        config: ConsumerConfig,
        is_first: bool,
        prior_polling: Option<Duration>,
    ) {
        let trigger = {
            let mut state = self.state.lock().unwrap();
            state.consumers.insert(consumer, config);
            let new_polling = Self::effective_polling_locked(&state);

            let polling_decreased = match (prior_polling, new_polling) {
                (None, Some(_)) => true,
                (Some(old), Some(new)) => new < old,
                _ => false,
            };

            is_first
                || polling_decreased
                || (!state.loaded && state.poll_timer.is_none())
        };

        if trigger {
            drop(self.submit_fetch(false, self.effective_needed()));
        }
    }

    /// Mark a consumer's config disabled for the keep-alive grace
    /// period. Returns true if no enabled config remains.
    pub(crate) fn disable(&self, consumer: &ConsumerId) -> bool {
        let mut state = self.state.lock().unwrap();
        if let Some(config) = state.consumers.get_mut(consumer) {
            config.enabled = false;
            config.on_refresh = None;
        }
        !state.consumers.values().any(|c| c.enabled)
    }

    /// Remove a consumer's config entirely (no keep-alive path).
    pub(crate) fn remove_config(&self, consumer: &ConsumerId) {
        self.state.lock().unwrap().consumers.remove(consumer);
    }

    /// Drop configs left disabled by a previous keep-alive grace
    /// period. Called on revival before the new config is inserted.
    pub(crate) fn purge_disabled(&self) {
        self.state
            .lock()
            .unwrap()
            .consumers
            .retain(|_, c| c.enabled);
    }

    /// Start the keep-alive grace timer. No-op without keep-alive or
    /// when already suspended. A pending poll timer is left running;
    /// polls fired while suspended still execute.
    pub(crate) fn suspend(self: &Arc<Self>) {
        let Some(keep_alive_for) = self.keep_alive_for else {
            return;
        };
        let mut state = self.state.lock().unwrap();
        if state.expiry_timer.is_some() || state.expired {
            return;
        }
        let id = self.id;
        let on_expire = self.on_expire.clone();
        state.expiry_timer = Some(TimerTask::spawn(
            self.timer.clone(),
            keep_alive_for,
            async move {
                on_expire(id);
            },
        ));
        tracing::debug!(key = %self.key, "resource suspended");
    }

    /// Cancel a running keep-alive grace timer.
    pub(crate) fn resume(&self) {
        self.state.lock().unwrap().expiry_timer = None;
    }

    /// Enter the terminal expired state. The registry evicts the entry
    /// right after.
    pub(crate) fn mark_expired(&self) {
        let mut state = self.state.lock().unwrap();
        state.expired = true;
        state.consumers.clear();
        state.poll_timer = None;
        if let Some(timer) = state.expiry_timer.take() {
            // Called from within the expiry task itself.
            timer.detach();
        }
        tracing::debug!(key = %self.key, "resource expired");
    }

    /// Submit a fetch through the scheduler. The returned future
    /// resolves when the fetch cycle has run (or was skipped).
    pub(crate) fn submit_fetch(
        self: &Arc<Self>,
        force: bool,
        needed: bool,
    ) -> BoxFut<'static, ()> {
        let this = self.clone();
        self.scheduler.schedule(
            force,
            needed,
            Box::new(move |fetch_id, force| {
                Box::pin(async move {
                    this.do_fetch(fetch_id, force).await;
                })
            }),
        )
    }

    /// One fetch cycle: timeout-raced retrieval, response handling,
    /// last-fetch-wins commit, poll rescheduling.
    async fn do_fetch(self: &Arc<Self>, fetch_id: u64, force: bool) {
        // Late-bound settings, snapshotted per cycle.
        let tunables = self.tunables.lock().unwrap().clone();

        {
            let mut state = self.state.lock().unwrap();
            if self.canceled_locked(&state) {
                return;
            }
            if state.fetching_count > 0 && !force {
                tracing::debug!(
                    key = %self.key,
                    "fetch already in flight, skipping"
                );
                return;
            }
            if state.last_fetch_id > fetch_id {
                tracing::debug!(
                    key = %self.key,
                    fetch_id,
                    "a newer fetch already completed, skipping"
                );
                return;
            }
            state.fetching_count += 1;
            // A running cycle owns the next poll decision.
            state.poll_timer = None;
        }
        let _guard = FetchingGuard(self);

        let mut handler_retries = 0_u32;
        let outcome = loop {
            let raw = match self.get_data_with_retry(&tunables.fetch).await {
                Ok(raw) => raw,
                Err(err) => {
                    break CycleOutcome::Failed { partial: None, err }
                }
            };

            let handler = self
                .response_handler
                .as_ref()
                .or(tunables.response_handler.as_ref());
            let verdict = match handler {
                Some(handler) => handler(raw),
                None => Response::Data(raw),
            };

            match verdict {
                Response::Data(data) => break CycleOutcome::Data(data),
                Response::Abort(partial) => {
                    break CycleOutcome::Failed {
                        partial,
                        err: FountError::AbortSignaled,
                    }
                }
                Response::Retry => {
                    if handler_retries >= tunables.fetch.max_timeout_retries {
                        tracing::warn!(
                            key = %self.key,
                            "response handler exhausted its retry budget"
                        );
                        break CycleOutcome::Failed {
                            partial: None,
                            err: FountError::AbortSignaled,
                        };
                    }
                    handler_retries += 1;
                }
            }
        };

        match outcome {
            CycleOutcome::Data(data) => self.commit_data(fetch_id, data),
            CycleOutcome::Failed { partial, err } => {
                self.commit_failure(force, partial, err)
            }
        }

        self.schedule_next_poll();
    }

    /// Race the fetch operation against the configured timeout,
    /// issuing up to `max_timeout_retries` extra attempts. Earlier
    /// attempts stay in the race; the first to complete successfully
    /// wins. Attempt errors lose the race without ending it.
    async fn get_data_with_retry(
        &self,
        config: &FetchConfig,
    ) -> FountResult<Bytes> {
        let mut attempts = FuturesUnordered::new();
        attempts.push((self.fetch_fn)());
        let mut made: u32 = 1;

        loop {
            let mut window = self.timer.sleep(config.fetch_timeout);

            loop {
                tokio::select! {
                    // An empty race disables this branch and waits out
                    // the window.
                    Some(res) = attempts.next() => match res {
                        Ok(raw) => return Ok(raw),
                        Err(err) => {
                            // A failing attempt loses the race without
                            // ending it.
                            tracing::debug!(
                                key = %self.key,
                                "fetch attempt failed: {err}"
                            );
                        }
                    },
                    _ = &mut window => break,
                }
            }

            if made > config.max_timeout_retries {
                return Err(FountError::FetchTimeout { attempts: made });
            }
            attempts.push((self.fetch_fn)());
            made += 1;
        }
    }

    /// Commit usable data unless this cycle became stale or the entry
    /// was canceled while fetching.
    fn commit_data(&self, fetch_id: u64, data: Bytes) {
        let refreshes = {
            let mut state = self.state.lock().unwrap();
            if self.canceled_locked(&state) || state.last_fetch_id > fetch_id
            {
                tracing::debug!(
                    key = %self.key,
                    fetch_id,
                    "discarding stale fetch result"
                );
                None
            } else {
                state.loaded = true;
                state.has_error = false;
                state.last_fetch_id = fetch_id;
                Some(Self::refresh_list(&state))
            }
        };

        // Callbacks run outside the state lock. They may re-enter the
        // registry.
        if let Some(refreshes) = refreshes {
            (self.on_data)(&self.key, data);
            for refresh in refreshes {
                refresh();
            }
        }
    }

    /// A forced fetch or an initial load surfaces its failure; a failed
    /// background poll silently keeps the last good data.
    fn commit_failure(
        &self,
        force: bool,
        partial: Option<Bytes>,
        err: FountError,
    ) {
        let refreshes = {
            let mut state = self.state.lock().unwrap();
            if self.canceled_locked(&state) {
                return;
            }
            if !force && state.loaded {
                tracing::debug!(
                    key = %self.key,
                    "poll failed, keeping last good data: {err}"
                );
                return;
            }
            state.loaded = false;
            state.has_error = true;
            Self::refresh_list(&state)
        };

        tracing::warn!(key = %self.key, "fetch aborted: {err}");
        if let Some(on_abort) = self.on_abort.as_ref() {
            on_abort(&self.key, partial);
        }
        for refresh in refreshes {
            refresh();
        }
    }

    fn refresh_list(state: &EntryState) -> Vec<DynOnRefresh> {
        state
            .consumers
            .values()
            .filter(|c| c.enabled)
            .filter_map(|c| c.on_refresh.clone())
            .collect()
    }

    /// Arm the poll timer from the current aggregate polling interval.
    /// No timer when polling is unbounded or the entry is canceled.
    /// While the keep-alive grace timer runs, polling continues at the
    /// cadence of the disabled configs until expiry.
    fn schedule_next_poll(self: &Arc<Self>) {
        let mut state = self.state.lock().unwrap();
        if self.canceled_locked(&state) {
            return;
        }
        let interval = match Self::effective_polling_locked(&state) {
            Some(interval) => interval,
            None if state.expiry_timer.is_some() => {
                match Self::all_polling_locked(&state) {
                    Some(interval) => interval,
                    None => return,
                }
            }
            None => return,
        };

        let this = self.clone();
        state.poll_timer = Some(TimerTask::spawn(
            self.timer.clone(),
            interval,
            async move {
                this.on_poll_tick();
            },
        ));
    }

    fn on_poll_tick(self: &Arc<Self>) {
        {
            let mut state = self.state.lock().unwrap();
            if let Some(timer) = state.poll_timer.take() {
                // This tick is the timer task; detach, don't abort.
                timer.detach();
            }
        }
        drop(self.submit_fetch(false, self.effective_needed()));
    }
}
