//! The registry indexes resource entries by key and consumers by
//! identity, and is the single mutation point for consumer
//! registration and removal.
//!
//! All shared engine state lives here: a map from resource id to
//! [ResourceEntry] and a map from consumer id to the resources it
//! references. Both maps are the sole owners of their entries; a
//! resource entry is destroyed exactly when no mapping references it
//! and, if it has keep-alive, its grace timer has elapsed.
//!
//! A registry is an explicit, injectable instance. Tests construct a
//! fresh one per case; there is no hidden process-wide singleton.

use crate::provider::{ConsumerConfig, OnExpire, ResourceEntry};
use crate::scheduler::FetchScheduler;
use crate::timer::TokioTimer;
use fount_api::*;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

#[derive(Default)]
struct RegistryState {
    resources: HashMap<ResourceId, Arc<ResourceEntry>>,
    consumers: HashMap<ConsumerId, HashSet<ResourceId>>,
}

struct RegistryInner {
    scheduler: FetchScheduler,
    timer: DynTimer,
    tunables: Arc<Mutex<Tunables>>,
    id_seq: AtomicU64,
    state: Mutex<RegistryState>,
}

/// Coordinates fetching and sharing of keyed resources among dynamic
/// consumers. Cheaply clonable; clones share one instance.
#[derive(Clone)]
pub struct Registry {
    inner: Arc<RegistryInner>,
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock().unwrap();
        f.debug_struct("Registry")
            .field("resources", &state.resources.len())
            .field("consumers", &state.consumers.len())
            .finish()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new(TokioTimer::create())
    }
}

impl Registry {
    /// Construct a new Registry running on the given timer.
    pub fn new(timer: DynTimer) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                scheduler: FetchScheduler::new(),
                timer,
                tunables: Arc::new(Mutex::new(Tunables::default())),
                id_seq: AtomicU64::new(1),
                state: Mutex::new(RegistryState::default()),
            }),
        }
    }

    /// Replace the fetch timing configuration. Read at the start of
    /// each subsequent fetch cycle.
    pub fn set_config(&self, config: FetchConfig) {
        self.inner.tunables.lock().unwrap().fetch = config;
    }

    /// Set or clear the process-wide default response handler applied
    /// to resources without their own.
    pub fn set_default_response_handler(
        &self,
        handler: Option<DynResponseHandler>,
    ) {
        self.inner.tunables.lock().unwrap().response_handler = handler;
    }

    /// Register a consumer's interest in the resource a spec
    /// describes, creating the resource entry if the key was never
    /// seen, and trigger a fetch if the resource now requires one.
    pub fn add_consumer(
        &self,
        consumer: ConsumerId,
        spec: ProviderSpec,
    ) -> FountResult<()> {
        let ProviderSpec {
            key,
            fetch_fn,
            on_data,
            on_abort,
            response_handler,
            on_refresh,
            needed,
            polling_interval,
            keep_alive_for,
            initial_data,
        } = spec;

        let (entry, is_first, prior_polling, seed) = {
            let mut state = self.inner.state.lock().unwrap();

            let (entry, seed) = match find_by_key(&state, &key)? {
                Some(entry) => {
                    // Callbacks cannot change post-creation.
                    if let Some(fetch_fn) = fetch_fn.as_ref() {
                        if !Arc::ptr_eq(fetch_fn, entry.fetch_fn()) {
                            return Err(
                                FountError::ConflictingProviderSpec {
                                    key,
                                    what: "fetch_fn",
                                },
                            );
                        }
                    }
                    if let Some(on_data) = on_data.as_ref() {
                        if !Arc::ptr_eq(on_data, entry.on_data()) {
                            return Err(
                                FountError::ConflictingProviderSpec {
                                    key,
                                    what: "on_data",
                                },
                            );
                        }
                    }
                    if let Some(on_abort) = on_abort.as_ref() {
                        let matches = entry
                            .on_abort()
                            .map(|prev| Arc::ptr_eq(on_abort, prev))
                            .unwrap_or(false);
                        if !matches {
                            return Err(
                                FountError::ConflictingProviderSpec {
                                    key,
                                    what: "on_abort",
                                },
                            );
                        }
                    }
                    (entry, None)
                }
                None => {
                    let (Some(fetch_fn), Some(on_data)) =
                        (fetch_fn, on_data)
                    else {
                        return Err(FountError::MissingFetchSpec { key });
                    };
                    let id = ResourceId(
                        self.inner.id_seq.fetch_add(1, Ordering::Relaxed),
                    );
                    let entry = ResourceEntry::new(
                        id,
                        key,
                        fetch_fn,
                        on_data,
                        on_abort,
                        response_handler,
                        keep_alive_for,
                        self.inner.scheduler.clone(),
                        self.inner.timer.clone(),
                        self.inner.tunables.clone(),
                        self.on_expire(),
                    );
                    if initial_data.is_some() {
                        entry.mark_seeded();
                    }
                    state.resources.insert(id, entry.clone());
                    (entry, initial_data)
                }
            };

            // First-ness and the prior aggregate polling count disabled
            // grace-period configs too, so a revival within keep-alive
            // is neither treated as first nor as a polling decrease.
            let is_first = entry.consumer_count() == 0;
            let prior_polling = entry.polling_including_disabled();
            entry.purge_disabled();
            entry.resume();

            state
                .consumers
                .entry(consumer.clone())
                .or_default()
                .insert(entry.id());

            (entry, is_first, prior_polling, seed)
        };

        if let Some(data) = seed {
            entry.emit_initial(data);
        }

        entry.register(
            consumer,
            ConsumerConfig {
                needed,
                polling_interval,
                enabled: true,
                on_refresh,
            },
            is_first,
            prior_polling,
        );

        Ok(())
    }

    /// Remove a consumer from a resource. With keep-alive the config
    /// is disabled and the grace timer started once no enabled
    /// consumer remains; without, the config is removed and the entry
    /// evicted when unused.
    pub fn remove_consumer(
        &self,
        consumer: &ConsumerId,
        key: &ResourceKey,
    ) -> FountResult<()> {
        let mut state = self.inner.state.lock().unwrap();
        let Some(entry) = find_by_key(&state, key)? else {
            return Err(FountError::UnknownResource { key: key.clone() });
        };

        if entry.has_keep_alive() {
            if entry.disable(consumer) {
                entry.suspend();
            }
        } else {
            entry.remove_config(consumer);
            if entry.consumer_count() == 0 {
                state.resources.remove(&entry.id());
            }
        }

        if let Some(set) = state.consumers.get_mut(consumer) {
            set.remove(&entry.id());
            if set.is_empty() {
                state.consumers.remove(consumer);
            }
        }

        Ok(())
    }

    /// Reconcile a consumer's desired resource set: registers every
    /// spec and unregisters any of the consumer's keys no longer
    /// present. Idempotent for unchanged specs.
    pub fn subscribe(
        &self,
        consumer: ConsumerId,
        specs: Vec<ProviderSpec>,
    ) -> FountResult<()> {
        let mut wanted = HashSet::new();
        for spec in specs {
            wanted.insert(spec.key.clone());
            self.add_consumer(consumer.clone(), spec)?;
        }

        for key in self.keys_of(&consumer) {
            if !wanted.contains(&key) {
                self.remove_known(&consumer, &key)?;
            }
        }

        Ok(())
    }

    /// Remove a consumer from every resource it references.
    pub fn unsubscribe(&self, consumer: &ConsumerId) -> FountResult<()> {
        for key in self.keys_of(consumer) {
            self.remove_known(consumer, &key)?;
        }
        Ok(())
    }

    /// Removal of a key taken from the consumer index moments ago. An
    /// expiry firing in between may have evicted the entry already;
    /// that counts as removed.
    fn remove_known(
        &self,
        consumer: &ConsumerId,
        key: &ResourceKey,
    ) -> FountResult<()> {
        match self.remove_consumer(consumer, key) {
            Ok(()) | Err(FountError::UnknownResource { .. }) => Ok(()),
            Err(err) => Err(err),
        }
    }

    /// Force a fetch of the unique resource registered for the key,
    /// resolving when the fetch cycle completes.
    pub async fn refetch(&self, key: &ResourceKey) -> FountResult<()> {
        let entry = {
            let state = self.inner.state.lock().unwrap();
            find_by_key(&state, key)?.ok_or_else(|| {
                FountError::UnknownResource { key: key.clone() }
            })?
        };
        entry.submit_fetch(true, true).await;
        Ok(())
    }

    /// Aggregated status over the consumer's active resources, used by
    /// the embedding layer to decide between real content, a loading
    /// placeholder or an error placeholder.
    pub fn is_ready(&self, consumer: &ConsumerId) -> ReadyState {
        let state = self.inner.state.lock().unwrap();
        let mut out = ReadyState::default();
        let Some(set) = state.consumers.get(consumer) else {
            return out;
        };
        for id in set {
            let Some(entry) = state.resources.get(id) else {
                continue;
            };
            if let Some((needed, loaded, error)) = entry.status_for(consumer)
            {
                if needed && !loaded {
                    out.loaded = false;
                }
                if error {
                    out.error = true;
                }
            }
        }
        out
    }

    /// Loaded/error state of the resource registered for the key.
    pub fn status(&self, key: &ResourceKey) -> FountResult<ReadyState> {
        let entry = self.entry_for(key)?;
        Ok(ReadyState {
            loaded: entry.is_loaded(),
            error: entry.has_error(),
        })
    }

    /// Minimum polling interval over the resource's enabled consumers.
    pub fn effective_polling(
        &self,
        key: &ResourceKey,
    ) -> FountResult<Option<Duration>> {
        Ok(self.entry_for(key)?.effective_polling())
    }

    /// Whether any enabled consumer needs the resource.
    pub fn effective_needed(&self, key: &ResourceKey) -> FountResult<bool> {
        Ok(self.entry_for(key)?.effective_needed())
    }

    /// Whether the resource no longer fetches or commits results.
    pub fn is_canceled(&self, key: &ResourceKey) -> FountResult<bool> {
        Ok(self.entry_for(key)?.is_canceled())
    }

    /// Number of live resource entries.
    pub fn resource_count(&self) -> usize {
        self.inner.state.lock().unwrap().resources.len()
    }

    fn entry_for(&self, key: &ResourceKey) -> FountResult<Arc<ResourceEntry>> {
        let state = self.inner.state.lock().unwrap();
        find_by_key(&state, key)?
            .ok_or_else(|| FountError::UnknownResource { key: key.clone() })
    }

    fn keys_of(&self, consumer: &ConsumerId) -> Vec<ResourceKey> {
        let state = self.inner.state.lock().unwrap();
        state
            .consumers
            .get(consumer)
            .map(|set| {
                set.iter()
                    .filter_map(|id| state.resources.get(id))
                    .map(|entry| entry.key().clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    fn on_expire(&self) -> OnExpire {
        let weak = Arc::downgrade(&self.inner);
        Arc::new(move |id| {
            if let Some(inner) = Weak::upgrade(&weak) {
                Registry { inner }.expire(id);
            }
        })
    }

    /// The keep-alive grace period elapsed with no new consumer: the
    /// resource is permanently canceled and evicted.
    fn expire(&self, id: ResourceId) {
        let mut state = self.inner.state.lock().unwrap();
        let Some(entry) = state.resources.remove(&id) else {
            return;
        };
        entry.mark_expired();
        for set in state.consumers.values_mut() {
            set.remove(&id);
        }
        state.consumers.retain(|_, set| !set.is_empty());
    }
}

/// Scan the live entries for the key. Keys must be unique within a
/// registry at any instant.
fn find_by_key(
    state: &RegistryState,
    key: &ResourceKey,
) -> FountResult<Option<Arc<ResourceEntry>>> {
    let mut found = None;
    for entry in state.resources.values() {
        if entry.key() == key {
            if found.is_some() {
                return Err(FountError::AmbiguousRef { key: key.clone() });
            }
            found = Some(entry.clone());
        }
    }
    Ok(found)
}

#[cfg(test)]
mod test;
