//! Callback contracts between the fount engine and the code embedding it.
//!
//! A "provider" is the description a consumer hands to the registry when
//! it registers interest in a resource: how to fetch the raw data, where
//! decoded data should go, and how eagerly the resource should be kept
//! fresh. The engine owns the coordination; everything in this module is
//! the boundary surface.

use crate::{id::ResourceKey, BoxFut, FountResult};
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;

/// The injected, zero-argument asynchronous fetch operation producing
/// raw data or failing. The engine never interprets the transport.
pub type DynFetchFn =
    Arc<dyn Fn() -> BoxFut<'static, FountResult<Bytes>> + 'static + Send + Sync>;

/// Callback invoked with decoded data whenever a fetch cycle commits.
pub type DynOnData =
    Arc<dyn Fn(&ResourceKey, Bytes) + 'static + Send + Sync>;

/// Callback invoked when no data could be obtained for a fetch cycle
/// that is allowed to surface its failure. May carry partial error data
/// supplied by the response handler.
pub type DynOnAbort =
    Arc<dyn Fn(&ResourceKey, Option<Bytes>) + 'static + Send + Sync>;

/// Per-consumer notification that the consumer's visible status
/// (loaded / error / data) may have changed. The embedding layer decides
/// how and whether to react.
pub type DynOnRefresh = Arc<dyn Fn() + 'static + Send + Sync>;

/// Verdict returned by a [DynResponseHandler].
#[derive(Debug, Clone)]
pub enum Response {
    /// The response is usable data to be committed.
    Data(Bytes),

    /// Discard this response and run another full fetch cycle.
    /// Bounded by the configured retry budget.
    Retry,

    /// Reject this response. Optionally carries partial error data to
    /// be passed to the abort callback.
    Abort(Option<Bytes>),
}

/// Transform or validate the raw fetch result before it is committed.
pub type DynResponseHandler =
    Arc<dyn Fn(Bytes) -> Response + 'static + Send + Sync>;

/// A consumer's description of one resource it wants the engine to
/// maintain on its behalf.
///
/// The fetch and data callbacks are fixed at resource creation. A later
/// registration for the same key may leave them `None`, but if it sets
/// them they must be the same `Arc`s (pointer identity), otherwise the
/// registration fails with
/// [ConflictingProviderSpec](crate::FountError::ConflictingProviderSpec).
#[derive(Clone)]
pub struct ProviderSpec {
    /// The key of the resource this spec describes.
    pub key: ResourceKey,

    /// How to fetch the raw data. Required for a never-seen key.
    pub fetch_fn: Option<DynFetchFn>,

    /// Where decoded data goes. Required for a never-seen key.
    pub on_data: Option<DynOnData>,

    /// Invoked when a surfaced fetch cycle obtained no data.
    pub on_abort: Option<DynOnAbort>,

    /// Per-resource response handler. Falls back to the process-wide
    /// default when unset.
    pub response_handler: Option<DynResponseHandler>,

    /// Refresh notification for this consumer.
    pub on_refresh: Option<DynOnRefresh>,

    /// Whether this consumer cannot proceed without the data.
    pub needed: bool,

    /// Desired polling interval. `None` means never poll.
    pub polling_interval: Option<Duration>,

    /// Grace period retaining the resource after the last consumer
    /// detaches. `None` means discard immediately.
    pub keep_alive_for: Option<Duration>,

    /// Data seeding the resource at creation without a fetch.
    pub initial_data: Option<Bytes>,
}

impl ProviderSpec {
    /// Construct a spec for the given key with defaults:
    /// needed, no polling, no keep-alive, no callbacks.
    pub fn new<K: Into<ResourceKey>>(key: K) -> Self {
        Self {
            key: key.into(),
            fetch_fn: None,
            on_data: None,
            on_abort: None,
            response_handler: None,
            on_refresh: None,
            needed: true,
            polling_interval: None,
            keep_alive_for: None,
            initial_data: None,
        }
    }

    /// Set the fetch operation and data callback.
    pub fn with_fetch(
        mut self,
        fetch_fn: DynFetchFn,
        on_data: DynOnData,
    ) -> Self {
        self.fetch_fn = Some(fetch_fn);
        self.on_data = Some(on_data);
        self
    }

    /// Set the abort callback.
    pub fn with_on_abort(mut self, on_abort: DynOnAbort) -> Self {
        self.on_abort = Some(on_abort);
        self
    }

    /// Set a per-resource response handler.
    pub fn with_response_handler(
        mut self,
        handler: DynResponseHandler,
    ) -> Self {
        self.response_handler = Some(handler);
        self
    }

    /// Set the refresh notification callback.
    pub fn with_on_refresh(mut self, on_refresh: DynOnRefresh) -> Self {
        self.on_refresh = Some(on_refresh);
        self
    }

    /// Set whether this consumer must have the data before proceeding.
    pub fn with_needed(mut self, needed: bool) -> Self {
        self.needed = needed;
        self
    }

    /// Set the desired polling interval.
    pub fn with_polling(mut self, interval: Duration) -> Self {
        self.polling_interval = Some(interval);
        self
    }

    /// Set the keep-alive grace period.
    pub fn with_keep_alive(mut self, keep_alive_for: Duration) -> Self {
        self.keep_alive_for = Some(keep_alive_for);
        self
    }

    /// Seed the resource with initial data.
    pub fn with_initial_data(mut self, data: Bytes) -> Self {
        self.initial_data = Some(data);
        self
    }
}

impl std::fmt::Debug for ProviderSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderSpec")
            .field("key", &self.key)
            .field("needed", &self.needed)
            .field("polling_interval", &self.polling_interval)
            .field("keep_alive_for", &self.keep_alive_for)
            .field("has_fetch_fn", &self.fetch_fn.is_some())
            .field("has_initial_data", &self.initial_data.is_some())
            .finish()
    }
}

/// Aggregated status of one consumer's active resources.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadyState {
    /// Every resource this consumer needs is loaded.
    pub loaded: bool,

    /// At least one of this consumer's resources is in an error state.
    pub error: bool,
}

impl Default for ReadyState {
    fn default() -> Self {
        Self {
            loaded: true,
            error: false,
        }
    }
}
