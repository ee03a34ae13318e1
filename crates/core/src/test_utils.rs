//! Helpers shared by the engine tests.

use bytes::Bytes;
use fount_api::*;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Enable tracing output for tests.
pub fn enable_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::filter::EnvFilter::new("debug"),
        )
        .with_test_writer()
        .try_init();
}

/// A fetch fn resolving after `delay` with the zero-based call index
/// rendered as bytes. Returns the fn and the shared call counter.
pub fn counting_fetch(delay: Duration) -> (DynFetchFn, Arc<AtomicU32>) {
    let count = Arc::new(AtomicU32::new(0));
    let fetch: DynFetchFn = {
        let count = count.clone();
        Arc::new(move || {
            let n = count.fetch_add(1, Ordering::SeqCst);
            Box::pin(async move {
                tokio::time::sleep(delay).await;
                Ok(Bytes::from(n.to_string()))
            })
        })
    };
    (fetch, count)
}

/// Like [counting_fetch], but each call sleeps for the delay at its
/// index in the schedule. Calls past the end reuse the last delay.
pub fn staggered_fetch(
    delays: Vec<Duration>,
) -> (DynFetchFn, Arc<AtomicU32>) {
    let count = Arc::new(AtomicU32::new(0));
    let fetch: DynFetchFn = {
        let count = count.clone();
        Arc::new(move || {
            let n = count.fetch_add(1, Ordering::SeqCst);
            let delay = delays
                .get(n as usize)
                .or(delays.last())
                .copied()
                .unwrap_or(Duration::ZERO);
            Box::pin(async move {
                tokio::time::sleep(delay).await;
                Ok(Bytes::from(n.to_string()))
            })
        })
    };
    (fetch, count)
}

/// A fetch fn failing every call after `delay`.
pub fn failing_fetch(delay: Duration) -> (DynFetchFn, Arc<AtomicU32>) {
    let count = Arc::new(AtomicU32::new(0));
    let fetch: DynFetchFn = {
        let count = count.clone();
        Arc::new(move || {
            count.fetch_add(1, Ordering::SeqCst);
            Box::pin(async move {
                tokio::time::sleep(delay).await;
                Err(FountError::other("simulated transport failure"))
            })
        })
    };
    (fetch, count)
}

/// Collects every payload passed to the data callback.
pub fn capture_on_data() -> (DynOnData, Arc<Mutex<Vec<Bytes>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let on_data: DynOnData = {
        let seen = seen.clone();
        Arc::new(move |_key, data| {
            seen.lock().unwrap().push(data);
        })
    };
    (on_data, seen)
}

/// Collects every partial payload passed to the abort callback.
pub fn capture_on_abort() -> (DynOnAbort, Arc<Mutex<Vec<Option<Bytes>>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let on_abort: DynOnAbort = {
        let seen = seen.clone();
        Arc::new(move |_key, partial| {
            seen.lock().unwrap().push(partial);
        })
    };
    (on_abort, seen)
}

/// A refresh callback counting its invocations.
pub fn counting_on_refresh() -> (DynOnRefresh, Arc<AtomicU32>) {
    let count = Arc::new(AtomicU32::new(0));
    let on_refresh: DynOnRefresh = {
        let count = count.clone();
        Arc::new(move || {
            count.fetch_add(1, Ordering::SeqCst);
        })
    };
    (on_refresh, count)
}
