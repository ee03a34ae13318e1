use super::*;
use crate::test_utils::*;
use bytes::Bytes;
use std::sync::atomic::Ordering;

type Log = Arc<Mutex<Vec<&'static str>>>;

fn logging_fetch(log: &Log, name: &'static str) -> DynFetchFn {
    let log = log.clone();
    Arc::new(move || {
        log.lock().unwrap().push(name);
        Box::pin(async { Ok(Bytes::new()) })
    })
}

fn spec(key: &str, fetch: DynFetchFn, on_data: DynOnData) -> ProviderSpec {
    ProviderSpec::new(key).with_fetch(fetch, on_data)
}

#[tokio::test(start_paused = true)]
async fn consumers_of_one_key_share_one_resource() {
    enable_tracing();
    let reg = Registry::default();
    let (fetch, count) = counting_fetch(Duration::ZERO);
    let (on_data, seen) = capture_on_data();
    let s = spec("articles", fetch, on_data);

    reg.add_consumer("c1".into(), s.clone()).unwrap();
    reg.add_consumer("c2".into(), s).unwrap();
    assert_eq!(1, reg.resource_count());

    tokio::time::sleep(Duration::from_millis(10)).await;

    // Two registrations, one fetch, one data delivery.
    assert_eq!(1, count.load(Ordering::SeqCst));
    assert_eq!(1, seen.lock().unwrap().len());

    reg.remove_consumer(&"c1".into(), &"articles".into()).unwrap();
    assert_eq!(1, reg.resource_count());
    reg.remove_consumer(&"c2".into(), &"articles".into()).unwrap();
    assert_eq!(0, reg.resource_count());
}

#[tokio::test(start_paused = true)]
async fn never_seen_key_requires_fetch_and_data_callbacks() {
    let reg = Registry::default();
    let res = reg.add_consumer("c1".into(), ProviderSpec::new("articles"));
    assert!(matches!(res, Err(FountError::MissingFetchSpec { .. })));
    assert_eq!(0, reg.resource_count());
}

#[tokio::test(start_paused = true)]
async fn conflicting_callback_identity_is_rejected() {
    let reg = Registry::default();
    let (fetch_a, _) = counting_fetch(Duration::ZERO);
    let (fetch_b, _) = counting_fetch(Duration::ZERO);
    let (on_data, _) = capture_on_data();

    reg.add_consumer(
        "c1".into(),
        spec("articles", fetch_a, on_data.clone()),
    )
    .unwrap();

    let res =
        reg.add_consumer("c2".into(), spec("articles", fetch_b, on_data));
    assert!(matches!(
        res,
        Err(FountError::ConflictingProviderSpec {
            what: "fetch_fn",
            ..
        }),
    ));
}

#[tokio::test(start_paused = true)]
async fn refetch_of_unknown_key_fails() {
    let reg = Registry::default();
    let res = reg.refetch(&"nope".into()).await;
    assert!(matches!(res, Err(FountError::UnknownResource { .. })));
}

#[tokio::test(start_paused = true)]
async fn keep_alive_retains_and_revives_without_refetching() {
    enable_tracing();
    let reg = Registry::default();
    let (fetch, count) = counting_fetch(Duration::ZERO);
    let (on_data, _seen) = capture_on_data();
    let s = spec("articles", fetch, on_data)
        .with_keep_alive(Duration::from_millis(500));

    reg.add_consumer("c1".into(), s.clone()).unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(1, count.load(Ordering::SeqCst));

    // Detaching the only consumer keeps the loaded entry around for
    // the grace period.
    reg.remove_consumer(&"c1".into(), &"articles".into()).unwrap();
    assert_eq!(1, reg.resource_count());

    // A revival within the grace period reuses the data with no fetch.
    reg.add_consumer("c1".into(), s.clone()).unwrap();
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(1, count.load(Ordering::SeqCst));
    assert_eq!(1, reg.resource_count());

    // Letting the grace period elapse evicts the entry, so the next
    // registration starts from scratch.
    reg.remove_consumer(&"c1".into(), &"articles".into()).unwrap();
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(0, reg.resource_count());

    reg.add_consumer("c1".into(), s).unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(2, count.load(Ordering::SeqCst));
}

#[tokio::test(start_paused = true)]
async fn keep_alive_revival_of_a_poller_does_not_refetch() {
    enable_tracing();
    let reg = Registry::default();
    let (fetch, count) = counting_fetch(Duration::ZERO);
    let (on_data, _seen) = capture_on_data();
    let s = spec("articles", fetch, on_data)
        .with_polling(Duration::from_millis(200))
        .with_keep_alive(Duration::from_millis(500));

    reg.add_consumer("c1".into(), s.clone()).unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(1, count.load(Ordering::SeqCst));

    // Reviving a polling consumer within the grace period must not
    // read the disabled config's interval as a decrease and refetch.
    reg.remove_consumer(&"c1".into(), &"articles".into()).unwrap();
    reg.add_consumer("c1".into(), s).unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert_eq!(1, count.load(Ordering::SeqCst));
    assert_eq!(1, reg.resource_count());
}

#[tokio::test(start_paused = true)]
async fn polling_continues_through_the_grace_period() {
    enable_tracing();
    let reg = Registry::default();
    let (fetch, count) = counting_fetch(Duration::ZERO);
    let (on_data, _seen) = capture_on_data();
    let s = spec("ticker", fetch, on_data)
        .with_polling(Duration::from_millis(100))
        .with_keep_alive(Duration::from_millis(1000));

    reg.add_consumer("c1".into(), s).unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(1, count.load(Ordering::SeqCst));

    // The detached consumer's polling cadence is kept up while the
    // grace timer runs.
    reg.remove_consumer(&"c1".into(), &"ticker".into()).unwrap();
    tokio::time::sleep(Duration::from_millis(450)).await;
    assert!(count.load(Ordering::SeqCst) >= 4, "{count:?}");
    assert_eq!(1, reg.resource_count());

    // Expiry ends the resource and its polling with it.
    tokio::time::sleep(Duration::from_millis(1000)).await;
    assert_eq!(0, reg.resource_count());
    let calls = count.load(Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(calls, count.load(Ordering::SeqCst));
}

#[tokio::test(start_paused = true)]
async fn polling_delivers_fresh_data() {
    enable_tracing();
    let reg = Registry::default();
    let (fetch, _count) = counting_fetch(Duration::ZERO);
    let (on_data, seen) = capture_on_data();
    let s = spec("ticker", fetch, on_data)
        .with_polling(Duration::from_millis(100));

    reg.add_consumer("c1".into(), s).unwrap();
    tokio::time::sleep(Duration::from_millis(350)).await;

    let seen = seen.lock().unwrap().clone();
    assert!(seen.len() >= 3, "{seen:?}");
    assert_eq!(
        vec![Bytes::from("0"), Bytes::from("1"), Bytes::from("2")],
        seen[..3].to_vec(),
    );

    assert_eq!(
        Some(Duration::from_millis(100)),
        reg.effective_polling(&"ticker".into()).unwrap(),
    );
    assert!(reg.effective_needed(&"ticker".into()).unwrap());
    assert!(!reg.is_canceled(&"ticker".into()).unwrap());
}

#[tokio::test(start_paused = true)]
async fn needed_fetch_is_invoked_before_not_needed() {
    enable_tracing();
    let reg = Registry::default();
    let log: Log = Arc::new(Mutex::new(Vec::new()));
    let (on_data_a, _) = capture_on_data();
    let (on_data_b, _) = capture_on_data();

    // The optional resource is registered first, the required one
    // second, in the same synchronous batch.
    reg.add_consumer(
        "c1".into(),
        spec("optional", logging_fetch(&log, "optional"), on_data_a)
            .with_needed(false),
    )
    .unwrap();
    reg.add_consumer(
        "c1".into(),
        spec("required", logging_fetch(&log, "required"), on_data_b),
    )
    .unwrap();

    tokio::time::sleep(Duration::from_millis(10)).await;

    assert_eq!(
        vec!["required", "optional"],
        log.lock().unwrap().clone(),
    );
}

#[tokio::test(start_paused = true)]
async fn subscribe_reconciles_the_consumer_resource_set() {
    enable_tracing();
    let reg = Registry::default();
    let (fetch_a, count_a) = counting_fetch(Duration::ZERO);
    let (fetch_b, count_b) = counting_fetch(Duration::ZERO);
    let (on_data, _seen) = capture_on_data();
    let spec_a = spec("a", fetch_a, on_data.clone());
    let spec_b = spec("b", fetch_b, on_data);

    reg.subscribe("c1".into(), vec![spec_a.clone(), spec_b.clone()])
        .unwrap();
    assert_eq!(2, reg.resource_count());
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(1, count_a.load(Ordering::SeqCst));
    assert_eq!(1, count_b.load(Ordering::SeqCst));

    // Resubscribing with the same specs changes nothing.
    reg.subscribe("c1".into(), vec![spec_a, spec_b.clone()]).unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(2, reg.resource_count());
    assert_eq!(1, count_a.load(Ordering::SeqCst));
    assert_eq!(1, count_b.load(Ordering::SeqCst));

    // Dropping a key from the set removes that resource.
    reg.subscribe("c1".into(), vec![spec_b]).unwrap();
    assert_eq!(1, reg.resource_count());

    reg.unsubscribe(&"c1".into()).unwrap();
    assert_eq!(0, reg.resource_count());
}

#[tokio::test(start_paused = true)]
async fn removal_of_an_already_evicted_key_counts_as_removed() {
    enable_tracing();
    let reg = Registry::default();
    let (fetch, _count) = counting_fetch(Duration::ZERO);
    let (on_data, _seen) = capture_on_data();
    let s = spec("profile", fetch, on_data)
        .with_keep_alive(Duration::from_millis(100));

    reg.add_consumer("c1".into(), s).unwrap();
    reg.remove_consumer(&"c1".into(), &"profile".into()).unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(0, reg.resource_count());

    // An expiry racing an unsubscribe can evict the entry between the
    // key snapshot and the removal; that must count as removed, not
    // surface as an unknown resource.
    reg.remove_known(&"c1".into(), &"profile".into()).unwrap();
    reg.unsubscribe(&"c1".into()).unwrap();
}

#[tokio::test(start_paused = true)]
async fn is_ready_tracks_needed_resources_only() {
    enable_tracing();
    let reg = Registry::default();
    let (slow_fetch, _) = counting_fetch(Duration::from_millis(100));
    let (optional_fetch, _) = counting_fetch(Duration::from_millis(100));
    let (on_data, _seen) = capture_on_data();

    reg.add_consumer(
        "c1".into(),
        spec("slow", slow_fetch, on_data.clone()),
    )
    .unwrap();
    reg.add_consumer(
        "c1".into(),
        spec("background", optional_fetch, on_data).with_needed(false),
    )
    .unwrap();

    // The needed resource is still loading.
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(
        ReadyState {
            loaded: false,
            error: false,
        },
        reg.is_ready(&"c1".into()),
    );

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(ReadyState::default(), reg.is_ready(&"c1".into()));
}

#[tokio::test(start_paused = true)]
async fn failed_initial_load_is_reported_as_error() {
    enable_tracing();
    let reg = Registry::default();
    reg.set_config(FetchConfig {
        fetch_timeout: Duration::from_millis(50),
        max_timeout_retries: 0,
    });
    let (fetch, _count) = failing_fetch(Duration::ZERO);
    let (on_data, _seen) = capture_on_data();
    let (on_abort, aborts) = capture_on_abort();

    reg.add_consumer(
        "c1".into(),
        spec("broken", fetch, on_data).with_on_abort(on_abort),
    )
    .unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(1, aborts.lock().unwrap().len());
    let ready = reg.is_ready(&"c1".into());
    assert!(!ready.loaded);
    assert!(ready.error);
    assert_eq!(
        ReadyState {
            loaded: false,
            error: true,
        },
        reg.status(&"broken".into()).unwrap(),
    );
}

#[tokio::test(start_paused = true)]
async fn initial_data_renders_before_the_first_fetch() {
    enable_tracing();
    let reg = Registry::default();
    let (fetch, _count) = counting_fetch(Duration::from_millis(100));
    let (on_data, seen) = capture_on_data();

    reg.add_consumer(
        "c1".into(),
        spec("seeded", fetch, on_data)
            .with_initial_data(Bytes::from("init")),
    )
    .unwrap();

    // Seeded data is delivered synchronously and counts as loaded.
    assert_eq!(
        vec![Bytes::from("init")],
        seen.lock().unwrap().clone(),
    );
    assert!(reg.status(&"seeded".into()).unwrap().loaded);

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(
        vec![Bytes::from("init"), Bytes::from("0")],
        seen.lock().unwrap().clone(),
    );
}

#[tokio::test(start_paused = true)]
async fn default_response_handler_is_late_bound() {
    enable_tracing();
    let reg = Registry::default();
    let (fetch, _count) = counting_fetch(Duration::ZERO);
    let (on_data, seen) = capture_on_data();
    let (on_abort, aborts) = capture_on_abort();

    reg.add_consumer(
        "c1".into(),
        spec("articles", fetch, on_data).with_on_abort(on_abort),
    )
    .unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(1, seen.lock().unwrap().len());

    // Installed after the resource was created, yet applied to its
    // next fetch cycle.
    reg.set_default_response_handler(Some(Arc::new(|_| {
        Response::Abort(None)
    })));
    reg.refetch(&"articles".into()).await.unwrap();

    assert_eq!(1, aborts.lock().unwrap().len());
    assert!(reg.status(&"articles".into()).unwrap().error);
}

#[tokio::test(start_paused = true)]
async fn consumers_are_notified_through_on_refresh() {
    enable_tracing();
    let reg = Registry::default();
    let (fetch, _count) = counting_fetch(Duration::ZERO);
    let (on_data, _seen) = capture_on_data();
    let (on_refresh, refreshes) = counting_on_refresh();

    reg.add_consumer(
        "c1".into(),
        spec("articles", fetch, on_data).with_on_refresh(on_refresh),
    )
    .unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert_eq!(1, refreshes.load(Ordering::SeqCst));

    reg.refetch(&"articles".into()).await.unwrap();
    assert_eq!(2, refreshes.load(Ordering::SeqCst));
}
