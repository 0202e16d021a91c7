//! Integration tests for polling and cross-context broadcast

mod common;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use common::{subscription, user, MockDocumentStore, MockPaymentFunctions};
use fitsync_client::MemoryLocalStore;
use fitsync_reconcile::{
    BroadcastChannel, CacheConfig, GetOptions, NoopPort, PollOptions, SubscriptionCache,
    SubscriptionSync,
};
use fitsync_types::SubscriptionStatus;
use tokio::sync::mpsc::unbounded_channel;
use tokio::time::{sleep, timeout, Instant};

fn setup() -> (MockDocumentStore, SubscriptionCache, SubscriptionSync) {
    let store = MockDocumentStore::new();
    let cache = SubscriptionCache::new(
        Arc::new(store.clone()),
        Arc::new(MockPaymentFunctions::new()),
        Arc::new(MemoryLocalStore::new()),
        Arc::new(NoopPort),
        CacheConfig::default(),
    );
    let sync = SubscriptionSync::new(
        Arc::new(store.clone()),
        cache.clone(),
        BroadcastChannel::default(),
    );
    (store, cache, sync)
}

#[tokio::test(start_paused = true)]
async fn test_poll_returns_when_status_reached() {
    let (store, cache, sync) = setup();
    let user = user();
    store.put_subscription(&user, subscription("sub_1", SubscriptionStatus::Incomplete, Utc::now()));

    let webhook = store.clone();
    let target = user.clone();
    tokio::spawn(async move {
        sleep(Duration::from_secs(3)).await;
        webhook.update(&target, |s| s.status = SubscriptionStatus::Active);
    });

    let found = sync
        .poll_status(&user, SubscriptionStatus::Active, &PollOptions::default())
        .await
        .unwrap();

    assert_eq!(found.status, SubscriptionStatus::Active);
    // fetches at 0s, 1s, 2.5s and 4.75s
    assert_eq!(store.get_calls(), 4);
    assert_eq!(
        cache.get(&user, GetOptions::default()).await.unwrap().status,
        SubscriptionStatus::Active
    );
}

#[tokio::test(start_paused = true)]
async fn test_poll_gives_up_after_max_attempts() {
    let (store, _, sync) = setup();
    let user = user();
    store.put_subscription(&user, subscription("sub_1", SubscriptionStatus::Incomplete, Utc::now()));

    let options = PollOptions::default()
        .with_max_attempts(3)
        .with_initial_delay(Duration::from_millis(100));
    let started = Instant::now();
    let found = sync
        .poll_status(&user, SubscriptionStatus::Active, &options)
        .await;

    assert!(found.is_none());
    assert_eq!(store.get_calls(), 3);
    // 100ms + 150ms between the three fetches, no wait after the last
    assert!(started.elapsed() >= Duration::from_millis(250));
    assert!(started.elapsed() < Duration::from_millis(300));
}

#[tokio::test(start_paused = true)]
async fn test_poll_is_bounded_by_timeout() {
    let (store, _, sync) = setup();
    let user = user();
    store.put_subscription(&user, subscription("sub_1", SubscriptionStatus::Incomplete, Utc::now()));

    let options = PollOptions::default().with_timeout(Duration::from_secs(2));
    let started = Instant::now();
    let found = sync
        .poll_status(&user, SubscriptionStatus::Active, &options)
        .await;

    assert!(found.is_none());
    assert!(started.elapsed() >= Duration::from_secs(2));
    assert!(started.elapsed() < Duration::from_millis(2100));
}

#[tokio::test]
async fn test_refresh_now_does_not_retry() {
    let (store, _, sync) = setup();
    store.fail_reads(true);

    assert!(sync.refresh_now(&user()).await.is_none());
    assert_eq!(store.get_calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_wait_for_activation_returns_entitled_record_at_once() {
    let (store, _, sync) = setup();
    let user = user();
    store.put_subscription(&user, subscription("sub_1", SubscriptionStatus::Trialing, Utc::now()));

    let found = sync
        .wait_for_activation(&user, &PollOptions::default())
        .await
        .unwrap();

    assert_eq!(found.status, SubscriptionStatus::Trialing);
    assert_eq!(store.get_calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_wait_for_activation_broadcasts_result() {
    let (store, _, sync) = setup();
    let user = user();
    store.put_subscription(&user, subscription("sub_1", SubscriptionStatus::Incomplete, Utc::now()));

    let (tx, mut rx) = unbounded_channel();
    let _listener = sync.listen(move |subscription| {
        let _ = tx.send(subscription);
    });

    let webhook = store.clone();
    let target = user.clone();
    tokio::spawn(async move {
        sleep(Duration::from_secs(2)).await;
        webhook.update(&target, |s| s.status = SubscriptionStatus::Active);
    });

    let found = sync
        .wait_for_activation(&user, &PollOptions::default())
        .await
        .unwrap();
    assert_eq!(found.status, SubscriptionStatus::Active);

    let announced = timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
    assert_eq!(announced, found);
}

#[tokio::test(start_paused = true)]
async fn test_wait_for_activation_gives_up() {
    let (store, _, sync) = setup();
    let user = user();
    store.put_subscription(&user, subscription("sub_1", SubscriptionStatus::Incomplete, Utc::now()));

    let options = PollOptions::default().with_max_attempts(2);
    assert!(sync.wait_for_activation(&user, &options).await.is_none());
    // initial refresh, two polls, final refresh
    assert_eq!(store.get_calls(), 4);
}

#[tokio::test]
async fn test_broadcast_reaches_every_session() {
    let channel = BroadcastChannel::default();
    let (store, cache, _) = setup();
    let first = SubscriptionSync::new(Arc::new(store.clone()), cache.clone(), channel.clone());
    let second = SubscriptionSync::new(Arc::new(store), cache, channel.clone());

    let (tx, mut rx) = unbounded_channel();
    let own = tx.clone();
    let _first_listener = first.listen(move |s| {
        let _ = own.send(("first", s));
    });
    let _second_listener = second.listen(move |s| {
        let _ = tx.send(("second", s));
    });

    channel.publish_frame("{malformed");
    let record = subscription("sub_1", SubscriptionStatus::Active, Utc::now());
    first.broadcast(&record);

    let mut seen = Vec::new();
    for _ in 0..2 {
        let (session, subscription) = timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(subscription, record);
        seen.push(session);
    }
    seen.sort_unstable();
    assert_eq!(seen, ["first", "second"]);
}
