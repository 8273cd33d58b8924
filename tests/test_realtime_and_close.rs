//! Realtime access paths and shutdown behavior.

mod common;

use common::*;
use skillet::{GenerationFactory, SearcherKind, SkilletError};
use std::sync::Arc;

// ============================================================
// Realtime
// ============================================================

#[tokio::test]
async fn realtime_fast_path_reuses_latest_snapshot() {
    let factory = Arc::new(GenerationFactory::new());
    let core = build_core(factory.clone());

    let first = core.get_realtime_searcher().await.unwrap();
    assert_eq!(first.get().kind(), SearcherKind::Realtime);
    let opens = factory.total_opens();

    // no commit in between: the slot is served without touching the factory
    let second = core.get_realtime_searcher().await.unwrap();
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(factory.total_opens(), opens);

    second.decref();
    first.decref();
    core.close().await;
    assert_eq!(factory.open_readers(), 0);
}

#[tokio::test]
async fn realtime_slot_advances_with_ordinary_opens() {
    let factory = Arc::new(GenerationFactory::new());
    let core = build_core(factory.clone());

    let rt = core.get_realtime_searcher().await.unwrap();
    assert_eq!(rt.get().generation(), 0);
    rt.decref();

    factory.bump();
    core.reopen_searcher().await.unwrap();

    // the ordinary open refreshed the realtime slot too
    let rt = core.get_realtime_searcher().await.unwrap();
    assert_eq!(rt.get().generation(), 1);
    assert_eq!(rt.get().kind(), SearcherKind::Main);
    rt.decref();

    core.close().await;
    assert_eq!(factory.open_readers(), 0);
}

#[tokio::test]
async fn realtime_searcher_is_never_registered() {
    let factory = Arc::new(GenerationFactory::new());
    let core = build_core(factory.clone());

    let rt = core.get_realtime_searcher().await.unwrap();
    assert!(core.registered_generation().is_none());

    // ordinary callers are blind to the realtime-only snapshot
    let registered = core
        .get_searcher(false, true, false)
        .await
        .unwrap()
        .unwrap();
    assert!(!Arc::ptr_eq(&rt, &registered));
    assert_eq!(registered.get().kind(), SearcherKind::Main);

    registered.decref();
    rt.decref();
    core.close().await;
    assert_eq!(factory.open_readers(), 0);
}

#[tokio::test]
async fn realtime_slot_is_read_through_until_explicitly_reopened() {
    let factory = Arc::new(GenerationFactory::new());
    let core = build_core(factory.clone());

    let old = core.get_realtime_searcher().await.unwrap();
    factory.bump();

    // the slot serves the stale snapshot until the update path refreshes it
    let stale = core.get_realtime_searcher().await.unwrap();
    assert!(Arc::ptr_eq(&old, &stale));
    stale.decref();

    core.open_realtime_searcher().await.unwrap();
    let new = core.get_realtime_searcher().await.unwrap();
    assert_eq!(new.get().generation(), 1);
    assert!(!Arc::ptr_eq(&old, &new));

    old.decref();
    new.decref();
    core.close().await;
    assert_eq!(factory.open_readers(), 0);
}

// ============================================================
// Shutdown
// ============================================================

#[tokio::test]
async fn close_rejects_new_callers_and_releases_everything() {
    let factory = Arc::new(GenerationFactory::new());
    let core = build_core(factory.clone());

    core.get_searcher(false, false, false).await.unwrap();
    wait_until(|| core.registered_generation().is_some()).await;

    core.close().await;
    assert_eq!(factory.open_readers(), 0);
    assert_eq!(core.tracked_searchers(), 0);

    let err = core.get_searcher(false, true, false).await.unwrap_err();
    assert!(matches!(err, SkilletError::CoreClosed(_)));
    let err = core.get_realtime_searcher().await.unwrap_err();
    assert!(matches!(err, SkilletError::CoreClosed(_)));
}

#[tokio::test]
async fn close_is_idempotent() {
    let factory = Arc::new(GenerationFactory::new());
    let core = build_core(factory.clone());
    core.get_searcher(false, false, false).await.unwrap();

    core.close().await;
    core.close().await;
    assert_eq!(factory.open_readers(), 0);
}

#[tokio::test]
async fn in_flight_holders_survive_close() {
    let factory = Arc::new(GenerationFactory::new());
    let core = build_core(factory.clone());

    let held = core.get_searcher(false, true, false).await.unwrap().unwrap();
    wait_until(|| core.registered_generation().is_some()).await;

    core.close().await;
    // the query's snapshot stays open until the query lets go
    assert!(!held.is_closed());
    assert_eq!(factory.open_readers(), 1);

    held.decref();
    assert!(held.is_closed());
    assert_eq!(factory.open_readers(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn close_during_open_discards_the_half_built_searcher() {
    let gated = GatedFactory::new();
    let core = build_core(gated.clone());

    let opener = {
        let core = Arc::clone(&core);
        tokio::spawn(async move { core.get_searcher(true, true, true).await })
    };
    wait_until(|| gated.entered() == 1).await;

    let closer = {
        let core = Arc::clone(&core);
        tokio::spawn(async move { core.close().await })
    };
    // let the close land while the factory call is still parked
    wait_until(|| core.is_closed()).await;
    gated.release();

    let result = opener.await.unwrap();
    assert!(matches!(result, Err(SkilletError::CoreClosed(_))));
    closer.await.unwrap();

    // the discarded searcher released its reader and left no bookkeeping
    assert_eq!(gated.inner().open_readers(), 0);
    assert_eq!(core.on_deck(), 0);
    assert_eq!(core.tracked_searchers(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn waiters_unblock_with_an_error_on_close() {
    let gated = GatedFactory::new();
    let core = build_core(gated.clone());

    let opener = {
        let core = Arc::clone(&core);
        tokio::spawn(async move { core.get_searcher(true, false, true).await })
    };
    wait_until(|| gated.entered() == 1).await;

    // this caller is parked waiting for the in-flight registration
    let waiter = {
        let core = Arc::clone(&core);
        tokio::spawn(async move { core.get_searcher(false, true, false).await })
    };
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;

    let closer = {
        let core = Arc::clone(&core);
        tokio::spawn(async move { core.close().await })
    };
    wait_until(|| core.is_closed()).await;
    gated.release();

    assert!(matches!(
        waiter.await.unwrap(),
        Err(SkilletError::CoreClosed(_))
    ));
    assert!(matches!(
        opener.await.unwrap(),
        Err(SkilletError::CoreClosed(_))
    ));
    closer.await.unwrap();
    assert_eq!(gated.inner().open_readers(), 0);
}
