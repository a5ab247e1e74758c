//! Integration tests for the runtime facade.

use core_async::{sync, task, time};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

#[core_async::test]
async fn test_task_spawn() {
    let handle = task::spawn(async { 42 });
    assert_eq!(handle.await.unwrap(), 42);
}

#[core_async::test]
async fn test_panicking_task_surfaces_join_error() {
    let handle = task::spawn(async {
        panic!("worker blew up");
    });

    let err = handle.await.unwrap_err();
    assert!(err.is_panic());
}

#[core_async::test]
async fn test_timeout_failure() {
    let result = time::timeout(time::Duration::from_millis(10), async {
        time::sleep(time::Duration::from_millis(200)).await;
        42
    })
    .await;

    assert!(result.is_err());
}

#[core_async::test]
async fn test_timeout_success() {
    let result = time::timeout(time::Duration::from_millis(200), async { 7 }).await;
    assert_eq!(result.unwrap(), 7);
}

#[core_async::test]
async fn test_semaphore_bounds_permits() {
    let semaphore = Arc::new(sync::Semaphore::new(2));

    let first = semaphore.clone().try_acquire_owned().unwrap();
    let _second = semaphore.clone().try_acquire_owned().unwrap();
    assert!(semaphore.clone().try_acquire_owned().is_err());

    drop(first);
    assert!(semaphore.clone().try_acquire_owned().is_ok());
}

#[core_async::test]
async fn test_notify_wakes_waiter() {
    let notify = Arc::new(sync::Notify::new());
    let hits = Arc::new(AtomicUsize::new(0));

    let waiter = {
        let notify = notify.clone();
        let hits = hits.clone();
        task::spawn(async move {
            notify.notified().await;
            hits.fetch_add(1, Ordering::SeqCst);
        })
    };

    task::yield_now().await;
    notify.notify_one();
    waiter.await.unwrap();

    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[core_async::test]
async fn test_cancellation_interrupts_sleep() {
    let token = sync::CancellationToken::new();
    let child = token.child_token();

    let sleeper = task::spawn(async move {
        core_async::select! {
            _ = child.cancelled() => true,
            _ = time::sleep(time::Duration::from_secs(30)) => false,
        }
    });

    token.cancel();
    assert!(sleeper.await.unwrap());
}

#[core_async::test]
async fn test_rwlock_allows_concurrent_readers() {
    let lock = sync::RwLock::new(vec![1, 2, 3]);
    let a = lock.read().await;
    let b = lock.read().await;
    assert_eq!(a.len() + b.len(), 6);
}
