//! Tests for the bounded-concurrency and shutdown-adjacent primitives:
//! the streaming semaphore built by `proxy::build_stream_semaphore` and the
//! ctrl-c/SIGTERM race shape used by `main`'s graceful shutdown.

use std::time::Duration;

use ucr_rust::proxy::build_stream_semaphore;

#[tokio::test]
async fn bounded_semaphore_blocks_once_exhausted() {
    let sem = build_stream_semaphore(2).unwrap();

    let _p1 = sem.clone().acquire_owned().await.unwrap();
    let _p2 = sem.clone().acquire_owned().await.unwrap();
    assert_eq!(sem.available_permits(), 0);

    let third = tokio::time::timeout(Duration::from_millis(50), sem.clone().acquire_owned()).await;
    assert!(third.is_err(), "a third acquire should block while two permits are held");
}

#[tokio::test]
async fn releasing_a_permit_unblocks_a_waiter() {
    let sem = build_stream_semaphore(1).unwrap();
    let permit = sem.clone().acquire_owned().await.unwrap();

    let waiter = {
        let sem = sem.clone();
        tokio::spawn(async move { sem.acquire_owned().await.unwrap() })
    };

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!waiter.is_finished());

    drop(permit);
    let acquired = tokio::time::timeout(Duration::from_millis(100), waiter)
        .await
        .expect("waiter should resolve once the permit is released");
    assert!(acquired.is_ok());
}

#[test]
fn zero_configures_unbounded_streaming() {
    assert!(build_stream_semaphore(0).is_none());
}

#[tokio::test]
async fn shutdown_select_resolves_on_first_ready_branch() {
    // Mirrors the shape of `main::shutdown_signal`'s `tokio::select!` over a
    // ctrl-c future and a platform-specific terminate future: whichever
    // resolves first wins and the other is dropped uncompleted.
    let fast = async {
        tokio::time::sleep(Duration::from_millis(5)).await;
        "fast"
    };
    let slow = async {
        tokio::time::sleep(Duration::from_secs(10)).await;
        "slow"
    };

    let winner = tokio::select! {
        v = fast => v,
        v = slow => v,
    };
    assert_eq!(winner, "fast");
}
