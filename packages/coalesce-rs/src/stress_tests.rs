//! Stress tests designed to break the single-flight gate.
//!
//! These tests hammer start/cancel/complete from many tasks on a
//! multi-threaded runtime and check the invariants still hold.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::action::Action;
use crate::coalescing::CoalescingAction;
use crate::core::ActionEvent;
use crate::error::ActionError;
use crate::subscription::Subscription;
use crate::testing::manual_action;

type Handle = Subscription<String, String>;

async fn settle<T>(fut: impl std::future::Future<Output = T>) -> T {
    tokio::time::timeout(Duration::from_secs(10), fut)
        .await
        .expect("stress test stalled")
}

/// Drain a handle, returning how many terminal events it produced.
async fn count_terminals(mut handle: Handle) -> usize {
    let mut terminals = 0;
    while let Some(event) = handle.recv().await {
        if event.is_terminal() {
            terminals += 1;
        }
    }
    terminals
}

// ==========================================================================
// Concurrent starts
// ==========================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_starts_create_single_work() {
    let (action, work) = manual_action::<usize, String, String>();
    let refresh = CoalescingAction::new(action);

    let mut joins = Vec::new();
    for i in 0..64 {
        let refresh = refresh.clone();
        joins.push(tokio::spawn(async move { refresh.start(i) }));
    }

    let mut handles = Vec::new();
    for join in joins {
        handles.push(join.await.unwrap());
    }

    assert_eq!(work.starts(), 1, "concurrent starts must share one work");
    assert_eq!(refresh.subscriber_count(), 64);

    let execution = handles[0].execution_id();
    assert!(handles.iter().all(|h| h.execution_id() == execution));

    work.emit(0, "shared".to_string());
    work.complete(0);

    let mut results = Vec::new();
    for handle in handles {
        results.push(tokio::spawn(handle.result()));
    }
    for result in results {
        assert_eq!(
            settle(result).await.unwrap(),
            Ok(Some("shared".to_string()))
        );
    }
    assert!(!refresh.is_executing().get());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_readers_at_any_pace_see_identical_sequences() {
    let (action, work) = manual_action::<usize, String, String>();
    let refresh = CoalescingAction::new(action);

    let mut readers = Vec::new();
    for i in 0..16 {
        let handle = refresh.start(i);
        readers.push(tokio::spawn(async move {
            // Some readers stall before they start draining
            if fastrand::bool() {
                tokio::time::sleep(Duration::from_millis(fastrand::u64(1..20))).await;
            }
            handle.collect_values().await
        }));
    }

    let expected: Vec<String> = (0..500).map(|n| format!("item-{}", n)).collect();
    for value in &expected {
        work.emit(0, value.clone());
        if fastrand::u8(0..16) == 0 {
            tokio::task::yield_now().await;
        }
    }
    work.complete(0);

    for reader in readers {
        assert_eq!(settle(reader).await.unwrap(), Ok(expected.clone()));
    }
    assert_eq!(work.starts(), 1);
}

// ==========================================================================
// Random strict-subset cancellation
// ==========================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_random_subset_cancel_never_cancels_work() {
    let (action, work) = manual_action::<usize, String, String>();
    let refresh = CoalescingAction::new(action);

    for run in 0..50 {
        let total = fastrand::usize(2..16);
        let mut handles: Vec<Handle> = (0..total).map(|i| refresh.start(i)).collect();
        assert_eq!(work.starts(), run + 1);

        // Cancel a strict subset from concurrent tasks
        fastrand::shuffle(&mut handles);
        let cancel_count = fastrand::usize(1..total);
        let survivors = handles.split_off(cancel_count);

        let mut cancels = Vec::new();
        for mut handle in handles {
            cancels.push(tokio::spawn(async move {
                handle.cancel();
                handle.recv().await
            }));
        }
        for cancel in cancels {
            assert_eq!(
                cancel.await.unwrap(),
                Some(ActionEvent::Failed(ActionError::Cancelled))
            );
        }

        assert!(refresh.is_executing().get());
        assert!(!work.is_cancelled(run), "run {} was cancelled early", run);
        assert_eq!(refresh.subscriber_count(), survivors.len());

        let value = format!("run-{}", run);
        work.emit(run, value.clone());
        work.complete(run);

        for handle in survivors {
            assert_eq!(settle(handle.result()).await, Ok(Some(value.clone())));
        }
        assert!(!refresh.is_executing().get());
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_drop_of_every_handle_cancels_once() {
    let (action, work) = manual_action::<usize, String, String>();
    let refresh = CoalescingAction::new(action);

    for run in 0..20 {
        let handles: Vec<Handle> = (0..fastrand::usize(1..32))
            .map(|i| refresh.start(i))
            .collect();

        let drops: Vec<_> = handles
            .into_iter()
            .map(|handle| tokio::spawn(async move { drop(handle) }))
            .collect();
        for d in drops {
            d.await.unwrap();
        }

        assert!(!refresh.is_executing().get());
        assert_eq!(refresh.subscriber_count(), 0);
        settle(work.dropped(run)).await;
        assert!(work.is_cancelled(run));
    }

    // Every full cancellation freed the gate for a fresh run
    assert_eq!(work.starts(), 20);
}

// ==========================================================================
// Churn
// ==========================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_start_cancel_churn_delivers_one_terminal_per_handle() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let action = Action::from_async(move |n: usize| {
        counter.fetch_add(1, Ordering::SeqCst);
        async move {
            tokio::time::sleep(Duration::from_millis(fastrand::u64(0..3))).await;
            if n % 7 == 0 {
                Err(format!("input {} rejected", n))
            } else {
                Ok(format!("input {}", n))
            }
        }
    });
    let refresh = CoalescingAction::new(action);

    let mut workers = Vec::new();
    for worker in 0..16 {
        let refresh = refresh.clone();
        workers.push(tokio::spawn(async move {
            let mut terminals = Vec::new();
            for i in 0..40 {
                let mut handle = refresh.start(worker * 100 + i);
                match fastrand::u8(0..3) {
                    0 => handle.cancel(),
                    1 => tokio::task::yield_now().await,
                    _ => {}
                }
                terminals.push(count_terminals(handle).await);
            }
            terminals
        }));
    }

    for worker in workers {
        let terminals = settle(worker).await.unwrap();
        assert!(terminals.iter().all(|&t| t == 1));
    }

    assert!(!refresh.is_executing().get());
    assert_eq!(refresh.subscriber_count(), 0);
    assert!(!refresh.action().is_executing().get());
    assert!(calls.load(Ordering::SeqCst) >= 1);
    assert!(calls.load(Ordering::SeqCst) <= 16 * 40);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_toggle_enabled_while_starting() {
    let (action, work) = manual_action::<usize, String, String>();
    let refresh = CoalescingAction::new(action);

    let toggler = {
        let refresh = refresh.clone();
        tokio::spawn(async move {
            for i in 0..200 {
                refresh.set_enabled(i % 2 == 0);
                tokio::task::yield_now().await;
            }
            refresh.set_enabled(true);
        })
    };

    let mut handles = Vec::new();
    for i in 0..200 {
        handles.push(refresh.start(i));
        tokio::task::yield_now().await;
    }
    toggler.await.unwrap();

    // Rejections never reach the work factory, so at most one run exists
    assert!(work.starts() <= 1);

    if work.starts() == 1 {
        work.complete(0);
    }
    for handle in handles {
        let attached = handle.execution_id().is_some();
        match settle(handle.result()).await {
            Ok(None) => assert!(attached),
            // Disabled between admission and the underlying start
            Err(ActionError::Disabled) => {}
            other => panic!("unexpected result: {:?}", other),
        }
    }
    assert!(!refresh.is_executing().get());
}
