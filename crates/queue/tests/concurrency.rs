#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use shoal_queue::WorkQueue;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn no_item_held_by_two_consumers() {
    let q = Arc::new(WorkQueue::named("exclusive"));
    let holders: Arc<Mutex<HashMap<u32, usize>>> = Arc::new(Mutex::new(HashMap::new()));
    let violations = Arc::new(AtomicUsize::new(0));
    let processed = Arc::new(AtomicUsize::new(0));

    let mut consumers = Vec::new();
    for _ in 0..4 {
        let q = Arc::clone(&q);
        let holders = Arc::clone(&holders);
        let violations = Arc::clone(&violations);
        let processed = Arc::clone(&processed);
        consumers.push(tokio::spawn(async move {
            while let Some(item) = q.get().await {
                {
                    let mut h = holders.lock().unwrap();
                    let n = h.entry(item).or_insert(0);
                    *n += 1;
                    if *n > 1 {
                        violations.fetch_add(1, Ordering::SeqCst);
                    }
                }
                tokio::time::sleep(Duration::from_micros(200)).await;
                holders.lock().unwrap().entry(item).and_modify(|n| *n -= 1);
                processed.fetch_add(1, Ordering::SeqCst);
                q.done(&item);
            }
        }));
    }

    // a small key space forces re-adds of in-flight items
    for round in 0..200u32 {
        q.add(round % 5);
        if round % 20 == 0 {
            tokio::task::yield_now().await;
        }
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
    q.shut_down();
    for c in consumers {
        tokio::time::timeout(Duration::from_secs(5), c).await.unwrap().unwrap();
    }
    assert_eq!(violations.load(Ordering::SeqCst), 0, "an item was processed concurrently");
    assert!(processed.load(Ordering::SeqCst) >= 5);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn shutdown_drains_every_item_exactly_once() {
    let q = Arc::new(WorkQueue::named("drain"));
    for i in 0..100u32 {
        q.add(i);
    }
    q.shut_down();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let mut consumers = Vec::new();
    for _ in 0..3 {
        let q = Arc::clone(&q);
        let seen = Arc::clone(&seen);
        consumers.push(tokio::spawn(async move {
            while let Some(item) = q.get().await {
                seen.lock().unwrap().push(item);
                q.done(&item);
            }
            // the terminal signal is sticky
            assert_eq!(q.get().await, None);
        }));
    }
    for c in consumers {
        tokio::time::timeout(Duration::from_secs(5), c).await.unwrap().unwrap();
    }
    let mut seen = seen.lock().unwrap().clone();
    seen.sort_unstable();
    assert_eq!(seen, (0..100).collect::<Vec<_>>());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn blocked_consumer_released_by_shutdown() {
    let q: Arc<WorkQueue<String>> = Arc::new(WorkQueue::new());
    let waiter = {
        let q = Arc::clone(&q);
        tokio::spawn(async move { q.get().await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!waiter.is_finished());
    q.shut_down();
    let got = tokio::time::timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
    assert_eq!(got, None);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn blocked_consumer_wakes_on_add() {
    let q = Arc::new(WorkQueue::new());
    let waiter = {
        let q = Arc::clone(&q);
        tokio::spawn(async move { q.get().await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    q.add("this");
    let got = tokio::time::timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
    assert_eq!(got, Some("this"));
}

#[tokio::test]
async fn readd_during_processing_yields_single_redelivery() {
    let q = WorkQueue::new();
    q.add("k");
    let k = q.get().await.unwrap();
    for _ in 0..10 {
        q.add("k");
    }
    q.done(&k);
    assert_eq!(q.get().await, Some("k"));
    q.done(&"k");
    q.shut_down();
    assert_eq!(q.get().await, None, "exactly one redelivery expected");
}
