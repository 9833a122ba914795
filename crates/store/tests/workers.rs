#![forbid(unsafe_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use fleethub_core::ObjectKey;
use fleethub_store::WorkQueue;
use rustc_hash::{FxHashMap, FxHashSet};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn workers_never_share_a_key_and_dirty_keys_rerun() {
    let queue = Arc::new(WorkQueue::with_capacity(128));
    let in_flight = Arc::new(Mutex::new(FxHashSet::<ObjectKey>::default()));
    let seen = Arc::new(Mutex::new(FxHashMap::<ObjectKey, u32>::default()));

    let workers: Vec<_> = (0..4)
        .map(|_| {
            let (queue, in_flight, seen) = (Arc::clone(&queue), Arc::clone(&in_flight), Arc::clone(&seen));
            tokio::spawn(async move {
                while let Some(key) = queue.next().await {
                    assert!(in_flight.lock().unwrap().insert(key.clone()), "{} handed out twice", key);
                    let first = {
                        let mut seen = seen.lock().unwrap();
                        let n = seen.entry(key.clone()).or_insert(0);
                        *n += 1;
                        *n == 1
                    };
                    // The hot key changes while it is being worked on.
                    if first && key.name == "hot" {
                        queue.add(key.clone());
                    }
                    tokio::time::sleep(Duration::from_millis(1)).await;
                    in_flight.lock().unwrap().remove(&key);
                    queue.done(&key);
                }
            })
        })
        .collect();

    queue.add(ObjectKey::cluster("hot"));
    for i in 0..40 {
        queue.add(ObjectKey::cluster(format!("mcs{}", i)));
    }

    for _ in 0..500 {
        if seen.lock().unwrap().values().sum::<u32>() == 42 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    queue.shutdown();
    for w in workers {
        w.await.unwrap();
    }

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 41);
    assert_eq!(seen[&ObjectKey::cluster("hot")], 2);
    assert!(seen.iter().filter(|(k, _)| k.name != "hot").all(|(_, n)| *n == 1));
    assert_eq!(queue.dropped(), 0);
}

#[tokio::test]
async fn next_returns_none_after_shutdown_drains() {
    let queue = WorkQueue::with_capacity(4);
    queue.add(ObjectKey::cluster("mcs1"));
    queue.shutdown();
    queue.add(ObjectKey::cluster("mcs2"));
    assert_eq!(queue.next().await, Some(ObjectKey::cluster("mcs1")));
    assert_eq!(queue.next().await, None);
}
