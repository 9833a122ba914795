#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use fleethub_core::prelude::*;
use fleethub_hub::{ClusterSetController, HubConfig, MembershipCache, MemoryRecorder, Runner, SyncContext};
use fleethub_store::{MemoryStore, WorkQueue};

fn runner(store: &Arc<MemoryStore>) -> Arc<Runner<MemoryStore, MemoryRecorder>> {
    let ctrl = Arc::new(ClusterSetController::new(Arc::clone(store), Arc::new(MemoryRecorder::new()), Arc::new(MembershipCache::new())));
    let cfg = HubConfig { resync_interval: None, sync_timeout: None, ..Default::default() };
    Arc::new(Runner::new(ctrl, Arc::new(WorkQueue::with_capacity(64)), cfg))
}

async fn empty_condition(store: &MemoryStore, set: &str) -> Option<Condition> {
    let s: ClusterSet = store.get(&ObjectKey::cluster(set)).await.unwrap()?;
    s.status.conditions.into_iter().find(|c| c.type_ == CLUSTER_SET_CONDITION_EMPTY)
}

#[tokio::test]
async fn member_relabel_enqueues_old_and_new_set() {
    let store = Arc::new(MemoryStore::new());
    for s in ["mcs1", "mcs2"] {
        store.put(ClusterSet::new(s)).unwrap();
    }
    store.put(Member::new("c1").with_label(CLUSTER_SET_LABEL, "mcs1")).unwrap();
    let r = runner(&store);

    r.on_set_event(&WatchEvent::Applied(ClusterSet::new("mcs1")));
    assert!(r.process_next().await);
    assert_eq!(empty_condition(&store, "mcs1").await.unwrap().message, "1 ManagedClusters selected");

    let moved = store
        .modify::<Member>(&ObjectKey::cluster("c1"), |m| {
            m.metadata.labels.insert(CLUSTER_SET_LABEL.into(), "mcs2".into());
        })
        .unwrap();
    r.on_member_event(&WatchEvent::Applied(moved));
    assert_eq!(r.queue().len(), 2);
    assert!(r.process_next().await);
    assert!(r.process_next().await);

    assert_eq!(empty_condition(&store, "mcs1").await.unwrap().reason, "NoClusterMatched");
    assert_eq!(empty_condition(&store, "mcs2").await.unwrap().message, "1 ManagedClusters selected");
}

#[tokio::test]
async fn member_delete_enqueues_cached_set() {
    let store = Arc::new(MemoryStore::new());
    store.put(ClusterSet::new("mcs1")).unwrap();
    let c1 = store.put(Member::new("c1").with_label(CLUSTER_SET_LABEL, "mcs1")).unwrap();
    let r = runner(&store);
    r.resync().await;
    assert!(r.process_next().await);

    store.remove(Kind::Member, &ObjectKey::cluster("c1"));
    let mut unlabelled = c1.clone();
    unlabelled.metadata.labels.clear();
    r.on_member_event(&WatchEvent::Deleted(unlabelled));
    assert_eq!(r.queue().len(), 1);
    assert!(r.process_next().await);
    assert_eq!(empty_condition(&store, "mcs1").await.unwrap().reason, "NoClusterMatched");
}

#[tokio::test(start_paused = true)]
async fn transient_failure_is_requeued_with_backoff() {
    let store = Arc::new(MemoryStore::new());
    store.put(ClusterSet::new("mcs1")).unwrap();
    let r = runner(&store);
    store.fail_next_read(Error::transient("apiserver unavailable"));
    r.queue().add(ObjectKey::cluster("mcs1"));
    assert!(r.process_next().await);
    assert!(empty_condition(&store, "mcs1").await.is_none());
    assert!(r.queue().is_empty());

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(r.queue().len(), 1);
    assert!(r.process_next().await);
    assert!(empty_condition(&store, "mcs1").await.is_some());
}

#[tokio::test]
async fn run_stops_when_queue_shuts_down() {
    let store = Arc::new(MemoryStore::new());
    store.put(ClusterSet::new("mcs1")).unwrap();
    store.put(ClusterSet::new("mcs2")).unwrap();
    let r = runner(&store);
    let handle = tokio::spawn(Arc::clone(&r).run());

    for _ in 0..100 {
        if empty_condition(&store, "mcs1").await.is_some() && empty_condition(&store, "mcs2").await.is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(empty_condition(&store, "mcs2").await.is_some());
    r.queue().shutdown();
    tokio::time::timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();

    // A later sync of the same state is a no-op.
    let ctrl = ClusterSetController::new(Arc::clone(&store), Arc::new(MemoryRecorder::new()), Arc::new(MembershipCache::new()));
    store.clear_actions();
    ctrl.sync(&SyncContext::new(), &ObjectKey::cluster("mcs1")).await.unwrap();
    assert!(store.writes().is_empty());
}
