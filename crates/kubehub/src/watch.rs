//! List+watch wiring for managed clusters and cluster sets.

use anyhow::Result;
use fleethub_core::{Object, WatchEvent};
use futures::StreamExt;
use kube::{
    api::Api,
    core::DynamicObject,
    runtime::{
        watcher::{self, Event},
        WatchStreamExt,
    },
    Client,
};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::api_resource;

fn typed<T: Object>(obj: &DynamicObject) -> Option<T> {
    match crate::decode::<T>(obj) {
        Ok(t) => Some(t),
        Err(e) => {
            metrics::counter!("watch_decode_errors_total", 1u64);
            warn!(kind = %T::KIND, name = ?obj.metadata.name, error = %e, "skipping undecodable object");
            None
        }
    }
}

/// Typed events for one watcher event. A relist becomes one `Applied` per
/// listed object; objects that fail to decode are dropped.
pub fn expand<T: Object>(ev: Event<DynamicObject>) -> Vec<WatchEvent<T>> {
    match ev {
        Event::Applied(o) => typed::<T>(&o).map(WatchEvent::Applied).into_iter().collect(),
        Event::Deleted(o) => typed::<T>(&o).map(WatchEvent::Deleted).into_iter().collect(),
        Event::Restarted(list) => {
            debug!(kind = %T::KIND, count = list.len(), "watch restart");
            list.iter().filter_map(typed::<T>).map(WatchEvent::Applied).collect()
        }
    }
}

/// Start list+watch for kind `T` and forward typed events until the receiver
/// is dropped. Stream errors are logged and the watch resumes with backoff.
pub async fn watch_objects<T: Object>(client: Client, tx: mpsc::Sender<WatchEvent<T>>) -> Result<()> {
    let api: Api<DynamicObject> = Api::all_with(client, &api_resource(T::KIND));
    let stream = watcher::watcher(api, watcher::Config::default()).default_backoff();
    futures::pin_mut!(stream);
    info!(kind = %T::KIND, "watcher started");
    while let Some(next) = stream.next().await {
        let ev = match next {
            Ok(ev) => ev,
            Err(e) => {
                metrics::counter!("watch_errors_total", 1u64);
                warn!(kind = %T::KIND, error = %e, "watch error; retrying");
                continue;
            }
        };
        for e in expand::<T>(ev) {
            if tx.send(e).await.is_err() {
                info!(kind = %T::KIND, "watch receiver closed; stopping");
                return Ok(());
            }
        }
    }
    warn!(kind = %T::KIND, "watcher stream ended");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleethub_core::{ClusterSet, Member};

    fn member(name: &str, set: &str) -> DynamicObject {
        serde_json::from_value(serde_json::json!({
            "apiVersion": "cluster.open-cluster-management.io/v1",
            "kind": "ManagedCluster",
            "metadata": { "name": name, "labels": { "cluster.open-cluster-management.io/clusterset": set } }
        }))
        .unwrap()
    }

    fn undecodable(name: &str) -> DynamicObject {
        serde_json::from_value(serde_json::json!({
            "apiVersion": "cluster.open-cluster-management.io/v1",
            "kind": "ManagedCluster",
            "metadata": { "name": name },
            "status": { "conditions": "not-a-list" }
        }))
        .unwrap()
    }

    #[test]
    fn applied_and_deleted_map_one_to_one() {
        let out = expand::<Member>(Event::Applied(member("c1", "mcs1")));
        assert!(matches!(&out[..], [WatchEvent::Applied(m)] if m.cluster_set() == Some("mcs1")));
        let out = expand::<Member>(Event::Deleted(member("c1", "mcs1")));
        assert!(matches!(&out[..], [WatchEvent::Deleted(m)] if m.metadata.name == "c1"));
    }

    #[test]
    fn restart_expands_to_applied_and_skips_bad_objects() {
        let out = expand::<Member>(Event::Restarted(vec![member("c1", "mcs1"), undecodable("bad"), member("c2", "mcs2")]));
        let names: Vec<_> = out
            .iter()
            .map(|e| match e {
                WatchEvent::Applied(m) => m.metadata.name.clone(),
                WatchEvent::Deleted(_) => panic!("relist must not yield deletes"),
            })
            .collect();
        assert_eq!(names, vec!["c1", "c2"]);
        assert!(expand::<Member>(Event::Applied(undecodable("bad"))).is_empty());
        assert!(expand::<ClusterSet>(Event::Restarted(vec![])).is_empty());
    }
}
