//! ManagedClusterSet controller.
//!
//! For one set: select members by the cluster-set label, refresh the
//! membership cache, and publish the `Empty` condition through the status updater.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant as StdInstant};

use fleethub_core::{
    ClusterSet, Condition, ConditionStatus, Error, EventRecorder, Member, Object, ObjectKey, ObjectStore, Result,
    WatchEvent, CLUSTER_SET_CONDITION_EMPTY,
};
use metrics::{counter, histogram};
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::time::Instant;
use tracing::{debug, info};

use crate::retry::RetryPolicy;
use crate::status::{self, StatusUpdate};

pub const REASON_NO_CLUSTER_MATCHED: &str = "NoClusterMatched";
pub const REASON_CLUSTERS_SELECTED: &str = "ClustersSelected";

/// The `Empty` condition for a set with `selected` members.
pub fn empty_condition(selected: usize) -> Condition {
    if selected == 0 {
        Condition::new(CLUSTER_SET_CONDITION_EMPTY, ConditionStatus::True, REASON_NO_CLUSTER_MATCHED, "No ManagedCluster selected")
    } else {
        Condition::new(
            CLUSTER_SET_CONDITION_EMPTY,
            ConditionStatus::False,
            REASON_CLUSTERS_SELECTED,
            format!("{} ManagedClusters selected", selected),
        )
    }
}

/// Members that joined or left a set during one rebuild.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Churn {
    pub joined: Vec<String>,
    /// Cached under this set but no longer selected.
    pub left: Vec<String>,
}

impl Churn {
    pub fn is_empty(&self) -> bool {
        self.joined.is_empty() && self.left.is_empty()
    }
}

/// Member name → cluster set name, as last observed by the controller.
///
/// Advisory only; the store stays authoritative. Shared between workers.
#[derive(Debug, Default)]
pub struct MembershipCache {
    inner: RwLock<FxHashMap<String, String>>,
}

impl MembershipCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, FxHashMap<String, String>> {
        self.inner.read().unwrap_or_else(|p| p.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, FxHashMap<String, String>> {
        self.inner.write().unwrap_or_else(|p| p.into_inner())
    }

    pub fn get(&self, member: &str) -> Option<String> {
        self.read().get(member).cloned()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sorted copy of the whole mapping.
    pub fn snapshot(&self) -> BTreeMap<String, String> {
        self.read().iter().map(|(k, v)| (k.clone(), v.clone())).collect()
    }

    pub fn members_of(&self, set: &str) -> Vec<String> {
        let mut out: Vec<String> = self.read().iter().filter(|(_, s)| s.as_str() == set).map(|(m, _)| m.clone()).collect();
        out.sort();
        out
    }

    /// Point every `selected` member at `set`. Entries of members that are not
    /// selected are only touched when `prune` is set and they point at `set`.
    pub fn rebuild(&self, set: &str, selected: &[String], prune: bool) -> Churn {
        let mut map = self.write();
        let keep: FxHashSet<&str> = selected.iter().map(String::as_str).collect();

        let mut churn = Churn::default();
        for member in selected {
            let prev = map.insert(member.clone(), set.to_string());
            if prev.as_deref() != Some(set) {
                churn.joined.push(member.clone());
            }
        }
        churn.left = map
            .iter()
            .filter(|(m, s)| s.as_str() == set && !keep.contains(m.as_str()))
            .map(|(m, _)| m.clone())
            .collect();
        churn.left.sort();
        if prune {
            for m in &churn.left {
                map.remove(m);
            }
        }
        churn
    }

    /// Drop a member's entry, returning the set it pointed at.
    pub fn forget(&self, member: &str) -> Option<String> {
        self.write().remove(member)
    }
}

/// Per-call options handed down by the scheduler.
#[derive(Debug, Clone, Default)]
pub struct SyncContext {
    pub deadline: Option<Instant>,
}

impl SyncContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self { deadline: Some(Instant::now() + timeout) }
    }

    pub fn with_deadline(deadline: Instant) -> Self {
        Self { deadline: Some(deadline) }
    }
}

/// What one `sync` call did.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncOutcome {
    /// The set does not exist.
    Missing,
    /// The set carries a deletion marker.
    Deleting,
    Reconciled { selected: usize, churn: Churn, updated: bool },
}

pub struct ClusterSetController<S, R> {
    store: Arc<S>,
    recorder: Arc<R>,
    membership: Arc<MembershipCache>,
    retry: RetryPolicy,
    prune_membership: bool,
}

impl<S: ObjectStore, R: EventRecorder> ClusterSetController<S, R> {
    pub fn new(store: Arc<S>, recorder: Arc<R>, membership: Arc<MembershipCache>) -> Self {
        Self { store, recorder, membership, retry: RetryPolicy::default(), prune_membership: false }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Also drop cache entries of members that left a set.
    pub fn with_membership_pruning(mut self, prune: bool) -> Self {
        self.prune_membership = prune;
        self
    }

    pub fn membership(&self) -> &Arc<MembershipCache> {
        &self.membership
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Reconcile the cluster set named by `key`.
    pub async fn sync(&self, ctx: &SyncContext, key: &ObjectKey) -> Result<()> {
        self.reconcile(ctx, key).await.map(|_| ())
    }

    pub async fn reconcile(&self, ctx: &SyncContext, key: &ObjectKey) -> Result<SyncOutcome> {
        let started = StdInstant::now();
        counter!("clusterset_sync_total", 1u64);
        let res = self.reconcile_inner(ctx, key).await;
        histogram!("clusterset_sync_latency_ms", started.elapsed().as_secs_f64() * 1000.0);
        if res.is_err() {
            counter!("clusterset_sync_errors_total", 1u64);
        }
        res
    }

    async fn reconcile_inner(&self, ctx: &SyncContext, key: &ObjectKey) -> Result<SyncOutcome> {
        if key.namespace.is_some() {
            return Err(Error::precondition(format!("ManagedClusterSet is cluster-scoped; got key {}", key)));
        }
        debug!(set = %key, "reconciling cluster set");

        let Some(set) = self.store.get::<ClusterSet>(key).await? else {
            debug!(set = %key, "cluster set not found; nothing to do");
            return Ok(SyncOutcome::Missing);
        };
        if set.is_deleting() {
            debug!(set = %key, "cluster set is being deleted; skipping");
            return Ok(SyncOutcome::Deleting);
        }

        let members: Vec<Member> = self.store.list().await?;
        let selected: Vec<String> = members.iter().filter(|m| set.selects(m)).map(|m| m.name().to_string()).collect();

        let churn = self.membership.rebuild(set.name(), &selected, self.prune_membership);
        if !churn.joined.is_empty() {
            info!(set = %key, joined = ?churn.joined, "members joined cluster set");
            self.recorder.record(
                "ClusterSetMembersJoined",
                &format!("ManagedClusters {} joined ManagedClusterSet {}", churn.joined.join(", "), set.name()),
            );
        }
        if !churn.left.is_empty() {
            if self.prune_membership {
                info!(set = %key, left = ?churn.left, "members left cluster set");
                self.recorder.record(
                    "ClusterSetMembersLeft",
                    &format!("ManagedClusters {} left ManagedClusterSet {}", churn.left.join(", "), set.name()),
                );
            } else {
                debug!(set = %key, stale = ?churn.left, "stale membership entries retained");
            }
        }

        let StatusUpdate { updated, .. } = status::update_status::<ClusterSet, S>(
            &self.store,
            key,
            &[status::set_condition(empty_condition(selected.len()))],
            &self.retry,
            ctx.deadline,
        )
        .await?;

        info!(set = %key, selected = selected.len(), updated, "cluster set reconciled");
        Ok(SyncOutcome::Reconciled { selected: selected.len(), churn, updated })
    }

    /// Sets to resync for a member event: the set named by its label and the
    /// set it was last cached under. A deleted member is forgotten.
    pub fn sets_for_member_event(&self, event: &WatchEvent<Member>) -> Vec<ObjectKey> {
        let (member, previous) = match event {
            WatchEvent::Applied(m) => (m, self.membership.get(m.name())),
            WatchEvent::Deleted(m) => (m, self.membership.forget(m.name())),
        };
        let mut out: Vec<ObjectKey> = Vec::with_capacity(2);
        if let Some(current) = member.cluster_set() {
            out.push(ObjectKey::cluster(current));
        }
        if let Some(prev) = previous {
            let prev = ObjectKey::cluster(prev);
            if !out.contains(&prev) {
                out.push(prev);
            }
        }
        out
    }

    /// Enqueue every existing cluster set.
    pub async fn all_sets(&self) -> Result<Vec<ObjectKey>> {
        let sets: Vec<ClusterSet> = self.store.list().await?;
        Ok(sets.iter().map(|s| s.key()).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_condition_messages() {
        let c = empty_condition(0);
        assert_eq!((c.status, c.reason.as_str(), c.message.as_str()), (ConditionStatus::True, "NoClusterMatched", "No ManagedCluster selected"));
        let c = empty_condition(2);
        assert_eq!((c.status, c.reason.as_str(), c.message.as_str()), (ConditionStatus::False, "ClustersSelected", "2 ManagedClusters selected"));
        assert_eq!(empty_condition(1).message, "1 ManagedClusters selected");
    }

    #[test]
    fn rebuild_reports_churn_and_retains_stale_by_default() {
        let cache = MembershipCache::new();
        let churn = cache.rebuild("mcs1", &["c1".into(), "c2".into()], false);
        assert_eq!(churn.joined, vec!["c1".to_string(), "c2".to_string()]);
        assert!(churn.left.is_empty());

        let churn = cache.rebuild("mcs1", &["c1".into()], false);
        assert!(churn.joined.is_empty());
        assert_eq!(churn.left, vec!["c2".to_string()]);
        assert_eq!(cache.get("c2").as_deref(), Some("mcs1"));
    }

    #[test]
    fn rebuild_prunes_only_own_entries() {
        let cache = MembershipCache::new();
        cache.rebuild("mcs1", &["c1".into(), "c2".into()], false);
        cache.rebuild("mcs2", &["c3".into()], false);
        let churn = cache.rebuild("mcs1", &["c1".into()], true);
        assert_eq!(churn.left, vec!["c2".to_string()]);
        assert_eq!(cache.get("c2"), None);
        assert_eq!(cache.get("c3").as_deref(), Some("mcs2"));
        assert_eq!(cache.members_of("mcs1"), vec!["c1".to_string()]);
    }

    #[test]
    fn moving_member_counts_as_joined() {
        let cache = MembershipCache::new();
        cache.rebuild("mcs1", &["c1".into()], false);
        let churn = cache.rebuild("mcs2", &["c1".into()], false);
        assert_eq!(churn.joined, vec!["c1".to_string()]);
        assert_eq!(cache.forget("c1").as_deref(), Some("mcs2"));
        assert!(cache.is_empty());
    }
}
