//! fleethub store: an in-RAM object authority and the reconcile work queue.
//!
//! `MemoryStore` backs the CLI's offline mode and every test that needs a
//! store. Reads are served from an immutable snapshot swapped on each write,
//! so a `list` never observes a half-applied update.

#![forbid(unsafe_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use arc_swap::ArcSwap;
use fleethub_core::{Error, Kind, Object, ObjectKey, ObjectStore, Result};
use rustc_hash::FxHashMap;
use serde_json::Value as Json;
use tracing::debug;

pub mod queue;

pub use queue::WorkQueue;

type Table = FxHashMap<(Kind, ObjectKey), Json>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verb {
    Get,
    List,
    UpdateStatus,
}

/// One call observed by the store, in call order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Action {
    pub verb: Verb,
    pub kind: Kind,
    pub key: Option<ObjectKey>,
}

#[derive(Default)]
struct Faults {
    reads: VecDeque<Error>,
    writes: VecDeque<Error>,
}

pub struct MemoryStore {
    snap: ArcSwap<Table>,
    writer: Mutex<()>,
    rv: AtomicU64,
    actions: Mutex<Vec<Action>>,
    faults: Mutex<Faults>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn decode<T: Object>(raw: &Json) -> Result<T> {
    serde_json::from_value(raw.clone())
        .map_err(|e| Error::precondition(format!("decoding stored {}: {}", T::KIND, e)))
}

fn encode<T: Object>(obj: &T) -> Result<Json> {
    serde_json::to_value(obj).map_err(|e| Error::precondition(format!("encoding {}: {}", T::KIND, e)))
}

fn set_resource_version(raw: &mut Json, rv: u64) {
    if let Some(meta) = raw.get_mut("metadata").and_then(|m| m.as_object_mut()) {
        meta.insert("resourceVersion".into(), Json::String(rv.to_string()));
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            snap: ArcSwap::from_pointee(Table::default()),
            writer: Mutex::new(()),
            rv: AtomicU64::new(0),
            actions: Mutex::new(Vec::new()),
            faults: Mutex::new(Faults::default()),
        }
    }

    fn next_rv(&self) -> u64 {
        self.rv.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn swap(&self, f: impl FnOnce(&mut Table)) {
        let mut next = (**self.snap.load()).clone();
        f(&mut next);
        self.snap.store(Arc::new(next));
    }

    fn observe(&self, verb: Verb, kind: Kind, key: Option<&ObjectKey>) {
        lock(&self.actions).push(Action { verb, kind, key: key.cloned() });
    }

    /// Create or replace an object as the external authority would, assigning
    /// a uid (when missing) and a fresh resourceVersion. Not recorded as an action.
    pub fn put<T: Object>(&self, mut obj: T) -> Result<T> {
        let _w = lock(&self.writer);
        let rv = self.next_rv();
        let meta = obj.meta_mut();
        if meta.uid.is_none() {
            meta.uid = Some(uuid::Uuid::new_v4().to_string());
        }
        meta.resource_version = Some(rv.to_string());
        let key = obj.key();
        let raw = encode(&obj)?;
        self.swap(|t| {
            t.insert((T::KIND, key), raw);
        });
        Ok(obj)
    }

    /// Edit a stored object in place as an external writer; bumps its resourceVersion.
    pub fn modify<T: Object>(&self, key: &ObjectKey, f: impl FnOnce(&mut T)) -> Result<T> {
        let current = self
            .snap
            .load()
            .get(&(T::KIND, key.clone()))
            .map(decode::<T>)
            .transpose()?
            .ok_or_else(|| Error::not_found(T::KIND, key))?;
        let mut next = current;
        f(&mut next);
        self.put(next)
    }

    pub fn remove(&self, kind: Kind, key: &ObjectKey) -> bool {
        let _w = lock(&self.writer);
        let mut removed = false;
        self.swap(|t| removed = t.remove(&(kind, key.clone())).is_some());
        removed
    }

    /// Fail the next status write with a conflict, `n` times.
    pub fn inject_conflicts(&self, n: usize) {
        let mut faults = lock(&self.faults);
        for _ in 0..n {
            faults.writes.push_back(Error::conflict(Kind::Set, &ObjectKey::cluster(""), "injected conflict"));
        }
    }

    pub fn fail_next_write(&self, err: Error) {
        lock(&self.faults).writes.push_back(err);
    }

    pub fn fail_next_read(&self, err: Error) {
        lock(&self.faults).reads.push_back(err);
    }

    pub fn actions(&self) -> Vec<Action> {
        lock(&self.actions).clone()
    }

    pub fn writes(&self) -> Vec<Action> {
        lock(&self.actions).iter().filter(|a| a.verb == Verb::UpdateStatus).cloned().collect()
    }

    pub fn clear_actions(&self) {
        lock(&self.actions).clear();
    }

    pub fn len(&self) -> usize {
        self.snap.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn take_read_fault(&self) -> Option<Error> {
        lock(&self.faults).reads.pop_front()
    }
}

#[async_trait::async_trait]
impl ObjectStore for MemoryStore {
    async fn get<T: Object>(&self, key: &ObjectKey) -> Result<Option<T>> {
        self.observe(Verb::Get, T::KIND, Some(key));
        if let Some(e) = self.take_read_fault() {
            return Err(e);
        }
        self.snap.load().get(&(T::KIND, key.clone())).map(decode::<T>).transpose()
    }

    async fn list<T: Object>(&self) -> Result<Vec<T>> {
        self.observe(Verb::List, T::KIND, None);
        if let Some(e) = self.take_read_fault() {
            return Err(e);
        }
        let snap = self.snap.load();
        let mut out = snap
            .iter()
            .filter(|((kind, _), _)| *kind == T::KIND)
            .map(|(_, raw)| decode::<T>(raw))
            .collect::<Result<Vec<T>>>()?;
        out.sort_by(|a, b| a.key().cmp(&b.key()));
        Ok(out)
    }

    async fn update_status<T: Object>(&self, obj: &T) -> Result<T> {
        let key = obj.key();
        self.observe(Verb::UpdateStatus, T::KIND, Some(&key));
        let _w = lock(&self.writer);

        if let Some(e) = lock(&self.faults).writes.pop_front() {
            return Err(match e {
                Error::Conflict { message, .. } => Error::conflict(T::KIND, &key, message),
                other => other,
            });
        }

        let snap = self.snap.load();
        let stored = snap.get(&(T::KIND, key.clone())).ok_or_else(|| Error::not_found(T::KIND, &key))?;
        let stored_rv = stored
            .get("metadata")
            .and_then(|m| m.get("resourceVersion"))
            .and_then(|v| v.as_str())
            .map(str::to_string);
        if obj.meta().resource_version != stored_rv {
            return Err(Error::conflict(
                T::KIND,
                &key,
                format!(
                    "resourceVersion {} is stale (current {})",
                    obj.meta().resource_version.as_deref().unwrap_or("<none>"),
                    stored_rv.as_deref().unwrap_or("<none>")
                ),
            ));
        }

        // Only the status stanza is taken from the caller.
        let mut next = stored.clone();
        let status = encode(obj)?.get("status").cloned().unwrap_or(Json::Null);
        if let Some(o) = next.as_object_mut() {
            o.insert("status".into(), status);
        }
        let rv = self.next_rv();
        set_resource_version(&mut next, rv);
        let out = decode::<T>(&next)?;
        drop(snap);
        self.swap(|t| {
            t.insert((T::KIND, key.clone()), next);
        });
        metrics::counter!("memstore_status_writes_total", 1u64);
        debug!(kind = %T::KIND, key = %key, rv, "status written");
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleethub_core::{ClusterSet, Condition, ConditionStatus, Member, CLUSTER_SET_LABEL};

    #[tokio::test]
    async fn put_assigns_uid_and_resource_version() {
        let store = MemoryStore::new();
        let set = store.put(ClusterSet::new("mcs1")).unwrap();
        assert!(set.metadata.uid.is_some());
        assert_eq!(set.metadata.resource_version.as_deref(), Some("1"));
        let got: ClusterSet = store.get(&ObjectKey::cluster("mcs1")).await.unwrap().unwrap();
        assert_eq!(got, set);
    }

    #[tokio::test]
    async fn list_is_kind_scoped_and_sorted() {
        let store = MemoryStore::new();
        store.put(Member::new("b").with_label(CLUSTER_SET_LABEL, "mcs1")).unwrap();
        store.put(Member::new("a")).unwrap();
        store.put(ClusterSet::new("mcs1")).unwrap();
        let members: Vec<Member> = store.list().await.unwrap();
        let names: Vec<_> = members.iter().map(|m| m.metadata.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);
        let sets: Vec<ClusterSet> = store.list().await.unwrap();
        assert_eq!(sets.len(), 1);
    }

    #[tokio::test]
    async fn stale_resource_version_conflicts() {
        let store = MemoryStore::new();
        let mut set = store.put(ClusterSet::new("mcs1")).unwrap();
        store.modify::<ClusterSet>(&ObjectKey::cluster("mcs1"), |_| {}).unwrap();
        set.status.conditions.push(Condition::new("Empty", ConditionStatus::True, "r", "m"));
        let err = store.update_status(&set).await.unwrap_err();
        assert!(err.is_conflict(), "err={}", err);
    }

    #[tokio::test]
    async fn update_status_only_touches_status() {
        let store = MemoryStore::new();
        let mut set = store.put(ClusterSet::new("mcs1")).unwrap();
        set.metadata.labels.insert("sneaky".into(), "yes".into());
        set.status.conditions.push(Condition::new("Empty", ConditionStatus::True, "r", "m"));
        let written = store.update_status(&set).await.unwrap();
        assert!(written.metadata.labels.is_empty());
        assert_eq!(written.status.conditions.len(), 1);
        assert_eq!(written.metadata.resource_version.as_deref(), Some("2"));
        assert_eq!(store.writes().len(), 1);
    }

    #[tokio::test]
    async fn injected_faults_are_consumed_in_order() {
        let store = MemoryStore::new();
        let set = store.put(ClusterSet::new("mcs1")).unwrap();
        store.inject_conflicts(1);
        store.fail_next_write(Error::transient("etcd unavailable"));
        assert!(store.update_status(&set).await.unwrap_err().is_conflict());
        assert!(matches!(store.update_status(&set).await.unwrap_err(), Error::Transient(_)));
        assert!(store.update_status(&set).await.is_ok());

        store.fail_next_read(Error::transient("timeout"));
        assert!(store.get::<ClusterSet>(&ObjectKey::cluster("mcs1")).await.is_err());
        assert!(store.get::<ClusterSet>(&ObjectKey::cluster("mcs1")).await.unwrap().is_some());
    }
}
