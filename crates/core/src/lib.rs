//! fleethub core types: members, cluster sets, conditions and the store seam.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

pub mod conditions;
pub mod error;

pub use conditions::{Condition, ConditionStatus, HasConditions};
pub use error::{Error, Result};

pub const API_GROUP: &str = "cluster.open-cluster-management.io";

/// API group of per-cluster add-on objects.
pub const ADDON_API_GROUP: &str = "addon.open-cluster-management.io";

/// Label on a member naming the cluster set it belongs to.
pub const CLUSTER_SET_LABEL: &str = "cluster.open-cluster-management.io/clusterset";

/// Condition type published on every cluster set.
pub const CLUSTER_SET_CONDITION_EMPTY: &str = "Empty";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Kind {
    Member,
    Set,
    /// Namespaced, one per member namespace.
    AddOn,
}

impl Kind {
    pub fn kind(&self) -> &'static str {
        match self {
            Kind::Member => "ManagedCluster",
            Kind::Set => "ManagedClusterSet",
            Kind::AddOn => "ManagedClusterAddOn",
        }
    }

    pub fn group(&self) -> &'static str {
        match self {
            Kind::Member | Kind::Set => API_GROUP,
            Kind::AddOn => ADDON_API_GROUP,
        }
    }

    pub fn version(&self) -> &'static str {
        match self {
            Kind::Member => "v1",
            Kind::Set | Kind::AddOn => "v1alpha1",
        }
    }

    pub fn plural(&self) -> &'static str {
        match self {
            Kind::Member => "managedclusters",
            Kind::Set => "managedclustersets",
            Kind::AddOn => "managedclusteraddons",
        }
    }

    pub fn namespaced(&self) -> bool {
        matches!(self, Kind::AddOn)
    }

    pub fn api_version(&self) -> String {
        format!("{}/{}", self.group(), self.version())
    }
}

impl std::fmt::Display for Kind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.kind())
    }
}

/// `namespace/name` or bare `name` for cluster-scoped objects.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectKey {
    pub fn cluster(name: impl Into<String>) -> Self {
        Self { namespace: None, name: name.into() }
    }

    pub fn namespaced(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self { namespace: Some(namespace.into()), name: name.into() }
    }

    /// Parse a work-queue key.
    pub fn parse(key: &str) -> Result<Self> {
        let parts: Vec<&str> = key.split('/').collect();
        match parts.as_slice() {
            [name] if !name.is_empty() => Ok(Self::cluster(*name)),
            [ns, name] if !ns.is_empty() && !name.is_empty() => Ok(Self::namespaced(*ns, *name)),
            _ => Err(Error::precondition(format!("invalid object key {:?} (expect name or namespace/name)", key))),
        }
    }
}

impl std::fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}", ns, self.name),
            None => f.write_str(&self.name),
        }
    }
}

/// The slice of Kubernetes object metadata the hub reads and writes.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_version: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deletion_timestamp: Option<DateTime<Utc>>,
}

impl ObjectMeta {
    pub fn named(name: impl Into<String>) -> Self {
        Self { name: name.into(), ..Default::default() }
    }
}

/// A store-addressable kind with a status sub-resource.
pub trait Object: Clone + std::fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static {
    type Status: Clone + PartialEq + Default + std::fmt::Debug + Send + Sync + 'static;

    const KIND: Kind;

    fn meta(&self) -> &ObjectMeta;
    fn meta_mut(&mut self) -> &mut ObjectMeta;
    fn status(&self) -> &Self::Status;
    fn status_mut(&mut self) -> &mut Self::Status;

    fn key(&self) -> ObjectKey {
        let meta = self.meta();
        ObjectKey { namespace: meta.namespace.clone(), name: meta.name.clone() }
    }

    fn name(&self) -> &str {
        &self.meta().name
    }

    /// Whether the object carries a deletion marker.
    fn is_deleting(&self) -> bool {
        self.meta().deletion_timestamp.is_some()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MemberStatus {
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

impl HasConditions for MemberStatus {
    fn conditions(&self) -> &[Condition] { &self.conditions }
    fn conditions_mut(&mut self) -> &mut Vec<Condition> { &mut self.conditions }
}

/// A managed cluster participating in the fleet.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Member {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub status: MemberStatus,
}

impl Member {
    pub fn new(name: impl Into<String>) -> Self {
        Self { metadata: ObjectMeta::named(name), status: MemberStatus::default() }
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.labels.insert(key.into(), value.into());
        self
    }

    /// Cluster set named by this member's set label, if any.
    pub fn cluster_set(&self) -> Option<&str> {
        self.metadata.labels.get(CLUSTER_SET_LABEL).map(String::as_str)
    }
}

impl Object for Member {
    type Status = MemberStatus;
    const KIND: Kind = Kind::Member;

    fn meta(&self) -> &ObjectMeta { &self.metadata }
    fn meta_mut(&mut self) -> &mut ObjectMeta { &mut self.metadata }
    fn status(&self) -> &MemberStatus { &self.status }
    fn status_mut(&mut self) -> &mut MemberStatus { &mut self.status }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSetStatus {
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

impl HasConditions for ClusterSetStatus {
    fn conditions(&self) -> &[Condition] { &self.conditions }
    fn conditions_mut(&mut self) -> &mut Vec<Condition> { &mut self.conditions }
}

/// A named grouping of members selected by label.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ClusterSet {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub status: ClusterSetStatus,
}

impl ClusterSet {
    pub fn new(name: impl Into<String>) -> Self {
        Self { metadata: ObjectMeta::named(name), status: ClusterSetStatus::default() }
    }

    /// Whether `member` is selected by this set: exact, case-sensitive label match.
    pub fn selects(&self, member: &Member) -> bool {
        member.cluster_set() == Some(self.metadata.name.as_str())
    }
}

impl Object for ClusterSet {
    type Status = ClusterSetStatus;
    const KIND: Kind = Kind::Set;

    fn meta(&self) -> &ObjectMeta { &self.metadata }
    fn meta_mut(&mut self) -> &mut ObjectMeta { &mut self.metadata }
    fn status(&self) -> &ClusterSetStatus { &self.status }
    fn status_mut(&mut self) -> &mut ClusterSetStatus { &mut self.status }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AddOnStatus {
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

impl HasConditions for AddOnStatus {
    fn conditions(&self) -> &[Condition] { &self.conditions }
    fn conditions_mut(&mut self) -> &mut Vec<Condition> { &mut self.conditions }
}

/// An add-on installed on a member, living in the member's namespace.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AddOn {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub status: AddOnStatus,
}

impl AddOn {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        let mut metadata = ObjectMeta::named(name);
        metadata.namespace = Some(namespace.into());
        Self { metadata, status: AddOnStatus::default() }
    }
}

impl Object for AddOn {
    type Status = AddOnStatus;
    const KIND: Kind = Kind::AddOn;

    fn meta(&self) -> &ObjectMeta { &self.metadata }
    fn meta_mut(&mut self) -> &mut ObjectMeta { &mut self.metadata }
    fn status(&self) -> &AddOnStatus { &self.status }
    fn status_mut(&mut self) -> &mut AddOnStatus { &mut self.status }
}

/// Point-in-time reads plus status writes against the backing authority.
///
/// `update_status` must fail with [`Error::Conflict`] when the object's
/// `resourceVersion` no longer matches the stored one.
#[async_trait::async_trait]
pub trait ObjectStore: Send + Sync {
    async fn get<T: Object>(&self, key: &ObjectKey) -> Result<Option<T>>;
    async fn list<T: Object>(&self) -> Result<Vec<T>>;
    async fn update_status<T: Object>(&self, obj: &T) -> Result<T>;
}

/// Change notification delivered by a watcher.
#[derive(Debug, Clone, PartialEq)]
pub enum WatchEvent<T> {
    Applied(T),
    Deleted(T),
}

/// Fire-and-forget event sink. Implementations never fail the caller.
pub trait EventRecorder: Send + Sync {
    fn record(&self, reason: &str, message: &str);

    fn warning(&self, reason: &str, message: &str) {
        self.record(reason, message);
    }
}

pub mod prelude {
    pub use super::{
        AddOn, AddOnStatus, ClusterSet, ClusterSetStatus, Condition, ConditionStatus, Error, EventRecorder, HasConditions, Kind, Member,
        MemberStatus, Object, ObjectKey, ObjectMeta, ObjectStore, Result, WatchEvent, CLUSTER_SET_CONDITION_EMPTY,
        CLUSTER_SET_LABEL,
    };
}
