//! Garbage collection tied to a managed cluster's lifecycle: RBAC group
//! subjects and the resources applied from its manifests.

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use fleethub_core::EventRecorder;
use k8s_openapi::api::core::v1::Namespace;
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding, Role, RoleBinding, Subject};
use kube::{
    api::{Api, DeleteParams, ListParams, PostParams},
    Client,
};
use serde::Deserialize;
use tracing::{debug, info};

#[cfg(test)]
use mockall::automock;

use crate::is_not_found;

type KubeResult<T> = std::result::Result<T, kube::Error>;

/// The cluster calls cleanup makes. Implemented for [`kube::Client`].
#[cfg_attr(test, automock)]
#[async_trait]
pub trait CleanupClient: Send + Sync {
    async fn list_cluster_role_bindings(&self) -> KubeResult<Vec<ClusterRoleBinding>>;
    async fn replace_cluster_role_binding(&self, binding: &ClusterRoleBinding) -> KubeResult<()>;
    async fn delete_cluster_role_binding(&self, name: &str) -> KubeResult<()>;
    /// RoleBindings across all namespaces.
    async fn list_role_bindings(&self) -> KubeResult<Vec<RoleBinding>>;
    async fn replace_role_binding(&self, binding: &RoleBinding) -> KubeResult<()>;
    async fn delete_role_binding(&self, namespace: &str, name: &str) -> KubeResult<()>;
    async fn delete_target(&self, target: &ManifestTarget) -> KubeResult<()>;
}

#[async_trait]
impl CleanupClient for Client {
    async fn list_cluster_role_bindings(&self) -> KubeResult<Vec<ClusterRoleBinding>> {
        Ok(Api::<ClusterRoleBinding>::all(self.clone()).list(&ListParams::default()).await?.items)
    }

    async fn replace_cluster_role_binding(&self, binding: &ClusterRoleBinding) -> KubeResult<()> {
        let name = binding.metadata.name.as_deref().unwrap_or_default();
        Api::<ClusterRoleBinding>::all(self.clone()).replace(name, &PostParams::default(), binding).await.map(|_| ())
    }

    async fn delete_cluster_role_binding(&self, name: &str) -> KubeResult<()> {
        Api::<ClusterRoleBinding>::all(self.clone()).delete(name, &DeleteParams::default()).await.map(|_| ())
    }

    async fn list_role_bindings(&self) -> KubeResult<Vec<RoleBinding>> {
        Ok(Api::<RoleBinding>::all(self.clone()).list(&ListParams::default()).await?.items)
    }

    async fn replace_role_binding(&self, binding: &RoleBinding) -> KubeResult<()> {
        let ns = binding.metadata.namespace.as_deref().unwrap_or_default();
        let name = binding.metadata.name.as_deref().unwrap_or_default();
        Api::<RoleBinding>::namespaced(self.clone(), ns).replace(name, &PostParams::default(), binding).await.map(|_| ())
    }

    async fn delete_role_binding(&self, namespace: &str, name: &str) -> KubeResult<()> {
        Api::<RoleBinding>::namespaced(self.clone(), namespace).delete(name, &DeleteParams::default()).await.map(|_| ())
    }

    async fn delete_target(&self, t: &ManifestTarget) -> KubeResult<()> {
        let dp = DeleteParams::default();
        let ns = t.namespace.as_deref().unwrap_or_default();
        let client = self.clone();
        match t.kind {
            ManifestKind::Namespace => Api::<Namespace>::all(client).delete(&t.name, &dp).await.map(|_| ()),
            ManifestKind::ClusterRole => Api::<ClusterRole>::all(client).delete(&t.name, &dp).await.map(|_| ()),
            ManifestKind::ClusterRoleBinding => Api::<ClusterRoleBinding>::all(client).delete(&t.name, &dp).await.map(|_| ()),
            ManifestKind::Role => Api::<Role>::namespaced(client, ns).delete(&t.name, &dp).await.map(|_| ()),
            ManifestKind::RoleBinding => Api::<RoleBinding>::namespaced(client, ns).delete(&t.name, &dp).await.map(|_| ()),
        }
    }
}

/// What to do with a binding's subject list after removing a group.
#[derive(Debug, Clone, PartialEq)]
pub enum SubjectsChange {
    /// The group was not bound.
    Unchanged,
    /// The group was the only subject.
    Delete,
    /// Keep the binding with the remaining subjects.
    Update(Vec<Subject>),
}

/// Drop `Group` subjects named `group`.
///
/// A binding that had no subjects to begin with is `Unchanged` and left in
/// place; only bindings that actually named the group are deleted or updated.
pub fn strip_group(subjects: &[Subject], group: &str) -> SubjectsChange {
    let kept: Vec<Subject> = subjects.iter().filter(|s| !(s.kind == "Group" && s.name == group)).cloned().collect();
    if kept.len() == subjects.len() {
        SubjectsChange::Unchanged
    } else if kept.is_empty() {
        SubjectsChange::Delete
    } else {
        SubjectsChange::Update(kept)
    }
}

/// Remove `group` from every ClusterRoleBinding; delete bindings left without
/// subjects. The first API error aborts the pass.
pub async fn cleanup_group_from_cluster_role_bindings(client: &dyn CleanupClient, recorder: &dyn EventRecorder, group: &str) -> Result<()> {
    let list = client.list_cluster_role_bindings().await.context("listing clusterrolebindings")?;
    for mut crb in list {
        let name = crb.metadata.name.clone().unwrap_or_default();
        match strip_group(crb.subjects.as_deref().unwrap_or_default(), group) {
            SubjectsChange::Unchanged => {}
            SubjectsChange::Delete => {
                client.delete_cluster_role_binding(&name).await.with_context(|| format!("deleting clusterrolebinding {}", name))?;
                recorder.record("ClusterRoleBindingDeleted", &format!("Deleted ClusterRoleBinding {:?}", name));
            }
            SubjectsChange::Update(kept) => {
                crb.subjects = Some(kept);
                client.replace_cluster_role_binding(&crb).await.with_context(|| format!("updating clusterrolebinding {}", name))?;
                recorder.record("ClusterRoleBindingUpdated", &format!("Updated ClusterRoleBinding {:?}", name));
            }
        }
    }
    Ok(())
}

/// Remove `group` from every RoleBinding in every namespace; delete bindings
/// left without subjects. The first API error aborts the pass.
pub async fn cleanup_group_from_role_bindings(client: &dyn CleanupClient, recorder: &dyn EventRecorder, group: &str) -> Result<()> {
    let list = client.list_role_bindings().await.context("listing rolebindings")?;
    for mut rb in list {
        let name = rb.metadata.name.clone().unwrap_or_default();
        let ns = rb.metadata.namespace.clone().unwrap_or_default();
        match strip_group(rb.subjects.as_deref().unwrap_or_default(), group) {
            SubjectsChange::Unchanged => {}
            SubjectsChange::Delete => {
                client.delete_role_binding(&ns, &name).await.with_context(|| format!("deleting rolebinding {}/{}", ns, name))?;
                recorder.record("RoleBindingDeleted", &format!("Deleted RoleBinding {:?}/{:?}", ns, name));
            }
            SubjectsChange::Update(kept) => {
                rb.subjects = Some(kept);
                client.replace_role_binding(&rb).await.with_context(|| format!("updating rolebinding {}/{}", ns, name))?;
                recorder.record("RoleBindingUpdated", &format!("Updated RoleBinding {:?}/{:?}", ns, name));
            }
        }
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManifestKind {
    Namespace,
    Role,
    RoleBinding,
    ClusterRole,
    ClusterRoleBinding,
}

impl ManifestKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ManifestKind::Namespace => "Namespace",
            ManifestKind::Role => "Role",
            ManifestKind::RoleBinding => "RoleBinding",
            ManifestKind::ClusterRole => "ClusterRole",
            ManifestKind::ClusterRoleBinding => "ClusterRoleBinding",
        }
    }
}

/// An object named by a manifest that cleanup knows how to delete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestTarget {
    pub kind: ManifestKind,
    pub namespace: Option<String>,
    pub name: String,
}

impl std::fmt::Display for ManifestTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{} {}/{}", self.kind.as_str(), ns, self.name),
            None => write!(f, "{} {}", self.kind.as_str(), self.name),
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TypeAndMeta {
    api_version: Option<String>,
    kind: Option<String>,
    #[serde(default)]
    metadata: Meta,
}

#[derive(Deserialize, Default)]
struct Meta {
    name: Option<String>,
    namespace: Option<String>,
}

/// Decode one YAML (or JSON) manifest into a deletable target.
pub fn parse_manifest(raw: &[u8]) -> Result<ManifestTarget> {
    let tm: TypeAndMeta = serde_yaml::from_slice(raw).context("decoding manifest")?;
    let api_version = tm.api_version.ok_or_else(|| anyhow!("manifest missing apiVersion"))?;
    let kind_s = tm.kind.ok_or_else(|| anyhow!("manifest missing kind"))?;
    let kind = match (api_version.as_str(), kind_s.as_str()) {
        ("v1", "Namespace") => ManifestKind::Namespace,
        ("rbac.authorization.k8s.io/v1", "Role") => ManifestKind::Role,
        ("rbac.authorization.k8s.io/v1", "RoleBinding") => ManifestKind::RoleBinding,
        ("rbac.authorization.k8s.io/v1", "ClusterRole") => ManifestKind::ClusterRole,
        ("rbac.authorization.k8s.io/v1", "ClusterRoleBinding") => ManifestKind::ClusterRoleBinding,
        _ => return Err(anyhow!("unhandled type {}/{}", api_version, kind_s)),
    };
    let name = tm.metadata.name.filter(|n| !n.is_empty()).ok_or_else(|| anyhow!("manifest missing metadata.name"))?;
    let namespace = match kind {
        ManifestKind::Role | ManifestKind::RoleBinding => {
            Some(tm.metadata.namespace.filter(|n| !n.is_empty()).ok_or_else(|| anyhow!("{} {} missing metadata.namespace", kind_s, name))?)
        }
        _ => None,
    };
    Ok(ManifestTarget { kind, namespace, name })
}

/// Source of rendered manifest bytes by file name.
pub trait ManifestSource {
    fn load(&self, file: &str) -> Result<Vec<u8>>;
}

/// Reads manifests from a directory, substituting `{{ .ManagedClusterName }}`.
pub struct ClusterManifestDir {
    dir: PathBuf,
    cluster_name: String,
}

impl ClusterManifestDir {
    pub fn new(dir: impl AsRef<Path>, cluster_name: impl Into<String>) -> Self {
        Self { dir: dir.as_ref().to_path_buf(), cluster_name: cluster_name.into() }
    }

    pub fn render(&self, template: &str) -> String {
        template.replace("{{ .ManagedClusterName }}", &self.cluster_name)
    }
}

impl ManifestSource for ClusterManifestDir {
    fn load(&self, file: &str) -> Result<Vec<u8>> {
        let path = self.dir.join(file);
        let raw = std::fs::read_to_string(&path).with_context(|| format!("reading manifest {}", path.display()))?;
        Ok(self.render(&raw).into_bytes())
    }
}

/// Join collected failures into one multi-line error.
pub fn aggregate(errs: Vec<anyhow::Error>) -> Result<()> {
    match errs.len() {
        0 => Ok(()),
        1 => Err(errs.into_iter().next().unwrap_or_else(|| anyhow!("unknown error"))),
        n => {
            let lines: Vec<String> = errs.iter().map(|e| format!("* {:#}", e)).collect();
            Err(anyhow!("{} errors occurred:\n{}", n, lines.join("\n")))
        }
    }
}

/// Delete every object named by `files`. Objects already gone are skipped;
/// every other failure is collected and reported together.
pub async fn cleanup_cluster_manifests(
    client: &dyn CleanupClient,
    recorder: &dyn EventRecorder,
    source: &dyn ManifestSource,
    files: &[String],
) -> Result<()> {
    let mut errs = Vec::new();
    for file in files {
        let target = match source.load(file).and_then(|raw| parse_manifest(&raw)) {
            Ok(t) => t,
            Err(e) => {
                errs.push(e.context(format!("manifest {}", file)));
                continue;
            }
        };
        match client.delete_target(&target).await {
            Ok(()) => {
                info!(target = %target, "deleted");
                recorder.record(&format!("ManagedCluster{}Deleted", target.kind.as_str()), &format!("Deleted {}", target));
            }
            Err(e) if is_not_found(&e) => debug!(target = %target, "already gone"),
            Err(e) => errs.push(anyhow!(e).context(format!("deleting {}", target))),
        }
    }
    aggregate(errs)
}
