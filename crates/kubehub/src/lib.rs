//! fleethub kubehub: the kube-backed object store and watcher wiring.

#![forbid(unsafe_code)]

use anyhow::{Context, Result as AnyResult};
use fleethub_core::{Error, Kind, Object, ObjectKey, ObjectStore, Result};
use kube::{
    api::{Api, ListParams, PostParams},
    core::{ApiResource, DynamicObject, GroupVersionKind},
    Client,
};
use metrics::counter;
use serde_json::Value as Json;
use tracing::debug;

pub mod cleanup;
pub mod watch;

pub use watch::watch_objects;

pub async fn get_kube_client() -> AnyResult<Client> {
    Client::try_default().await.context("building kube client from kubeconfig or in-cluster env")
}

pub fn api_resource(kind: Kind) -> ApiResource {
    let gvk = GroupVersionKind::gvk(kind.group(), kind.version(), kind.kind());
    ApiResource::from_gvk_with_plural(&gvk, kind.plural())
}

/// Map a kube error onto the store error taxonomy by HTTP status.
pub fn map_kube_error(kind: Kind, key: &ObjectKey, err: kube::Error) -> Error {
    match &err {
        kube::Error::Api(ae) if ae.code == 404 => Error::not_found(kind, key),
        kube::Error::Api(ae) if ae.code == 409 => Error::conflict(kind, key, ae.message.clone()),
        kube::Error::Api(ae) if ae.code == 400 || ae.code == 422 => {
            Error::precondition(format!("{} {} rejected: {}", kind, key, ae.message))
        }
        _ => Error::transient(format!("{} {}: {}", kind, key, err)),
    }
}

pub fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 404)
}

/// Stand-in key naming a whole collection in list errors.
fn list_key(kind: Kind) -> ObjectKey {
    ObjectKey::cluster(kind.plural())
}

fn decode<T: Object>(obj: &DynamicObject) -> Result<T> {
    let raw = serde_json::to_value(obj).map_err(|e| Error::precondition(format!("serializing {}: {}", T::KIND, e)))?;
    serde_json::from_value(raw).map_err(|e| Error::precondition(format!("decoding {}: {}", T::KIND, e)))
}

fn encode<T: Object>(obj: &T) -> Result<Vec<u8>> {
    let mut raw = serde_json::to_value(obj).map_err(|e| Error::precondition(format!("encoding {}: {}", T::KIND, e)))?;
    if let Some(o) = raw.as_object_mut() {
        o.insert("apiVersion".into(), Json::String(T::KIND.api_version()));
        o.insert("kind".into(), Json::String(T::KIND.kind().to_string()));
    }
    serde_json::to_vec(&raw).map_err(|e| Error::precondition(format!("encoding {}: {}", T::KIND, e)))
}

/// `ObjectStore` over the cluster API. Status writes go through the status
/// sub-resource and carry the read resourceVersion, so stale writes get a 409.
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    pub async fn try_default() -> AnyResult<Self> {
        Ok(Self::new(get_kube_client().await?))
    }

    pub fn client(&self) -> Client {
        self.client.clone()
    }

    fn api(&self, kind: Kind, namespace: Option<&str>) -> Api<DynamicObject> {
        let ar = api_resource(kind);
        match namespace {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, &ar),
            None => Api::all_with(self.client.clone(), &ar),
        }
    }
}

#[async_trait::async_trait]
impl ObjectStore for KubeStore {
    async fn get<T: Object>(&self, key: &ObjectKey) -> Result<Option<T>> {
        let api = self.api(T::KIND, key.namespace.as_deref());
        match api.get_opt(&key.name).await {
            Ok(Some(obj)) => Ok(Some(decode(&obj)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(map_kube_error(T::KIND, key, e)),
        }
    }

    async fn list<T: Object>(&self) -> Result<Vec<T>> {
        let api = self.api(T::KIND, None);
        let list = api
            .list(&ListParams::default())
            .await
            .map_err(|e| map_kube_error(T::KIND, &list_key(T::KIND), e))?;
        debug!(kind = %T::KIND, count = list.items.len(), "listed");
        list.items.iter().map(decode::<T>).collect()
    }

    async fn update_status<T: Object>(&self, obj: &T) -> Result<T> {
        let key = obj.key();
        let api = self.api(T::KIND, key.namespace.as_deref());
        let body = encode(obj)?;
        match api.replace_status(&key.name, &PostParams::default(), body).await {
            Ok(written) => {
                counter!("kube_status_writes_total", 1u64);
                decode(&written)
            }
            Err(e) => Err(map_kube_error(T::KIND, &key, e)),
        }
    }
}
