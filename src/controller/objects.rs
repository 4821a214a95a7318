//! Kubernetes object access used by the finder and the pod-fact engine
//!
//! Reads are expressed through the [`ObjectStore`] trait so that collection
//! logic can run against an in-memory store in tests. Lookups of objects that
//! may legitimately be absent return `Ok(None)` on a 404.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{Pod, Secret, Service};
use kube::api::{Api, ListParams, PostParams};
use kube::Client;
use tracing::{debug, warn};

use crate::controller::meta::NamespacedName;
use crate::crd::VerticaDB;
use crate::error::{Error, Result};

/// Attempts made by [`apply_pod_annotations`] before giving up on conflicts
pub const CONFLICT_RETRY_ATTEMPTS: u32 = 5;
const CONFLICT_RETRY_INITIAL_BACKOFF: Duration = Duration::from_millis(10);

#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn get_statefulset(&self, name: &NamespacedName) -> Result<Option<StatefulSet>>;
    async fn get_pod(&self, name: &NamespacedName) -> Result<Option<Pod>>;
    async fn get_vdb(&self, name: &NamespacedName) -> Result<Option<VerticaDB>>;
    async fn get_secret(&self, name: &NamespacedName) -> Result<Option<Secret>>;

    async fn list_statefulsets(&self, namespace: &str, selector: &str)
        -> Result<Vec<StatefulSet>>;
    async fn list_pods(&self, namespace: &str, selector: &str) -> Result<Vec<Pod>>;
    async fn list_services(&self, namespace: &str, selector: &str) -> Result<Vec<Service>>;

    /// Replace a pod object. Fails with a 409 if the resource version is stale.
    async fn replace_pod(&self, pod: &Pod) -> Result<Pod>;
}

/// [`ObjectStore`] talking to the API server
#[derive(Clone)]
pub struct KubeObjectStore {
    client: Client,
}

impl KubeObjectStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

fn not_found_as_none<T>(res: std::result::Result<T, kube::Error>) -> Result<Option<T>> {
    match res {
        Ok(obj) => Ok(Some(obj)),
        Err(kube::Error::Api(e)) if e.code == 404 => Ok(None),
        Err(e) => Err(Error::KubeError(e)),
    }
}

#[async_trait]
impl ObjectStore for KubeObjectStore {
    async fn get_statefulset(&self, name: &NamespacedName) -> Result<Option<StatefulSet>> {
        let api: Api<StatefulSet> = Api::namespaced(self.client.clone(), &name.namespace);
        not_found_as_none(api.get(&name.name).await)
    }

    async fn get_pod(&self, name: &NamespacedName) -> Result<Option<Pod>> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), &name.namespace);
        not_found_as_none(api.get(&name.name).await)
    }

    async fn get_vdb(&self, name: &NamespacedName) -> Result<Option<VerticaDB>> {
        let api: Api<VerticaDB> = Api::namespaced(self.client.clone(), &name.namespace);
        not_found_as_none(api.get(&name.name).await)
    }

    async fn get_secret(&self, name: &NamespacedName) -> Result<Option<Secret>> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), &name.namespace);
        not_found_as_none(api.get(&name.name).await)
    }

    async fn list_statefulsets(
        &self,
        namespace: &str,
        selector: &str,
    ) -> Result<Vec<StatefulSet>> {
        let api: Api<StatefulSet> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.list(&ListParams::default().labels(selector)).await?.items)
    }

    async fn list_pods(&self, namespace: &str, selector: &str) -> Result<Vec<Pod>> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.list(&ListParams::default().labels(selector)).await?.items)
    }

    async fn list_services(&self, namespace: &str, selector: &str) -> Result<Vec<Service>> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.list(&ListParams::default().labels(selector)).await?.items)
    }

    async fn replace_pod(&self, pod: &Pod) -> Result<Pod> {
        let name = NamespacedName::of(pod);
        let api: Api<Pod> = Api::namespaced(self.client.clone(), &name.namespace);
        Ok(api.replace(&name.name, &PostParams::default(), pod).await?)
    }
}

/// Merge `annotations` into a pod's metadata.
///
/// Does a get/merge/replace cycle, retrying on a 409 conflict with an
/// exponential backoff. A pod that no longer exists is skipped. Returns true
/// when the pod was updated.
pub async fn apply_pod_annotations(
    store: &dyn ObjectStore,
    pod_name: &NamespacedName,
    annotations: &BTreeMap<String, String>,
) -> Result<bool> {
    let mut backoff = CONFLICT_RETRY_INITIAL_BACKOFF;
    let mut attempt = 1;
    loop {
        let Some(mut pod) = store.get_pod(pod_name).await? else {
            debug!("Pod {} is gone, skipping annotation update", pod_name);
            return Ok(false);
        };

        let current = pod.metadata.annotations.get_or_insert_with(BTreeMap::new);
        let mut changed = false;
        for (k, v) in annotations {
            if current.get(k) != Some(v) {
                current.insert(k.clone(), v.clone());
                changed = true;
            }
        }
        if !changed {
            return Ok(false);
        }

        match store.replace_pod(&pod).await {
            Ok(_) => return Ok(true),
            Err(e) if e.is_conflict() && attempt < CONFLICT_RETRY_ATTEMPTS => {
                warn!(
                    "Conflict updating annotations on pod {} (attempt {}), retrying",
                    pod_name, attempt
                );
                tokio::time::sleep(backoff).await;
                backoff *= 2;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
