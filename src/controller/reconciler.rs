//! Reconciler for VerticaDB resources
//!
//! Each pass collects the pod facts of the main cluster and of every sandbox,
//! stamps pods with the Kubernetes version annotations the server reads at
//! startup, and records the up-node counts in the VerticaDB status.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::apimachinery::pkg::version::Info;
use kube::{
    api::{Api, Patch, PatchParams},
    client::Client,
    runtime::{
        controller::{Action, Controller},
        finalizer::{finalizer, Event as FinalizerEvent},
        watcher::Config,
    },
    ResourceExt,
};
use serde_json::json;
use tracing::{error, info, instrument, warn};

use super::finalizers::VERTICADB_FINALIZER;
use super::finder::{scope_subclusters, FindFlags, SubclusterFinder};
use super::meta::{
    subcluster_label, ClusterScope, NamespacedName, KUBERNETES_BUILD_DATE_ANNOTATION,
    KUBERNETES_GIT_COMMIT_ANNOTATION, KUBERNETES_VERSION_ANNOTATION, OPERATOR_NAME,
};
use super::objects::{apply_pod_annotations, KubeObjectStore, ObjectStore};
use super::password::PasswordManager;
use super::pod_runner::{KubePodRunner, PodRunner};
use super::podfacts::{gen_pod_names, PodFacts};
use crate::crd::{SubclusterStatus, VerticaDB};
use crate::error::{Error, Result};

/// Operator settings taken from the command line or the environment
#[derive(Clone, Debug)]
pub struct OperatorConfig {
    /// Namespace to watch; empty watches all namespaces
    pub namespace: String,
    pub requeue_secs: u64,
    /// Pods with at most this many bytes free on the data volume are reported
    pub low_disk_threshold: u64,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            namespace: String::new(),
            requeue_secs: 30,
            low_disk_threshold: 1024 * 1024 * 1024,
        }
    }
}

/// Shared state for the controller
pub struct ControllerState {
    pub client: Client,
    pub config: OperatorConfig,
    pub passwords: PasswordManager,
}

impl ControllerState {
    pub fn new(client: Client, config: OperatorConfig) -> Self {
        Self {
            client,
            config,
            passwords: PasswordManager::new(),
        }
    }
}

fn vdb_api(client: &Client, namespace: &str) -> Api<VerticaDB> {
    if namespace.is_empty() {
        Api::all(client.clone())
    } else {
        Api::namespaced(client.clone(), namespace)
    }
}

/// Main entry point to start the controller
pub async fn run_controller(state: Arc<ControllerState>) -> Result<()> {
    let client = state.client.clone();
    let vdbs = vdb_api(&client, &state.config.namespace);
    let statefulsets: Api<StatefulSet> = if state.config.namespace.is_empty() {
        Api::all(client.clone())
    } else {
        Api::namespaced(client.clone(), &state.config.namespace)
    };

    info!("Starting VerticaDB controller");

    // Verify CRD exists
    match vdbs.list(&Default::default()).await {
        Ok(_) => info!("VerticaDB CRD is available"),
        Err(e) => {
            error!(
                "VerticaDB CRD not found. Please install the CRD first: {:?}",
                e
            );
            return Err(Error::ConfigError("VerticaDB CRD not installed".to_string()));
        }
    }

    Controller::new(vdbs, Config::default())
        .owns::<StatefulSet>(statefulsets, Config::default())
        .shutdown_on_signal()
        .run(reconcile, error_policy, state)
        .for_each(|res| async move {
            match res {
                Ok(obj) => info!("Reconciled: {:?}", obj),
                Err(e) => error!("Reconcile error: {:?}", e),
            }
        })
        .await;

    Ok(())
}

#[instrument(skip(ctx), fields(name = %obj.name_any(), namespace = obj.namespace()))]
async fn reconcile(obj: Arc<VerticaDB>, ctx: Arc<ControllerState>) -> Result<Action> {
    let namespace = obj.namespace().unwrap_or_else(|| "default".to_string());
    let api: Api<VerticaDB> = Api::namespaced(ctx.client.clone(), &namespace);

    finalizer(&api, VERTICADB_FINALIZER, obj, |event| async {
        match event {
            FinalizerEvent::Apply(vdb) => apply_vdb(&ctx, &vdb).await,
            FinalizerEvent::Cleanup(vdb) => cleanup_vdb(&ctx, &vdb).await,
        }
    })
    .await
    .map_err(Error::from)
}

/// Pod-fact snapshots for the main cluster followed by one per sandbox
pub async fn collect_all(
    store: Arc<dyn ObjectStore>,
    runner: Arc<dyn PodRunner>,
    password: &str,
    vdb: &VerticaDB,
) -> Result<Vec<PodFacts>> {
    let mut main = PodFacts::new(store, runner, password);
    main.collect(vdb).await?;
    let mut all = Vec::with_capacity(vdb.spec.sandboxes.len() + 1);
    for sb in &vdb.spec.sandboxes {
        let mut facts = main.copy_for_sandbox(&sb.name);
        facts.collect(vdb).await?;
        all.push(facts);
    }
    all.insert(0, main);
    Ok(all)
}

/// Collect the facts of one scope of a VerticaDB without reconciling it
pub async fn collect_once(
    client: Client,
    vdb_name: &NamespacedName,
    sandbox: &str,
) -> Result<PodFacts> {
    let store: Arc<dyn ObjectStore> = Arc::new(KubeObjectStore::new(client.clone()));
    let vdb = store
        .get_vdb(vdb_name)
        .await?
        .ok_or_else(|| Error::NotFound(format!("VerticaDB {vdb_name}")))?;
    let password = PasswordManager::new().resolve(store.as_ref(), &vdb).await?;
    let runner = Arc::new(KubePodRunner::new(client, vdb.superuser_name(), password.clone()));
    let mut facts = PodFacts::for_sandbox(store, runner, &password, sandbox);
    facts.collect(&vdb).await?;
    Ok(facts)
}

#[instrument(skip(ctx, vdb), fields(name = %vdb.name_any(), namespace = vdb.namespace()))]
async fn apply_vdb(ctx: &ControllerState, vdb: &VerticaDB) -> Result<Action> {
    let store: Arc<dyn ObjectStore> = Arc::new(KubeObjectStore::new(ctx.client.clone()));
    let password = ctx.passwords.resolve(store.as_ref(), vdb).await?;
    let runner = Arc::new(KubePodRunner::new(
        ctx.client.clone(),
        vdb.superuser_name(),
        password.clone(),
    ));

    let facts = collect_all(store.clone(), runner, &password, vdb).await?;

    let version = ctx.client.apiserver_version().await?;
    let annotations = dc_table_annotations(&version);
    for pfacts in &facts {
        let updated = annotate_pods(store.as_ref(), pfacts, &annotations).await?;
        if updated > 0 {
            info!(
                scope = %pfacts.cluster_extended_name(),
                "Added Kubernetes version annotations to {} pod(s)", updated
            );
        }
        let unserved = subclusters_without_service(store.as_ref(), vdb, pfacts.scope()).await?;
        if !unserved.is_empty() {
            warn!(
                scope = %pfacts.cluster_extended_name(),
                "Subclusters without a service: {}",
                unserved.join(", ")
            );
        }
        let low = pfacts.find_pods_low_on_disk_space(ctx.config.low_disk_threshold);
        if !low.is_empty() {
            warn!(
                scope = %pfacts.cluster_extended_name(),
                "Pods low on local data disk space: {}",
                gen_pod_names(&low)
            );
        }
    }

    let refs: Vec<&PodFacts> = facts.iter().collect();
    let patch = status_patch(vdb, &refs);
    let namespace = vdb.namespace().unwrap_or_else(|| "default".to_string());
    let api: Api<VerticaDB> = Api::namespaced(ctx.client.clone(), &namespace);
    api.patch_status(
        &vdb.name_any(),
        &PatchParams::apply(OPERATOR_NAME),
        &Patch::Merge(&patch),
    )
    .await
    .map_err(Error::KubeError)?;

    Ok(Action::requeue(Duration::from_secs(ctx.config.requeue_secs)))
}

#[instrument(skip(ctx, vdb), fields(name = %vdb.name_any(), namespace = vdb.namespace()))]
async fn cleanup_vdb(ctx: &ControllerState, vdb: &VerticaDB) -> Result<Action> {
    info!("Cleaning up VerticaDB: {}", vdb.name_any());
    ctx.passwords.delete(&NamespacedName::of(vdb)).await;
    Ok(Action::await_change())
}

/// Annotations the server reads to fill in its Kubernetes data-collector
/// tables
pub fn dc_table_annotations(version: &Info) -> BTreeMap<String, String> {
    BTreeMap::from([
        (
            KUBERNETES_VERSION_ANNOTATION.to_string(),
            version.git_version.clone(),
        ),
        (
            KUBERNETES_GIT_COMMIT_ANNOTATION.to_string(),
            version.git_commit.clone(),
        ),
        (
            KUBERNETES_BUILD_DATE_ANNOTATION.to_string(),
            version.build_date.clone(),
        ),
    ])
}

/// Names of the subclusters declared in `scope` that no operator-owned
/// Service points at
pub async fn subclusters_without_service(
    store: &dyn ObjectStore,
    vdb: &VerticaDB,
    scope: &ClusterScope,
) -> Result<Vec<String>> {
    let finder = SubclusterFinder::new(store, vdb, scope.clone());
    let served: HashSet<String> = finder
        .find_services(FindFlags::IN_VDB)
        .await?
        .iter()
        .filter_map(subcluster_label)
        .collect();
    Ok(scope_subclusters(vdb, scope)
        .into_iter()
        .filter(|sc| !served.contains(&sc.name))
        .map(|sc| sc.name.clone())
        .collect())
}

/// Add `annotations` to every existing pod of the snapshot that lacks them.
/// Returns how many pods were updated.
pub async fn annotate_pods(
    store: &dyn ObjectStore,
    pfacts: &PodFacts,
    annotations: &BTreeMap<String, String>,
) -> Result<usize> {
    let mut updated = 0;
    for pf in pfacts.filter_pods(|p| p.exists() && !p.has_dc_table_annotations()) {
        if apply_pod_annotations(store, pf.name(), annotations).await? {
            updated += 1;
        }
    }
    Ok(updated)
}

/// Merge patch recording the up-node counts of every subcluster. Lists are
/// replaced wholesale by a merge patch, so the full subcluster list is sent.
pub fn status_patch(vdb: &VerticaDB, facts: &[&PodFacts]) -> serde_json::Value {
    let mut subclusters: Vec<SubclusterStatus> = vdb
        .status
        .as_ref()
        .map(|s| s.subclusters.clone())
        .unwrap_or_default();
    for sc in &vdb.spec.subclusters {
        if !subclusters.iter().any(|s| s.name == sc.name) {
            subclusters.push(SubclusterStatus {
                name: sc.name.clone(),
                ..Default::default()
            });
        }
    }
    for s in &mut subclusters {
        let up: usize = facts
            .iter()
            .map(|f| f.subcluster_up_node_count(&s.name))
            .sum();
        s.up_node_count = up as i32;
    }
    let total: usize = facts.iter().map(|f| f.up_node_count()).sum();

    json!({
        "status": {
            "subclusters": subclusters,
            "upNodeCount": total,
        }
    })
}

/// Requeue delay after a failed reconcile
pub fn retry_delay(error: &Error) -> Duration {
    if error.is_retriable() {
        Duration::from_secs(15)
    } else {
        Duration::from_secs(60)
    }
}

/// Error policy determines how to handle reconciliation errors
fn error_policy(vdb: Arc<VerticaDB>, error: &Error, _ctx: Arc<ControllerState>) -> Action {
    error!("Reconciliation error for {}: {:?}", vdb.name_any(), error);
    Action::requeue(retry_delay(error))
}
