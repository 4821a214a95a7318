//! The PodFact record and the PodFacts snapshot that owns them

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::Serialize;

use super::gather::GatherState;
use crate::controller::meta::{ClusterScope, NamespacedName};
use crate::controller::objects::ObjectStore;
use crate::controller::pod_runner::PodRunner;
use crate::crd::VerticaDB;
use crate::error::Result;

/// Final pass over each collected fact. Runs after every other checker, so
/// whatever it sets wins.
pub type OverrideFn =
    Arc<dyn Fn(&VerticaDB, &mut PodFact, &GatherState) -> Result<()> + Send + Sync>;

/// What is known about one pod slot of a subcluster. The pod itself may not
/// exist yet.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PodFact {
    // Identity
    pub(super) name: NamespacedName,
    pub(super) pod_index: i32,
    pub(super) subcluster_name: String,
    pub(super) subcluster_oid: String,
    pub(super) sandbox: String,
    pub(super) dns_name: String,
    pub(super) pod_ip: String,
    pub(super) creation_timestamp: String,

    // Lifecycle
    pub(super) exists: bool,
    pub(super) is_pod_running: bool,
    pub(super) is_terminating: bool,
    pub(super) is_pending_delete: bool,
    pub(super) managed_by_parent: bool,
    pub(super) is_primary: bool,
    pub(super) is_transient: bool,

    // Install and database state
    pub(super) is_installed: bool,
    pub(super) has_stale_admintools_conf: bool,
    pub(super) db_exists: bool,
    pub(super) vnode_name: String,
    pub(super) compat21_node_name: String,
    pub(super) eula_accepted: bool,
    pub(super) dir_exists: BTreeMap<String, bool>,
    pub(super) file_exists: BTreeMap<String, bool>,
    pub(super) admintools_exists: bool,

    // Runtime state
    pub(super) up_node: bool,
    pub(super) read_only: bool,
    pub(super) startup_in_progress: bool,
    pub(super) shard_subscriptions: i32,
    pub(super) max_depot_size: u64,
    pub(super) depot_disk_percent_size: String,
    pub(super) local_data_size: u64,
    pub(super) local_data_avail: u64,
    pub(super) image: String,
    pub(super) catalog_path: String,
    pub(super) shutdown: bool,
    #[serde(rename = "hasDCTableAnnotations")]
    pub(super) has_dc_table_annotations: bool,
    #[serde(rename = "hasNMASidecar")]
    pub(super) has_nma_sidecar: bool,
    #[serde(rename = "isNMAContainerReady")]
    pub(super) is_nma_container_ready: bool,
    pub(super) exec_container_name: String,
}

impl PodFact {
    pub fn name(&self) -> &NamespacedName {
        &self.name
    }

    pub fn pod_index(&self) -> i32 {
        self.pod_index
    }

    pub fn subcluster_name(&self) -> &str {
        &self.subcluster_name
    }

    pub fn subcluster_oid(&self) -> &str {
        &self.subcluster_oid
    }

    /// Sandbox the node belongs to; empty for the main cluster
    pub fn sandbox(&self) -> &str {
        &self.sandbox
    }

    pub fn dns_name(&self) -> &str {
        &self.dns_name
    }

    pub fn pod_ip(&self) -> &str {
        &self.pod_ip
    }

    pub fn exists(&self) -> bool {
        self.exists
    }

    pub fn is_pod_running(&self) -> bool {
        self.is_pod_running
    }

    pub fn is_pending_delete(&self) -> bool {
        self.is_pending_delete
    }

    pub fn is_primary(&self) -> bool {
        self.is_primary
    }

    pub fn is_installed(&self) -> bool {
        self.is_installed
    }

    /// admintools.conf is present without the install indicator
    pub fn has_stale_admintools_conf(&self) -> bool {
        self.has_stale_admintools_conf
    }

    pub fn db_exists(&self) -> bool {
        self.db_exists
    }

    pub fn vnode_name(&self) -> &str {
        &self.vnode_name
    }

    pub fn compat21_node_name(&self) -> &str {
        &self.compat21_node_name
    }

    pub fn up_node(&self) -> bool {
        self.up_node
    }

    pub fn read_only(&self) -> bool {
        self.read_only
    }

    pub fn startup_in_progress(&self) -> bool {
        self.startup_in_progress
    }

    pub fn image(&self) -> &str {
        &self.image
    }

    pub fn shutdown(&self) -> bool {
        self.shutdown
    }

    pub fn has_dc_table_annotations(&self) -> bool {
        self.has_dc_table_annotations
    }

    pub fn local_data_avail(&self) -> u64 {
        self.local_data_avail
    }

    pub fn exec_container_name(&self) -> &str {
        &self.exec_container_name
    }

    // Setters for override hooks

    pub fn set_up_node(&mut self, up: bool) {
        self.up_node = up;
    }

    pub fn set_read_only(&mut self, read_only: bool) {
        self.read_only = read_only;
    }

    pub fn set_db_exists(&mut self, exists: bool) {
        self.db_exists = exists;
    }

    pub fn set_is_installed(&mut self, installed: bool) {
        self.is_installed = installed;
    }

    pub fn set_image(&mut self, image: impl Into<String>) {
        self.image = image.into();
    }

    pub fn set_shutdown(&mut self, shutdown: bool) {
        self.shutdown = shutdown;
    }

    pub fn set_has_dc_table_annotations(&mut self, has: bool) {
        self.has_dc_table_annotations = has;
    }
}

/// Snapshot of the pod facts for one cluster scope.
///
/// A snapshot is owned by a single reconcile and is never shared. It starts
/// stale; [`PodFacts::collect`] rebuilds it in full and is a no-op until
/// [`PodFacts::invalidate`] marks it stale again.
pub struct PodFacts {
    pub(super) store: Arc<dyn ObjectStore>,
    pub(super) runner: Arc<dyn PodRunner>,
    pub(super) password: String,
    pub(super) scope: ClusterScope,
    pub(super) needs_collection: bool,
    pub(super) vdb_resource_version: String,
    pub(super) detail: BTreeMap<NamespacedName, PodFact>,
    pub(super) override_fn: Option<OverrideFn>,
}

impl PodFacts {
    /// Snapshot of the main cluster
    pub fn new(store: Arc<dyn ObjectStore>, runner: Arc<dyn PodRunner>, password: &str) -> Self {
        Self::for_sandbox(store, runner, password, "")
    }

    /// Snapshot of a sandbox; an empty name selects the main cluster
    pub fn for_sandbox(
        store: Arc<dyn ObjectStore>,
        runner: Arc<dyn PodRunner>,
        password: &str,
        sandbox: &str,
    ) -> Self {
        Self {
            store,
            runner,
            password: password.to_string(),
            scope: ClusterScope::from_sandbox(sandbox),
            needs_collection: true,
            vdb_resource_version: String::new(),
            detail: BTreeMap::new(),
            override_fn: None,
        }
    }

    /// Empty, stale snapshot for another scope sharing this one's clients,
    /// password and override hook
    pub fn copy_for_sandbox(&self, sandbox: &str) -> Self {
        Self {
            store: Arc::clone(&self.store),
            runner: Arc::clone(&self.runner),
            password: self.password.clone(),
            scope: ClusterScope::from_sandbox(sandbox),
            needs_collection: true,
            vdb_resource_version: self.vdb_resource_version.clone(),
            detail: BTreeMap::new(),
            override_fn: self.override_fn.clone(),
        }
    }

    pub fn with_override(mut self, f: OverrideFn) -> Self {
        self.override_fn = Some(f);
        self
    }

    pub fn scope(&self) -> &ClusterScope {
        &self.scope
    }

    pub fn sandbox_name(&self) -> &str {
        self.scope.sandbox_name()
    }

    /// "main cluster" or "sandbox <name>", for messages
    pub fn cluster_extended_name(&self) -> String {
        self.scope.to_string()
    }

    pub fn needs_collection(&self) -> bool {
        self.needs_collection
    }

    /// Resource version of the VerticaDB the snapshot was collected from
    pub fn vdb_resource_version(&self) -> &str {
        &self.vdb_resource_version
    }

    pub fn get(&self, name: &NamespacedName) -> Option<&PodFact> {
        self.detail.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &PodFact> {
        self.detail.values()
    }

    pub fn len(&self) -> usize {
        self.detail.len()
    }

    pub fn is_empty(&self) -> bool {
        self.detail.is_empty()
    }
}

impl fmt::Debug for PodFacts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PodFacts")
            .field("scope", &self.scope)
            .field("needs_collection", &self.needs_collection)
            .field("vdb_resource_version", &self.vdb_resource_version)
            .field("detail", &self.detail)
            .finish()
    }
}
