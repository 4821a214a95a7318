//! Naming rules, labels, annotations and in-pod paths shared by the
//! controller modules.

use std::fmt;

use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use serde::Serialize;

use crate::crd::{Subcluster, VerticaDB};

// ----------------------------------------------------------------------------
// Labels and annotations
// ----------------------------------------------------------------------------

pub const SUBCLUSTER_NAME_LABEL: &str = "vertica.com/subcluster-name";
/// Older operator versions labelled objects with this key instead
pub const SUBCLUSTER_LEGACY_NAME_LABEL: &str = "vertica.com/subcluster";
pub const SUBCLUSTER_TYPE_LABEL: &str = "vertica.com/subcluster-type";
pub const SANDBOX_NAME_LABEL: &str = "vertica.com/sandbox";
pub const VDB_INSTANCE_LABEL: &str = "app.kubernetes.io/instance";
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
pub const OPERATOR_NAME: &str = "verticadb-operator";

pub const STS_NAME_OVERRIDE_ANNOTATION: &str = "vertica.com/statefulset-name-override";
pub const KUBERNETES_VERSION_ANNOTATION: &str = "vertica.com/kubernetes-version";
pub const KUBERNETES_GIT_COMMIT_ANNOTATION: &str = "vertica.com/kubernetes-git-commit";
pub const KUBERNETES_BUILD_DATE_ANNOTATION: &str = "vertica.com/kubernetes-build-date";

// ----------------------------------------------------------------------------
// Containers, ports and paths
// ----------------------------------------------------------------------------

pub const SERVER_CONTAINER: &str = "server";
pub const NMA_CONTAINER: &str = "nma";

pub const CATALOG_PATH_ENV: &str = "CATALOG_PATH";

pub const VERTICA_HTTP_PORT: u16 = 8443;
pub const HTTP_SERVER_VERSION_PATH: &str = "/v1/version";

pub const ADMINTOOLS_CONF: &str = "/opt/vertica/config/admintools.conf";
pub const EULA_ACCEPTANCE_FILE: &str = "/opt/vertica/config/d5415f948449e9d4c421b568f2411140.dat";
pub const CONFIG_LOGROTATE_PATH: &str = "/opt/vertica/config/logrotate";
pub const CONFIG_SHARE_PATH: &str = "/opt/vertica/config/share";
pub const CONFIG_LICENSING_PATH: &str = "/opt/vertica/config/licensing";
pub const HTTP_TLS_CONF_DIR: &str = "/opt/vertica/config/https_certs";
pub const CE_LICENSE_FILE: &str =
    "/opt/vertica/config/licensing/vertica_community_edition.license.key";
pub const LOGROTATE_AT_FILE: &str = "/opt/vertica/config/logrotate/admintool.logrotate";
pub const LOGROTATE_BASE_CONF_FILE: &str = "/opt/vertica/config/logrotate_base.conf";
pub const HTTP_TLS_CONF_FILE: &str = "/opt/vertica/config/https_certs/httpstls.json";
pub const STARTUP_CONF_FILE: &str = "/opt/vertica/config/startup.json";
pub const GATHER_SCRIPT_PATH: &str = "/tmp/gather_pod.sh";

/// Directories whose existence is reported by the gather script
pub const GATHERED_DIRS: [&str; 4] = [
    CONFIG_LOGROTATE_PATH,
    CONFIG_SHARE_PATH,
    CONFIG_LICENSING_PATH,
    HTTP_TLS_CONF_DIR,
];

/// Files whose existence is reported by the gather script
pub const GATHERED_FILES: [&str; 5] = [
    ADMINTOOLS_CONF,
    CE_LICENSE_FILE,
    LOGROTATE_AT_FILE,
    LOGROTATE_BASE_CONF_FILE,
    HTTP_TLS_CONF_FILE,
];

// ----------------------------------------------------------------------------
// Identities
// ----------------------------------------------------------------------------

/// Namespace + name of a Kubernetes object. The default value is the empty
/// identity, used to mean "no source pod".
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct NamespacedName {
    pub namespace: String,
    pub name: String,
}

impl NamespacedName {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.name.is_empty()
    }

    pub fn of<K: ResourceExt>(obj: &K) -> Self {
        Self::new(
            obj.namespace().unwrap_or_else(|| "default".to_string()),
            obj.name_any(),
        )
    }
}

impl fmt::Display for NamespacedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Which cluster a pod-fact snapshot or finder query covers
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum ClusterScope {
    #[default]
    Main,
    Sandbox(String),
}

impl ClusterScope {
    /// An empty name selects the main cluster
    pub fn from_sandbox(name: &str) -> Self {
        if name.is_empty() {
            ClusterScope::Main
        } else {
            ClusterScope::Sandbox(name.to_string())
        }
    }

    /// Sandbox name, empty for the main cluster
    pub fn sandbox_name(&self) -> &str {
        match self {
            ClusterScope::Main => "",
            ClusterScope::Sandbox(name) => name,
        }
    }

    pub fn is_main(&self) -> bool {
        matches!(self, ClusterScope::Main)
    }
}

impl fmt::Display for ClusterScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClusterScope::Main => write!(f, "main cluster"),
            ClusterScope::Sandbox(name) => write!(f, "sandbox {name}"),
        }
    }
}

// ----------------------------------------------------------------------------
// Naming
// ----------------------------------------------------------------------------

/// Subcluster names allow underscores; object names don't
pub fn gen_subcluster_object_name(sc_name: &str) -> String {
    sc_name.replace('_', "-").to_lowercase()
}

/// StatefulSet backing a subcluster
pub fn sts_name(vdb: &VerticaDB, sc: &Subcluster) -> String {
    if let Some(name) = sc.annotations.get(STS_NAME_OVERRIDE_ANNOTATION) {
        if !name.is_empty() {
            return name.clone();
        }
    }
    format!("{}-{}", vdb.name_any(), gen_subcluster_object_name(&sc.name))
}

pub fn pod_name(vdb: &VerticaDB, sc: &Subcluster, index: i32) -> NamespacedName {
    NamespacedName::new(
        vdb.namespace().unwrap_or_else(|| "default".to_string()),
        format!("{}-{}", sts_name(vdb, sc), index),
    )
}

/// Labels every operator-owned object of the VerticaDB carries
pub fn vdb_selector_labels(vdb: &VerticaDB) -> Vec<(String, String)> {
    vec![
        (VDB_INSTANCE_LABEL.to_string(), vdb.name_any()),
        (MANAGED_BY_LABEL.to_string(), OPERATOR_NAME.to_string()),
    ]
}

pub fn label_selector(labels: &[(String, String)]) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",")
}

/// Subcluster name of an object, accepting the legacy label key
pub fn subcluster_label<K: ResourceExt>(obj: &K) -> Option<String> {
    let labels = obj.labels();
    labels
        .get(SUBCLUSTER_NAME_LABEL)
        .or_else(|| labels.get(SUBCLUSTER_LEGACY_NAME_LABEL))
        .cloned()
}

/// Sandbox an object is labelled with; empty when in the main cluster
pub fn sandbox_label<K: ResourceExt>(obj: &K) -> String {
    obj.labels()
        .get(SANDBOX_NAME_LABEL)
        .cloned()
        .unwrap_or_default()
}

// ----------------------------------------------------------------------------
// Pod inspection
// ----------------------------------------------------------------------------

pub fn has_nma_container(pod: &Pod) -> bool {
    pod.spec
        .as_ref()
        .map(|s| s.containers.iter().any(|c| c.name == NMA_CONTAINER))
        .unwrap_or(false)
}

pub fn is_container_ready(pod: &Pod, container: &str) -> bool {
    pod.status
        .as_ref()
        .and_then(|s| s.container_statuses.as_ref())
        .map(|statuses| statuses.iter().any(|c| c.name == container && c.ready))
        .unwrap_or(false)
}

pub fn server_image(pod: &Pod) -> String {
    pod.spec
        .as_ref()
        .and_then(|s| s.containers.iter().find(|c| c.name == SERVER_CONTAINER))
        .and_then(|c| c.image.clone())
        .unwrap_or_default()
}

/// Value of an env var on the server container
pub fn server_env(pod: &Pod, env: &str) -> Option<String> {
    pod.spec
        .as_ref()?
        .containers
        .iter()
        .find(|c| c.name == SERVER_CONTAINER)?
        .env
        .as_ref()?
        .iter()
        .find(|e| e.name == env)
        .and_then(|e| e.value.clone())
}
