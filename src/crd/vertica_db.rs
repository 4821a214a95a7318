//! VerticaDB Custom Resource Definition
//!
//! A VerticaDB describes one Vertica database: its subclusters, optional
//! sandboxes and the in-pod storage layout. The operator records what it has
//! observed about each pod in the status.

use std::collections::HashMap;

use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{
    InitPolicy, LocalStorage, Sandbox, SandboxStatus, Subcluster, SubclusterStatus,
    VerticaVersion,
};

/// Annotation set to "true" when the database is deployed with vclusterops
/// (the HTTPS/NMA based deployment) instead of admintools
pub const VCLUSTER_OPS_ANNOTATION: &str = "vertica.com/vcluster-ops";

/// Annotation holding the server version reported by the image
pub const VERSION_ANNOTATION: &str = "vertica.com/version";

/// Annotation overriding the superuser name
pub const SUPERUSER_NAME_ANNOTATION: &str = "vertica.com/superuser-name";

pub const DEFAULT_SUPERUSER: &str = "dbadmin";

/// Prefix of the file written after a successful install. The VerticaDB UID
/// is appended so that a reused PV from another database is not mistaken for
/// an installed pod.
pub const INSTALLER_INDICATOR_FILE_PREFIX: &str = "/opt/vertica/config/install-indicator-";

#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "vertica.com",
    version = "v1",
    kind = "VerticaDB",
    namespaced,
    status = "VerticaDBStatus",
    shortname = "vdb",
    printcolumn = r#"{"name":"Database","type":"string","jsonPath":".spec.dbName"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct VerticaDBSpec {
    #[serde(default = "default_db_name")]
    pub db_name: String,

    #[serde(default)]
    pub init_policy: InitPolicy,

    /// Server image used by all subclusters not in a sandbox
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub image: String,

    #[serde(default)]
    pub local: LocalStorage,

    /// Number of shards in an Eon Mode database; 0 for Enterprise Mode
    #[serde(default)]
    pub shard_count: i32,

    #[serde(default)]
    pub subclusters: Vec<Subcluster>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sandboxes: Vec<Sandbox>,

    /// Secret holding the superuser password under the `password` key
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub password_secret: String,
}

fn default_db_name() -> String {
    "vertdb".to_string()
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct VerticaDBStatus {
    #[serde(default)]
    pub subclusters: Vec<SubclusterStatus>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sandboxes: Vec<SandboxStatus>,

    #[serde(default)]
    pub up_node_count: i32,
}

impl VerticaDB {
    /// Catalog directory inside the server container
    pub fn catalog_path(&self) -> &str {
        self.spec.local.catalog_path()
    }

    pub fn installer_indicator_file(&self) -> String {
        format!(
            "{INSTALLER_INDICATOR_FILE_PREFIX}{}",
            self.uid().unwrap_or_default()
        )
    }

    pub fn uses_vcluster_ops(&self) -> bool {
        self.annotations()
            .get(VCLUSTER_OPS_ANNOTATION)
            .map(|v| v.eq_ignore_ascii_case("true"))
            .unwrap_or(false)
    }

    /// Server version from the version annotation; `None` until the operator
    /// has inspected the image
    pub fn version(&self) -> Option<VerticaVersion> {
        self.annotations()
            .get(VERSION_ANNOTATION)
            .and_then(|v| VerticaVersion::parse(v))
    }

    pub fn superuser_name(&self) -> String {
        self.annotations()
            .get(SUPERUSER_NAME_ANNOTATION)
            .filter(|s| !s.is_empty())
            .cloned()
            .unwrap_or_else(|| DEFAULT_SUPERUSER.to_string())
    }

    pub fn is_eon(&self) -> bool {
        self.spec.shard_count > 0
    }

    pub fn is_schedule_only(&self) -> bool {
        self.spec.init_policy == InitPolicy::ScheduleOnly
    }

    pub fn find_subcluster_status(&self, sc_name: &str) -> Option<&SubclusterStatus> {
        self.status
            .as_ref()?
            .subclusters
            .iter()
            .find(|s| s.name == sc_name)
    }

    /// Install count recorded in status for a subcluster; 0 if unknown
    pub fn install_count(&self, sc_name: &str) -> i32 {
        self.find_subcluster_status(sc_name)
            .map(|s| s.install_count())
            .unwrap_or(0)
    }

    pub fn subcluster(&self, sc_name: &str) -> Option<&Subcluster> {
        self.spec.subclusters.iter().find(|s| s.name == sc_name)
    }

    pub fn sandbox(&self, name: &str) -> Option<&Sandbox> {
        self.spec.sandboxes.iter().find(|s| s.name == name)
    }

    /// Name of the sandbox the spec places the subcluster in, if any
    pub fn sandbox_for_subcluster(&self, sc_name: &str) -> Option<&str> {
        self.spec
            .sandboxes
            .iter()
            .find(|sb| sb.subclusters.iter().any(|s| s.name == sc_name))
            .map(|sb| sb.name.as_str())
    }

    /// Subcluster name -> sandbox name, as recorded in status
    pub fn subcluster_sandbox_status_map(&self) -> HashMap<String, String> {
        let mut map = HashMap::new();
        if let Some(status) = &self.status {
            for sb in &status.sandboxes {
                for sc in &sb.subclusters {
                    map.insert(sc.clone(), sb.name.clone());
                }
            }
        }
        map
    }

    /// Image used by pods of the given scope. Sandboxes without their own
    /// image fall back to the main cluster image.
    pub fn image_for_sandbox(&self, sandbox: &str) -> &str {
        if sandbox.is_empty() {
            return &self.spec.image;
        }
        match self.sandbox(sandbox) {
            Some(sb) if !sb.image.is_empty() => &sb.image,
            _ => &self.spec.image,
        }
    }
}
