//! Shared types for the VerticaDB specification and status
//!
//! These types are used by the CRD definition and by the pod-fact engine.
//!
//! # Type Hierarchy
//!
//! - [`Subcluster`] - A group of pods managed by one StatefulSet
//! - [`Sandbox`] - A named, isolated set of subclusters split off the main cluster
//! - [`LocalStorage`] - In-pod paths for catalog and data
//! - [`SubclusterStatus`] / [`VerticaDBPodStatus`] - Per-subcluster and per-pod status
//! - [`VerticaVersion`] - Parsed `vMAJOR.MINOR.PATCH` server version

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// How the database is brought up the first time
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub enum InitPolicy {
    /// Create a new database
    #[default]
    Create,
    /// Revive a database from communal storage
    Revive,
    /// Only schedule the pods; the database is managed outside the operator
    ScheduleOnly,
}

impl fmt::Display for InitPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InitPolicy::Create => write!(f, "Create"),
            InitPolicy::Revive => write!(f, "Revive"),
            InitPolicy::ScheduleOnly => write!(f, "ScheduleOnly"),
        }
    }
}

/// Role of a subcluster
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum SubclusterType {
    #[default]
    Primary,
    Secondary,
    /// Short-lived subcluster used during online upgrade
    Transient,
    /// Primary subcluster of a sandbox
    SandboxPrimary,
}

/// In-pod storage locations
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LocalStorage {
    #[serde(default = "default_data_path")]
    pub data_path: String,

    /// Defaults to `data_path` when empty
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub catalog_path: String,

    #[serde(default = "default_depot_path")]
    pub depot_path: String,
}

fn default_data_path() -> String {
    "/data".to_string()
}

fn default_depot_path() -> String {
    "/depot".to_string()
}

impl Default for LocalStorage {
    fn default() -> Self {
        Self {
            data_path: default_data_path(),
            catalog_path: String::new(),
            depot_path: default_depot_path(),
        }
    }
}

impl LocalStorage {
    pub fn catalog_path(&self) -> &str {
        if self.catalog_path.is_empty() {
            &self.data_path
        } else {
            &self.catalog_path
        }
    }
}

/// A subcluster declared in the VerticaDB spec
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Subcluster {
    pub name: String,

    #[serde(default)]
    pub size: i32,

    #[serde(default, rename = "type")]
    pub sc_type: SubclusterType,

    /// Set when the subcluster should be stopped and kept down
    #[serde(default)]
    pub shutdown: bool,

    /// Annotations copied onto the StatefulSet; also used to carry the
    /// StatefulSet name override
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

impl Subcluster {
    pub fn new(name: impl Into<String>, size: i32, sc_type: SubclusterType) -> Self {
        Self {
            name: name.into(),
            size,
            sc_type,
            ..Default::default()
        }
    }

    pub fn is_primary(&self) -> bool {
        matches!(
            self.sc_type,
            SubclusterType::Primary | SubclusterType::SandboxPrimary
        )
    }

    pub fn is_secondary(&self) -> bool {
        self.sc_type == SubclusterType::Secondary
    }

    pub fn is_transient(&self) -> bool {
        self.sc_type == SubclusterType::Transient
    }
}

/// Reference to a subcluster from a sandbox definition
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct SandboxSubcluster {
    pub name: String,
}

/// A sandbox: a named subset of subclusters running as its own cluster
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Sandbox {
    pub name: String,

    /// Image for the sandbox; defaults to the main cluster image
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub image: String,

    #[serde(default)]
    pub subclusters: Vec<SandboxSubcluster>,
}

/// Per-pod status recorded by the operator
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct VerticaDBPodStatus {
    #[serde(default)]
    pub installed: bool,

    #[serde(default, rename = "addedToDB")]
    pub added_to_db: bool,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub vnode_name: String,

    #[serde(default)]
    pub up_node: bool,
}

/// Per-subcluster status
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SubclusterStatus {
    pub name: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub oid: String,

    #[serde(default)]
    pub installed_count: i32,

    #[serde(default, rename = "addedToDBCount")]
    pub added_to_db_count: i32,

    #[serde(default)]
    pub up_node_count: i32,

    #[serde(default)]
    pub shutdown: bool,

    #[serde(default)]
    pub detail: Vec<VerticaDBPodStatus>,
}

impl SubclusterStatus {
    /// Pods counted as installed, taken from the per-pod detail when present
    pub fn install_count(&self) -> i32 {
        if self.detail.is_empty() {
            return self.installed_count;
        }
        self.detail.iter().filter(|d| d.installed).count() as i32
    }
}

/// Per-sandbox status
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SandboxStatus {
    pub name: String,

    /// Subclusters that are currently part of the sandbox
    #[serde(default)]
    pub subclusters: Vec<String>,
}

/// A parsed server version of the form `vMAJOR.MINOR.PATCH`
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct VerticaVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl VerticaVersion {
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// Parse `v24.3.0`, `24.3.0` or `v24.3.0-1`. Anything after a dash is
    /// ignored.
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim();
        let s = s.strip_prefix('v').unwrap_or(s);
        let core = s.split('-').next()?;
        let mut parts = core.split('.');
        let major = parts.next()?.parse().ok()?;
        let minor = parts.next()?.parse().ok()?;
        let patch = parts.next()?.parse().ok()?;
        if parts.next().is_some() {
            return None;
        }
        Some(Self::new(major, minor, patch))
    }

    pub fn is_equal_or_newer(&self, other: &VerticaVersion) -> bool {
        self >= other
    }
}

impl PartialOrd for VerticaVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for VerticaVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.major, self.minor, self.patch).cmp(&(other.major, other.minor, other.patch))
    }
}

impl fmt::Display for VerticaVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// First version whose HTTPS service exposes the node details used for
/// enrichment
pub const FETCH_NODE_DETAILS_WITH_HTTPS_MIN_VERSION: VerticaVersion =
    VerticaVersion::new(24, 3, 0);

/// First version reporting the read-only node state
pub const NODES_HAVE_READ_ONLY_STATE_VERSION: VerticaVersion = VerticaVersion::new(11, 0, 2);

/// First version reporting the sandbox a node belongs to
pub const NODES_HAVE_SANDBOX_STATE_VERSION: VerticaVersion = VerticaVersion::new(12, 0, 4);
