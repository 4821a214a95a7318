//! Finds the operator-owned objects and subclusters of a VerticaDB
//!
//! All queries are scoped to one cluster: the main cluster (objects without a
//! sandbox label, subclusters not assigned to a sandbox) or a named sandbox.
//! Objects missing the subcluster-name label are never returned.

use std::collections::{BTreeMap, HashSet};
use std::ops::BitOr;

use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{Pod, Service};
use kube::ResourceExt;
use tracing::debug;

use crate::controller::meta::{
    label_selector, sandbox_label, subcluster_label, vdb_selector_labels, ClusterScope,
    STS_NAME_OVERRIDE_ANNOTATION, SUBCLUSTER_TYPE_LABEL,
};
use crate::controller::objects::ObjectStore;
use crate::crd::{Subcluster, SubclusterType, VerticaDB};
use crate::error::Result;

/// Selects which objects a find call returns
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FindFlags(u8);

impl FindFlags {
    /// Objects whose subcluster is declared in the spec
    pub const IN_VDB: FindFlags = FindFlags(1);
    /// Objects whose subcluster is no longer declared in the spec
    pub const NOT_IN_VDB: FindFlags = FindFlags(1 << 1);
    /// Every object that exists, declared or not
    pub const EXISTING: FindFlags = FindFlags(1 << 2);
    /// Sort the result by name
    pub const SORTED: FindFlags = FindFlags(1 << 3);
    pub const ALL: FindFlags = FindFlags(Self::IN_VDB.0 | Self::NOT_IN_VDB.0);

    pub fn contains(self, other: FindFlags) -> bool {
        self.0 & other.0 == other.0
    }

    fn intersects(self, other: FindFlags) -> bool {
        self.0 & other.0 != 0
    }

    fn without(self, other: FindFlags) -> FindFlags {
        FindFlags(self.0 & !other.0)
    }
}

impl BitOr for FindFlags {
    type Output = FindFlags;

    fn bitor(self, rhs: FindFlags) -> FindFlags {
        FindFlags(self.0 | rhs.0)
    }
}

pub struct SubclusterFinder<'a> {
    store: &'a dyn ObjectStore,
    vdb: &'a VerticaDB,
    scope: ClusterScope,
    /// Spec subclusters that belong to `scope`
    declared: Vec<&'a Subcluster>,
}

impl<'a> SubclusterFinder<'a> {
    pub fn new(store: &'a dyn ObjectStore, vdb: &'a VerticaDB, scope: ClusterScope) -> Self {
        let declared = scope_subclusters(vdb, &scope);
        Self {
            store,
            vdb,
            scope,
            declared,
        }
    }

    fn namespace(&self) -> String {
        self.vdb
            .namespace()
            .unwrap_or_else(|| "default".to_string())
    }

    fn selector(&self) -> String {
        label_selector(&vdb_selector_labels(self.vdb))
    }

    fn is_declared(&self, sc_name: &str) -> bool {
        self.declared.iter().any(|sc| sc.name == sc_name)
    }

    /// Applies the scope and flag filters to one object
    fn keep<K: ResourceExt>(&self, obj: &K, flags: FindFlags) -> bool {
        let Some(sc_name) = subcluster_label(obj) else {
            return false;
        };
        if sandbox_label(obj) != self.scope.sandbox_name() {
            return false;
        }
        if flags.contains(FindFlags::EXISTING) {
            return true;
        }
        let declared = self.is_declared(&sc_name);
        (flags.contains(FindFlags::IN_VDB) && declared)
            || (flags.contains(FindFlags::NOT_IN_VDB) && !declared)
    }

    fn filter_sorted<K: ResourceExt>(&self, objs: Vec<K>, flags: FindFlags) -> Vec<K> {
        let mut kept: Vec<K> = objs.into_iter().filter(|o| self.keep(o, flags)).collect();
        if flags.contains(FindFlags::SORTED) {
            kept.sort_by_key(|o| o.name_any());
        }
        kept
    }

    pub async fn find_statefulsets(&self, flags: FindFlags) -> Result<Vec<StatefulSet>> {
        let objs = self
            .store
            .list_statefulsets(&self.namespace(), &self.selector())
            .await?;
        Ok(self.filter_sorted(objs, flags))
    }

    pub async fn find_pods(&self, flags: FindFlags) -> Result<Vec<Pod>> {
        let objs = self
            .store
            .list_pods(&self.namespace(), &self.selector())
            .await?;
        Ok(self.filter_sorted(objs, flags))
    }

    pub async fn find_services(&self, flags: FindFlags) -> Result<Vec<Service>> {
        let objs = self
            .store
            .list_services(&self.namespace(), &self.selector())
            .await?;
        Ok(self.filter_sorted(objs, flags))
    }

    /// Subclusters of the scope. Those found only through an existing
    /// StatefulSet are returned as size-zero stubs that keep the
    /// StatefulSet's name.
    pub async fn find_subclusters(&self, flags: FindFlags) -> Result<Vec<Subcluster>> {
        let mut subclusters: Vec<Subcluster> = Vec::new();
        if flags.contains(FindFlags::IN_VDB) {
            subclusters.extend(self.declared.iter().map(|sc| (*sc).clone()));
        }

        if flags.intersects(FindFlags::NOT_IN_VDB | FindFlags::EXISTING) {
            let sts_list = self
                .find_statefulsets(flags.without(FindFlags::IN_VDB).without(FindFlags::SORTED))
                .await?;
            let mut seen: HashSet<String> = subclusters.iter().map(|s| s.name.clone()).collect();
            for sts in &sts_list {
                let Some(sc_name) = subcluster_label(sts) else {
                    continue;
                };
                if !seen.insert(sc_name.clone()) {
                    continue;
                }
                debug!(
                    "Found subcluster {} through statefulset {} only",
                    sc_name,
                    sts.name_any()
                );
                subclusters.push(stub_subcluster(sts, sc_name));
            }
        }

        if flags.contains(FindFlags::SORTED) {
            subclusters.sort_by(|a, b| a.name.cmp(&b.name));
        }
        Ok(subclusters)
    }
}

fn stub_subcluster(sts: &StatefulSet, sc_name: String) -> Subcluster {
    let sc_type = match sts.labels().get(SUBCLUSTER_TYPE_LABEL).map(String::as_str) {
        Some("primary") => SubclusterType::Primary,
        Some("sandboxprimary") => SubclusterType::SandboxPrimary,
        Some("transient") => SubclusterType::Transient,
        _ => SubclusterType::Secondary,
    };
    Subcluster {
        name: sc_name,
        size: 0,
        sc_type,
        shutdown: false,
        annotations: BTreeMap::from([(STS_NAME_OVERRIDE_ANNOTATION.to_string(), sts.name_any())]),
    }
}

/// Spec subclusters that belong to the given scope
pub fn scope_subclusters<'a>(vdb: &'a VerticaDB, scope: &ClusterScope) -> Vec<&'a Subcluster> {
    match scope {
        ClusterScope::Main => vdb
            .spec
            .subclusters
            .iter()
            .filter(|sc| vdb.sandbox_for_subcluster(&sc.name).is_none())
            .collect(),
        ClusterScope::Sandbox(name) => {
            let Some(sandbox) = vdb.sandbox(name) else {
                return Vec::new();
            };
            vdb.spec
                .subclusters
                .iter()
                .filter(|sc| sandbox.subclusters.iter().any(|s| s.name == sc.name))
                .collect()
        }
    }
}
