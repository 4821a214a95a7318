//! How the database was deployed decides where install and up/down state
//! come from. The mode is resolved once per collection and handed to every
//! checker.

use tracing::info;

use super::fact::PodFact;
use super::gather::GatherState;
use crate::controller::meta::ADMINTOOLS_CONF;
use crate::crd::{VerticaDB, FETCH_NODE_DETAILS_WITH_HTTPS_MIN_VERSION, VERSION_ANNOTATION};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Deployment {
    /// Legacy deployment driven by admintools and admintools.conf
    Admintools { schedule_only: bool },
    /// Deployment driven by the vclusterops library through the NMA
    VClusterOps { https_node_details: bool },
}

/// Where node details are read from
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeDetailsSource {
    Vsql,
    Https,
}

impl Deployment {
    pub fn for_vdb(vdb: &VerticaDB) -> Self {
        if !vdb.uses_vcluster_ops() {
            return Deployment::Admintools {
                schedule_only: vdb.is_schedule_only(),
            };
        }
        let https_node_details = match vdb.version() {
            Some(v) => v.is_equal_or_newer(&FETCH_NODE_DETAILS_WITH_HTTPS_MIN_VERSION),
            None => {
                info!(
                    "Cannot get a usable vertica version from annotation {}, falling back to vsql for node details",
                    VERSION_ANNOTATION
                );
                false
            }
        };
        Deployment::VClusterOps { https_node_details }
    }

    pub fn uses_vcluster_ops(self) -> bool {
        matches!(self, Deployment::VClusterOps { .. })
    }

    pub fn node_details_source(self) -> NodeDetailsSource {
        match self {
            Deployment::VClusterOps {
                https_node_details: true,
            } => NodeDetailsSource::Https,
            _ => NodeDetailsSource::Vsql,
        }
    }

    /// Set the install fields of `pf`. `install_count` is the number of pods
    /// of the subcluster the status records as installed.
    pub(super) fn resolve_install(self, install_count: i32, pf: &mut PodFact, gs: &GatherState) {
        let schedule_only = match self {
            Deployment::VClusterOps { .. } => {
                // No installer step exists in this mode
                pf.is_installed = true;
                pf.has_stale_admintools_conf = false;
                pf.compat21_node_name.clear();
                return;
            }
            Deployment::Admintools { schedule_only } => schedule_only,
        };

        // The status count can lag behind the pod, so the gathered state
        // refines it when the pod is running.
        pf.is_installed = install_count > pf.pod_index;
        if !pf.is_pod_running {
            return;
        }

        if schedule_only {
            if !pf.is_installed {
                pf.is_installed = gs.file_exists(ADMINTOOLS_CONF);
            }
            // The operator didn't do the install, so the name is unknown
            pf.compat21_node_name.clear();
            return;
        }

        pf.is_installed = gs.install_indicator_exists;
        if pf.is_installed {
            pf.compat21_node_name = gs.compat21_node_name.clone();
        } else {
            pf.has_stale_admintools_conf = gs.file_exists(ADMINTOOLS_CONF);
        }
    }

    /// Up/down state of a running pod
    pub(super) fn is_up(self, pf: &PodFact, gs: &GatherState) -> bool {
        match self {
            Deployment::VClusterOps { .. } => gs.up_node,
            Deployment::Admintools { .. } => pf.db_exists && gs.vertica_pid_running,
        }
    }
}
