//! Read-only queries over a collected snapshot

use std::collections::{BTreeMap, HashMap, HashSet};

use tracing::{error, info};

use super::fact::{PodFact, PodFacts};
use crate::controller::meta::{NamespacedName, SERVER_CONTAINER, STARTUP_CONF_FILE};
use crate::crd::VerticaDB;
use crate::error::{Error, Result};

/// How [`PodFacts::find_re_ip_pods`] treats the database state of a pod
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DbCheck {
    OnlyWithDbs,
    OnlyWithoutDbs,
    Any,
}

impl PodFacts {
    /// Pods matching `filter`, ordered by vnode name
    pub fn filter_pods<F>(&self, filter: F) -> Vec<&PodFact>
    where
        F: Fn(&PodFact) -> bool,
    {
        let mut pods: Vec<&PodFact> = self.detail.values().filter(|p| filter(*p)).collect();
        pods.sort_by(|a, b| a.vnode_name.cmp(&b.vnode_name));
        pods
    }

    /// First pod matching `filter` in DNS name order
    pub fn find_first_pod_sorted<F>(&self, filter: F) -> Option<&PodFact>
    where
        F: Fn(&PodFact) -> bool,
    {
        self.filter_pods(filter)
            .into_iter()
            .min_by(|a, b| a.dns_name.cmp(&b.dns_name))
    }

    fn count_pods<F>(&self, pred: F) -> usize
    where
        F: Fn(&PodFact) -> bool,
    {
        self.detail.values().filter(|p| pred(*p)).count()
    }

    /// False only when no primary pod has a catalog. Secondaries may not
    /// have pulled the catalog yet, so they are not trusted either way.
    pub fn does_db_exist(&self) -> bool {
        self.detail.values().any(|p| p.is_primary && p.db_exists)
    }

    /// First up pod, optionally restricted to one subcluster (empty name
    /// means any) and to writable nodes
    pub fn find_first_up_pod(&self, allow_read_only: bool, sc_name: &str) -> Option<&PodFact> {
        self.find_first_pod_sorted(|p| {
            (sc_name.is_empty() || p.subcluster_name == sc_name)
                && p.up_node
                && (allow_read_only || !p.read_only)
        })
    }

    pub fn find_first_up_pod_ip(&self, allow_read_only: bool, sc_name: &str) -> Option<String> {
        self.find_first_up_pod(allow_read_only, sc_name)
            .map(|p| p.pod_ip.clone())
    }

    /// Pod to exec an administrative command in. Preference: up and
    /// writable and staying, then up and writable, then up, then any
    /// running pod with an install.
    pub fn find_pod_to_run_admin_cmd_any(&self) -> Option<&PodFact> {
        self.find_first_pod_sorted(|p| p.up_node && !p.read_only && !p.is_pending_delete)
            .or_else(|| self.find_first_pod_sorted(|p| p.up_node && !p.read_only))
            .or_else(|| self.find_first_pod_sorted(|p| p.up_node))
            .or_else(|| self.find_first_pod_sorted(|p| p.is_installed && p.is_pod_running))
    }

    /// Pod to run a command that needs the database down on that node
    pub fn find_pod_to_run_admin_cmd_offline(&self) -> Option<&PodFact> {
        self.detail
            .values()
            .find(|p| p.is_installed && p.is_pod_running && !p.up_node)
    }

    pub fn find_running_pod(&self) -> Option<&PodFact> {
        self.detail.values().find(|p| p.is_pod_running)
    }

    /// Pods that need a restart.
    ///
    /// Read-only nodes lost quorum and may be restarted when
    /// `restart_read_only` is set. Pending-delete pods are excluded unless
    /// asked for, since they may already be out of the database. Shut down
    /// subclusters are never restarted.
    pub fn find_restartable_pods(
        &self,
        restart_read_only: bool,
        restart_transient: bool,
        restart_pending_delete: bool,
    ) -> Vec<&PodFact> {
        self.filter_pods(|p| {
            if (!restart_transient && p.is_transient) || p.shutdown {
                return false;
            }
            (!p.up_node || (restart_read_only && p.read_only))
                && p.db_exists
                && p.is_pod_running
                && p.has_dc_table_annotations
                && (restart_pending_delete || !p.is_pending_delete)
        })
    }

    pub fn find_installed_pods(&self) -> Vec<&PodFact> {
        self.filter_pods(|p| p.is_installed && p.is_pod_running)
    }

    /// Running, installed pods whose IP may need refreshing in the catalog.
    /// Pods with an NMA sidecar wait until the sidecar is ready.
    pub fn find_re_ip_pods(&self, chk: DbCheck) -> Vec<&PodFact> {
        self.filter_pods(|p| {
            if !p.exists || !p.is_pod_running || !p.is_installed {
                return false;
            }
            if p.has_nma_sidecar && !p.is_nma_container_ready {
                return false;
            }
            match chk {
                DbCheck::OnlyWithDbs => p.db_exists,
                DbCheck::OnlyWithoutDbs => !p.db_exists,
                DbCheck::Any => true,
            }
        })
    }

    /// Running pods whose local data volume has at most `avail_threshold`
    /// bytes free
    pub fn find_pods_low_on_disk_space(&self, avail_threshold: u64) -> Vec<&PodFact> {
        self.filter_pods(|p| p.is_pod_running && p.local_data_avail <= avail_threshold)
    }

    /// Every pod the StatefulSets want is running and none is installed
    pub fn are_all_pods_running_and_zero_installed(&self) -> bool {
        !self
            .detail
            .values()
            .any(|p| ((!p.exists || !p.is_pod_running) && p.managed_by_parent) || p.is_installed)
    }

    pub fn count_running_and_installed(&self) -> usize {
        self.count_pods(|p| p.is_pod_running && p.is_installed)
    }

    /// Pods the restart logic still has to handle but can't restart yet:
    /// not running, or missing the DC-table annotations needed at start.
    /// Install state only matters for admintools deployments.
    pub fn count_not_restartable_pods(&self, vcluster_ops: bool) -> usize {
        self.count_pods(|p| {
            ((!vcluster_ops && p.is_installed) || p.db_exists)
                && p.managed_by_parent
                && (!p.is_pod_running || !p.has_dc_table_annotations)
        })
    }

    pub fn count_up_primary_nodes(&self) -> usize {
        self.count_pods(|p| p.up_node && p.is_primary)
    }

    /// Up, writable pods still running an image other than `new_image`
    pub fn count_not_read_only_with_old_image(&self, new_image: &str) -> usize {
        self.count_pods(|p| p.is_pod_running && p.up_node && !p.read_only && p.image != new_image)
    }

    pub fn up_node_count(&self) -> usize {
        self.count_pods(|p| p.up_node)
    }

    pub fn subcluster_up_node_count(&self, sc_name: &str) -> usize {
        self.count_pods(|p| p.subcluster_name == sc_name && p.up_node)
    }

    pub fn up_node_and_not_read_only_count(&self) -> usize {
        self.count_pods(|p| p.up_node && !p.read_only)
    }

    pub fn shutdown_count(&self) -> usize {
        self.count_pods(|p| p.shutdown)
    }

    /// First pod that isn't running (possibly pending for lack of resources)
    pub fn any_pods_not_running(&self) -> Option<NamespacedName> {
        self.detail
            .values()
            .find(|p| !p.is_pod_running)
            .map(|p| p.name.clone())
    }

    pub fn any_installed_pods_not_running(&self) -> Option<NamespacedName> {
        self.detail
            .values()
            .find(|p| !p.is_pod_running && p.is_installed)
            .map(|p| p.name.clone())
    }

    pub fn any_uninstalled_transient_pods_not_running(&self) -> Option<NamespacedName> {
        self.detail
            .values()
            .find(|p| p.is_transient && !p.is_pod_running && !p.is_installed)
            .map(|p| p.name.clone())
    }

    pub fn is_db_read_only(&self) -> bool {
        self.detail
            .values()
            .any(|p| p.is_pod_running && p.read_only)
    }

    /// Vnode names of the pods that are part of the database
    pub fn find_expected_node_names(&self) -> Vec<String> {
        self.detail
            .values()
            .filter(|p| p.db_exists)
            .map(|p| p.vnode_name.clone())
            .collect()
    }

    /// IP of the first up primary of the main cluster
    pub fn find_first_primary_up_pod_ip(&self) -> Option<String> {
        self.find_first_pod_sorted(|p| p.sandbox.is_empty() && p.is_primary && p.up_node)
            .map(|p| p.pod_ip.clone())
    }

    /// Subclusters the catalog reports in the main cluster while the
    /// VerticaDB status still lists them in a sandbox. `sc_to_sandbox` maps
    /// subcluster name to sandbox name as recorded in status. The result is
    /// keyed by sandbox.
    pub fn find_unsandboxed_subclusters_still_in_sandbox_status(
        &self,
        sc_to_sandbox: &HashMap<String, String>,
    ) -> BTreeMap<String, Vec<String>> {
        let mut result: BTreeMap<String, Vec<String>> = BTreeMap::new();
        let mut seen = HashSet::new();
        for p in self.detail.values() {
            if !seen.insert(p.subcluster_name.as_str()) {
                continue;
            }
            if let Some(sb) = sc_to_sandbox.get(&p.subcluster_name) {
                if p.sandbox.is_empty() {
                    result
                        .entry(sb.clone())
                        .or_default()
                        .push(p.subcluster_name.clone());
                }
            }
        }
        result
    }

    /// Vnode name -> pod IP for one subcluster
    pub fn find_node_name_and_address_in_subcluster(&self, sc_name: &str) -> BTreeMap<String, String> {
        self.detail
            .values()
            .filter(|p| p.subcluster_name == sc_name)
            .map(|p| (p.vnode_name.clone(), p.pod_ip.clone()))
            .collect()
    }

    pub fn find_pod_names_in_subcluster(&self, sc_name: &str) -> Vec<NamespacedName> {
        self.detail
            .values()
            .filter(|p| p.subcluster_name == sc_name)
            .map(|p| p.name.clone())
            .collect()
    }

    pub fn find_node_names_in_subclusters(&self, sc_names: &[String]) -> Vec<String> {
        if sc_names.is_empty() {
            return Vec::new();
        }
        let wanted: HashSet<&str> = sc_names.iter().map(String::as_str).collect();
        self.detail
            .values()
            .filter(|p| wanted.contains(p.subcluster_name.as_str()))
            .map(|p| p.vnode_name.clone())
            .collect()
    }

    /// Remove startup.json from every pod of the snapshot's sandbox so the
    /// nodes don't restart on their own after a shutdown. No-op for the main
    /// cluster.
    pub async fn remove_startup_file_in_sandbox_pods(
        &self,
        vdb: &VerticaDB,
        success_msg: &str,
    ) -> Result<()> {
        let sandbox = self.sandbox_name();
        if sandbox.is_empty() {
            return Ok(());
        }
        let sb = vdb
            .sandbox(sandbox)
            .ok_or_else(|| Error::NotFound(format!("sandbox {sandbox}")))?;
        for sc in &sb.subclusters {
            self.remove_startup_file_in_subcluster_pods(&sc.name, success_msg)
                .await?;
        }
        Ok(())
    }

    pub async fn remove_startup_file_in_subcluster_pods(
        &self,
        sc_name: &str,
        success_msg: &str,
    ) -> Result<()> {
        let cmd = vec![
            "bash".to_string(),
            "-c".to_string(),
            format!("rm -rf {STARTUP_CONF_FILE}"),
        ];
        for pod in self.find_pod_names_in_subcluster(sc_name) {
            if let Err(e) = self.runner.exec_in_pod(&pod, SERVER_CONTAINER, &cmd).await {
                error!(pod = %pod, "Failed to remove startup.json: {}", e);
                return Err(e);
            }
            info!(
                pod = %pod,
                subcluster = sc_name,
                sandbox = self.sandbox_name(),
                "{}",
                success_msg
            );
        }
        Ok(())
    }

    /// Would the primaries that can be restarted form a majority of all
    /// primaries
    pub fn quorum_check_for_restart_cluster(&self, restart_read_only: bool) -> bool {
        let restartable = self
            .find_restartable_pods(restart_read_only, false, true)
            .into_iter()
            .filter(|p| p.is_primary)
            .count();
        let primaries = self.count_pods(|p| p.is_primary);
        2 * restartable > primaries
    }

    /// Whether the up primaries, less `offset` nodes about to go down, still
    /// form a strict majority of all primaries
    pub fn does_db_have_quorum(&self, offset: usize) -> bool {
        let total = self.count_pods(|p| p.is_primary) as i64;
        let up = self.count_up_primary_nodes() as i64;
        2 * (up - offset as i64) > total
    }

    pub fn is_sandbox_empty(&self, sandbox: &str) -> bool {
        !self.detail.values().any(|p| p.sandbox == sandbox)
    }

    /// Secondary subclusters of the main cluster running an image different
    /// from the primaries', with the primary image. Shut down subclusters
    /// are ignored.
    pub fn find_secondary_subclusters_with_different_image(
        &self,
        vdb: &VerticaDB,
    ) -> (Vec<String>, String) {
        let mut scs = Vec::new();
        if !self.scope.is_main() {
            return (scs, String::new());
        }
        let primary_image = self
            .detail
            .values()
            .find(|p| p.is_primary)
            .map(|p| p.image.clone())
            .unwrap_or_default();

        let mut seen = HashSet::new();
        for p in self.detail.values() {
            if seen.contains(p.subcluster_name.as_str()) {
                continue;
            }
            let status_shutdown = vdb
                .find_subcluster_status(&p.subcluster_name)
                .map(|s| s.shutdown)
                .unwrap_or(false);
            if p.shutdown || status_shutdown {
                continue;
            }
            if !p.is_primary && p.image != primary_image {
                scs.push(p.subcluster_name.clone());
            }
            seen.insert(p.subcluster_name.as_str());
        }
        (scs, primary_image)
    }
}

/// Comma separated pod names, for messages
pub fn gen_pod_names(pods: &[&PodFact]) -> String {
    pods.iter()
        .map(|p| p.name.name.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Pod IPs and names of the given pods, in the same order
pub fn host_and_pod_name_list(pods: &[&PodFact]) -> (Vec<String>, Vec<NamespacedName>) {
    pods.iter()
        .map(|p| (p.pod_ip.clone(), p.name.clone()))
        .unzip()
}
