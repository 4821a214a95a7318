//! Collection of the pod facts: one fixed checker pipeline per pod slot

use std::collections::BTreeMap;
use std::io::Write;

use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use tracing::{debug, instrument, warn};

use super::deployment::{Deployment, NodeDetailsSource};
use super::fact::{PodFact, PodFacts};
use super::gather::{gen_gather_script, GatherState, GatherTarget};
use super::node_details::{
    HttpsNodeDetailsFetcher, NodeDetails, NodeDetailsFetcher, VsqlNodeDetailsFetcher,
};
use crate::controller::finder::{FindFlags, SubclusterFinder};
use crate::controller::meta::{
    has_nma_container, is_container_ready, pod_name, sandbox_label, server_env, server_image,
    sts_name, NamespacedName, CATALOG_PATH_ENV, GATHER_SCRIPT_PATH,
    KUBERNETES_VERSION_ANNOTATION, NMA_CONTAINER, SERVER_CONTAINER,
};
use crate::crd::{Subcluster, VerticaDB};
use crate::error::{Error, Result};

/// What the owning StatefulSet tells us about its pods
struct StsContext {
    replicas: Option<i32>,
    exec_container: &'static str,
    sandbox: String,
}

impl StsContext {
    fn from_sts(sts: Option<&StatefulSet>) -> Self {
        let Some(sts) = sts else {
            return Self {
                replicas: None,
                exec_container: SERVER_CONTAINER,
                sandbox: String::new(),
            };
        };
        let spec = sts.spec.as_ref();
        // The NMA container is always up in vclusterops deployments, while
        // the server container may not be until the version is known
        let has_nma = spec
            .and_then(|s| s.template.spec.as_ref())
            .map(|s| s.containers.iter().any(|c| c.name == NMA_CONTAINER))
            .unwrap_or(false);
        Self {
            replicas: spec.and_then(|s| s.replicas),
            exec_container: if has_nma { NMA_CONTAINER } else { SERVER_CONTAINER },
            sandbox: sandbox_label(sts),
        }
    }
}

impl PodFacts {
    /// Refresh the snapshot if it is stale. Any API or exec failure aborts
    /// the collection and leaves the snapshot stale.
    #[instrument(skip(self, vdb), fields(vdb = %vdb.name_any(), scope = %self.scope))]
    pub async fn collect(&mut self, vdb: &VerticaDB) -> Result<()> {
        if !self.needs_collection {
            return Ok(());
        }
        self.vdb_resource_version = vdb.resource_version().unwrap_or_default();
        self.detail.clear();

        let deployment = Deployment::for_vdb(vdb);
        // Subclusters no longer in the spec are included until their
        // StatefulSets are gone
        let subclusters = SubclusterFinder::new(self.store.as_ref(), vdb, self.scope.clone())
            .find_subclusters(FindFlags::ALL)
            .await?;

        let mut detail = BTreeMap::new();
        for sc in &subclusters {
            self.collect_subcluster(vdb, deployment, sc, &mut detail)
                .await?;
        }
        self.detail = detail;
        self.needs_collection = false;
        Ok(())
    }

    pub fn invalidate(&mut self) {
        self.needs_collection = true;
    }

    /// True when the snapshot is stale or the VerticaDB changed since it
    /// was collected. The VerticaDB is re-read to get its latest version.
    pub async fn has_vdb_changed_since_collection(&self, vdb: &VerticaDB) -> Result<bool> {
        if self.needs_collection {
            return Ok(true);
        }
        let name = NamespacedName::of(vdb);
        let latest = self
            .store
            .get_vdb(&name)
            .await?
            .ok_or_else(|| Error::NotFound(format!("VerticaDB {name}")))?;
        Ok(latest.resource_version().unwrap_or_default() != self.vdb_resource_version)
    }

    async fn collect_subcluster(
        &self,
        vdb: &VerticaDB,
        deployment: Deployment,
        sc: &Subcluster,
        detail: &mut BTreeMap<NamespacedName, PodFact>,
    ) -> Result<()> {
        let sts_nm = NamespacedName::new(
            vdb.namespace().unwrap_or_else(|| "default".to_string()),
            sts_name(vdb, sc),
        );
        let sts = self.store.get_statefulset(&sts_nm).await?;
        let ctx = StsContext::from_sts(sts.as_ref());

        // Slots past the declared size are still examined while the
        // StatefulSet has them
        let max_slots = sc.size.max(ctx.replicas.unwrap_or(0));
        for index in 0..max_slots {
            let pf = self.collect_pod(vdb, deployment, sc, &ctx, index).await?;
            detail.insert(pf.name.clone(), pf);
        }
        Ok(())
    }

    async fn collect_pod(
        &self,
        vdb: &VerticaDB,
        deployment: Deployment,
        sc: &Subcluster,
        ctx: &StsContext,
        index: i32,
    ) -> Result<PodFact> {
        let mut pf = PodFact {
            name: pod_name(vdb, sc, index),
            subcluster_name: sc.name.clone(),
            is_primary: sc.is_primary(),
            pod_index: index,
            exec_container_name: ctx.exec_container.to_string(),
            shutdown: sc.shutdown,
            managed_by_parent: ctx.replicas.map(|r| index < r).unwrap_or(false),
            ..Default::default()
        };

        if let Some(pod) = self.store.get_pod(&pf.name).await? {
            apply_pod(vdb, sc, &pod, ctx, &mut pf)?;
        }

        let gs = self.run_gather(vdb, &pf).await?;
        deployment.resolve_install(vdb.install_count(&sc.name), &mut pf, &gs);
        check_db_created(vdb, &mut pf, &gs);
        map_gather_state(deployment, &mut pf, &gs);
        self.check_node_details(vdb, deployment, &mut pf).await;
        check_startup(&mut pf, &gs);
        if let Some(override_fn) = &self.override_fn {
            override_fn(vdb, &mut pf, &gs)?;
        }

        debug!(pod = %pf.name, "pod fact {:?}", pf);
        Ok(pf)
    }

    /// Copy the gather script into the pod and run it in one exec. Pods that
    /// aren't running report the default state.
    async fn run_gather(&self, vdb: &VerticaDB, pf: &PodFact) -> Result<GatherState> {
        if !pf.is_pod_running {
            return Ok(GatherState::default());
        }
        let script = gen_gather_script(
            vdb,
            &GatherTarget {
                pod_ip: &pf.pod_ip,
                catalog_path: &pf.catalog_path,
                is_primary: pf.is_primary,
                exec_container: &pf.exec_container_name,
            },
        );
        let mut tmp = tempfile::Builder::new()
            .prefix("gather_pod.sh.")
            .tempfile()?;
        tmp.write_all(script.as_bytes())?;
        tmp.flush()?;

        let post_copy = vec!["bash".to_string(), GATHER_SCRIPT_PATH.to_string()];
        let out = self
            .runner
            .copy_to_pod(
                &pf.name,
                &pf.exec_container_name,
                tmp.path(),
                GATHER_SCRIPT_PATH,
                &post_copy,
            )
            .await?;
        GatherState::parse(&out.stdout)
    }

    /// Enrich an up pod with catalog details. Failures are logged and
    /// otherwise ignored.
    async fn check_node_details(&self, vdb: &VerticaDB, deployment: Deployment, pf: &mut PodFact) {
        if !pf.is_pod_running || !pf.up_node {
            return;
        }
        let result = match deployment.node_details_source() {
            NodeDetailsSource::Https => {
                match HttpsNodeDetailsFetcher::new(&pf.pod_ip, &vdb.superuser_name(), &self.password)
                {
                    Ok(fetcher) => fetcher.fetch_node_details().await,
                    Err(e) => Err(e),
                }
            }
            NodeDetailsSource::Vsql => {
                VsqlNodeDetailsFetcher {
                    runner: self.runner.as_ref(),
                    vdb,
                    pod: &pf.name,
                    container: &pf.exec_container_name,
                    vnode_name: &pf.vnode_name,
                }
                .fetch_node_details()
                .await
            }
        };
        match result {
            Ok(details) => apply_node_details(pf, details),
            Err(e) => warn!(pod = %pf.name, "Failed to fetch node details: {}", e),
        }
    }
}

/// Base fields that come straight from the pod object
fn apply_pod(
    vdb: &VerticaDB,
    sc: &Subcluster,
    pod: &Pod,
    ctx: &StsContext,
    pf: &mut PodFact,
) -> Result<()> {
    let spec = pod.spec.as_ref();
    let status = pod.status.as_ref();

    pf.exists = true;
    pf.is_terminating = pod.metadata.deletion_timestamp.is_some();
    // A terminating pod is seconds away from going, so nothing is run in it
    pf.is_pod_running =
        status.and_then(|s| s.phase.as_deref()) == Some("Running") && !pf.is_terminating;
    pf.dns_name = format!(
        "{}.{}.{}",
        spec.and_then(|s| s.hostname.as_deref()).unwrap_or_default(),
        spec.and_then(|s| s.subdomain.as_deref()).unwrap_or_default(),
        pod.namespace().unwrap_or_default()
    );
    pf.pod_ip = status.and_then(|s| s.pod_ip.clone()).unwrap_or_default();
    pf.creation_timestamp = pod
        .metadata
        .creation_timestamp
        .as_ref()
        .map(|t| t.0.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_default();
    pf.is_transient = sc.is_transient();
    pf.is_pending_delete = pf.pod_index >= sc.size;

    let has_server = spec
        .map(|s| s.containers.iter().any(|c| c.name == SERVER_CONTAINER))
        .unwrap_or(false);
    if !has_server {
        return Err(Error::NotFound(format!(
            "server container in pod {}",
            pf.name
        )));
    }
    pf.image = server_image(pod);
    pf.catalog_path =
        server_env(pod, CATALOG_PATH_ENV).unwrap_or_else(|| vdb.catalog_path().to_string());
    // The annotations are always added together, so one is enough
    pf.has_dc_table_annotations = pod.annotations().contains_key(KUBERNETES_VERSION_ANNOTATION);
    pf.has_nma_sidecar = has_nma_container(pod);
    pf.is_nma_container_ready = is_container_ready(pod, NMA_CONTAINER);
    // Replaced by the catalog's view once the node is up
    pf.sandbox = ctx.sandbox.clone();
    Ok(())
}

/// The status is trusted first since the catalog on disk can be removed
/// (e.g. after an unsandbox); a catalog found on disk still counts.
fn check_db_created(vdb: &VerticaDB, pf: &mut PodFact, gs: &GatherState) {
    pf.db_exists = false;
    if let Some(scs) = vdb.find_subcluster_status(&pf.subcluster_name) {
        pf.db_exists = scs.added_to_db_count > pf.pod_index;
        if let Some(d) = usize::try_from(pf.pod_index)
            .ok()
            .and_then(|i| scs.detail.get(i))
        {
            pf.vnode_name = d.vnode_name.clone();
            pf.db_exists = d.added_to_db;
        }
    }
    if !pf.is_pod_running {
        return;
    }
    pf.db_exists = gs.db_exists || pf.db_exists;
    pf.vnode_name = gs.vnode_name.clone();
}

fn map_gather_state(deployment: Deployment, pf: &mut PodFact, gs: &GatherState) {
    if !pf.is_pod_running {
        return;
    }
    pf.eula_accepted = gs.eula_accepted;
    pf.dir_exists = gs.dir_exists.clone();
    pf.file_exists = gs.file_exists.clone();
    pf.local_data_size = gs.local_data_size;
    pf.local_data_avail = gs.local_data_avail;
    pf.admintools_exists = gs.admintools_exists;
    pf.up_node = deployment.is_up(pf, gs);
}

fn apply_node_details(pf: &mut PodFact, details: NodeDetails) {
    pf.read_only = details.read_only;
    pf.subcluster_oid = details.subcluster_oid;
    pf.sandbox = details.sandbox_name;
    pf.shard_subscriptions = details.shard_subscriptions;
    pf.max_depot_size = details.max_depot_size;
    pf.depot_disk_percent_size = details.depot_disk_percent_size;
}

/// The process is running but the node isn't up yet
fn check_startup(pf: &mut PodFact, gs: &GatherState) {
    pf.startup_in_progress = false;
    if !pf.db_exists || !pf.is_pod_running || pf.up_node || !gs.vertica_pid_running {
        return;
    }
    pf.startup_in_progress = !gs.startup_complete;
}
