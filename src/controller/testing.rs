//! In-memory stand-ins for the pod runner and the object store

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{StatefulSet, StatefulSetSpec};
use k8s_openapi::api::core::v1::{
    Container, ContainerStatus, Pod, PodSpec, PodStatus, Secret, Service,
};
use kube::api::ObjectMeta;
use kube::error::ErrorResponse;
use kube::ResourceExt;

use crate::controller::meta::{
    gen_subcluster_object_name, NamespacedName, MANAGED_BY_LABEL, OPERATOR_NAME,
    SANDBOX_NAME_LABEL, SERVER_CONTAINER, SUBCLUSTER_NAME_LABEL, VDB_INSTANCE_LABEL,
};
use crate::controller::objects::ObjectStore;
use crate::controller::pod_runner::{ExecOutput, PodRunner};
use crate::crd::{Subcluster, SubclusterType, VerticaDB, VerticaDBSpec};
use crate::error::{Error, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CallKind {
    Exec,
    Vsql,
    Copy,
}

/// One recorded call against [`FakePodRunner`]
#[derive(Clone, Debug)]
pub struct RecordedCall {
    pub kind: CallKind,
    pub pod: NamespacedName,
    pub container: String,
    pub command: Vec<String>,
    /// Content of the source file for copies
    pub copied: Option<String>,
}

/// Pod runner that replays scripted results per pod, in call order. Pods
/// without a scripted result get an empty successful output.
#[derive(Default)]
pub struct FakePodRunner {
    results: Mutex<HashMap<NamespacedName, VecDeque<Result<ExecOutput>>>>,
    calls: Mutex<Vec<RecordedCall>>,
}

impl FakePodRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_result(&self, pod: &NamespacedName, result: Result<ExecOutput>) {
        self.results
            .lock()
            .unwrap()
            .entry(pod.clone())
            .or_default()
            .push_back(result);
    }

    pub fn push_stdout(&self, pod: &NamespacedName, stdout: &str) {
        self.push_result(pod, Ok(ExecOutput::stdout(stdout)));
    }

    pub fn push_failure(&self, pod: &NamespacedName, message: &str) {
        self.push_result(
            pod,
            Err(Error::ExecError {
                pod: pod.to_string(),
                container: "server".to_string(),
                message: message.to_string(),
                stderr: message.to_string(),
            }),
        );
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn calls_for(&self, pod: &NamespacedName) -> Vec<RecordedCall> {
        self.calls()
            .into_iter()
            .filter(|c| &c.pod == pod)
            .collect()
    }

    fn record(&self, call: RecordedCall) -> Result<ExecOutput> {
        let pod = call.pod.clone();
        self.calls.lock().unwrap().push(call);
        self.results
            .lock()
            .unwrap()
            .get_mut(&pod)
            .and_then(|q| q.pop_front())
            .unwrap_or_else(|| Ok(ExecOutput::default()))
    }
}

#[async_trait]
impl PodRunner for FakePodRunner {
    async fn exec_in_pod(
        &self,
        pod: &NamespacedName,
        container: &str,
        command: &[String],
    ) -> Result<ExecOutput> {
        self.record(RecordedCall {
            kind: CallKind::Exec,
            pod: pod.clone(),
            container: container.to_string(),
            command: command.to_vec(),
            copied: None,
        })
    }

    async fn exec_vsql(
        &self,
        pod: &NamespacedName,
        container: &str,
        command: &[String],
    ) -> Result<ExecOutput> {
        self.record(RecordedCall {
            kind: CallKind::Vsql,
            pod: pod.clone(),
            container: container.to_string(),
            command: command.to_vec(),
            copied: None,
        })
    }

    async fn copy_to_pod(
        &self,
        pod: &NamespacedName,
        container: &str,
        source: &Path,
        dest: &str,
        post_copy: &[String],
    ) -> Result<ExecOutput> {
        let copied = std::fs::read_to_string(source)?;
        let mut command = vec![dest.to_string()];
        command.extend(post_copy.iter().cloned());
        self.record(RecordedCall {
            kind: CallKind::Copy,
            pod: pod.clone(),
            container: container.to_string(),
            command,
            copied: Some(copied),
        })
    }
}

fn matches_selector(labels: &BTreeMap<String, String>, selector: &str) -> bool {
    selector
        .split(',')
        .filter(|s| !s.is_empty())
        .all(|term| match term.split_once('=') {
            Some((k, v)) => labels.get(k).map(String::as_str) == Some(v),
            None => labels.contains_key(term),
        })
}

fn api_error(code: u16, reason: &str) -> Error {
    Error::KubeError(kube::Error::Api(ErrorResponse {
        status: "Failure".to_string(),
        message: reason.to_string(),
        reason: reason.to_string(),
        code,
    }))
}

/// Object store holding everything in memory
#[derive(Default)]
pub struct FakeObjectStore {
    pub statefulsets: Mutex<Vec<StatefulSet>>,
    pub pods: Mutex<Vec<Pod>>,
    pub services: Mutex<Vec<Service>>,
    pub vdbs: Mutex<Vec<VerticaDB>>,
    pub secrets: Mutex<Vec<Secret>>,
    /// Number of upcoming `replace_pod` calls that fail with a 409
    pub conflicts: Mutex<u32>,
    /// Number of upcoming `list_*`/`get_*` calls that fail with a 500
    pub failures: Mutex<u32>,
    pub replace_calls: Mutex<u32>,
    pub read_calls: Mutex<u32>,
}

impl FakeObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_statefulset(&self, sts: StatefulSet) {
        self.statefulsets.lock().unwrap().push(sts);
    }

    pub fn add_pod(&self, pod: Pod) {
        self.pods.lock().unwrap().push(pod);
    }

    pub fn add_service(&self, svc: Service) {
        self.services.lock().unwrap().push(svc);
    }

    pub fn add_vdb(&self, vdb: VerticaDB) {
        self.vdbs.lock().unwrap().push(vdb);
    }

    pub fn add_secret(&self, secret: Secret) {
        self.secrets.lock().unwrap().push(secret);
    }

    pub fn pod(&self, name: &NamespacedName) -> Option<Pod> {
        find(&self.pods, name)
    }

    fn read(&self) -> Result<()> {
        *self.read_calls.lock().unwrap() += 1;
        let mut failures = self.failures.lock().unwrap();
        if *failures > 0 {
            *failures -= 1;
            return Err(api_error(500, "InternalError"));
        }
        Ok(())
    }
}

fn find<K: ResourceExt + Clone>(objs: &Mutex<Vec<K>>, name: &NamespacedName) -> Option<K> {
    objs.lock()
        .unwrap()
        .iter()
        .find(|o| &NamespacedName::of(*o) == name)
        .cloned()
}

fn list<K: ResourceExt + Clone>(objs: &Mutex<Vec<K>>, namespace: &str, selector: &str) -> Vec<K> {
    objs.lock()
        .unwrap()
        .iter()
        .filter(|o| o.namespace().as_deref().unwrap_or("default") == namespace)
        .filter(|o| matches_selector(o.labels(), selector))
        .cloned()
        .collect()
}

#[async_trait]
impl ObjectStore for FakeObjectStore {
    async fn get_statefulset(&self, name: &NamespacedName) -> Result<Option<StatefulSet>> {
        self.read()?;
        Ok(find(&self.statefulsets, name))
    }

    async fn get_pod(&self, name: &NamespacedName) -> Result<Option<Pod>> {
        self.read()?;
        Ok(find(&self.pods, name))
    }

    async fn get_vdb(&self, name: &NamespacedName) -> Result<Option<VerticaDB>> {
        self.read()?;
        Ok(find(&self.vdbs, name))
    }

    async fn get_secret(&self, name: &NamespacedName) -> Result<Option<Secret>> {
        self.read()?;
        Ok(find(&self.secrets, name))
    }

    async fn list_statefulsets(
        &self,
        namespace: &str,
        selector: &str,
    ) -> Result<Vec<StatefulSet>> {
        self.read()?;
        Ok(list(&self.statefulsets, namespace, selector))
    }

    async fn list_pods(&self, namespace: &str, selector: &str) -> Result<Vec<Pod>> {
        self.read()?;
        Ok(list(&self.pods, namespace, selector))
    }

    async fn list_services(&self, namespace: &str, selector: &str) -> Result<Vec<Service>> {
        self.read()?;
        Ok(list(&self.services, namespace, selector))
    }

    async fn replace_pod(&self, pod: &Pod) -> Result<Pod> {
        *self.replace_calls.lock().unwrap() += 1;
        {
            let mut conflicts = self.conflicts.lock().unwrap();
            if *conflicts > 0 {
                *conflicts -= 1;
                return Err(api_error(409, "Conflict"));
            }
        }
        let name = NamespacedName::of(pod);
        let mut pods = self.pods.lock().unwrap();
        match pods.iter_mut().find(|p| NamespacedName::of(&**p) == name) {
            Some(existing) => {
                *existing = pod.clone();
                Ok(pod.clone())
            }
            None => Err(api_error(404, "NotFound")),
        }
    }
}

// ----------------------------------------------------------------------------
// Object builders
// ----------------------------------------------------------------------------

/// VerticaDB `v` in namespace `default` with the given subclusters
pub fn make_vdb(subclusters: &[(&str, i32, SubclusterType)]) -> VerticaDB {
    let mut vdb = VerticaDB::new(
        "v",
        VerticaDBSpec {
            db_name: "vertdb".to_string(),
            image: "vertica/vertica-k8s:24.3.0".to_string(),
            shard_count: 6,
            subclusters: subclusters
                .iter()
                .map(|(name, size, t)| Subcluster::new(*name, *size, t.clone()))
                .collect(),
            ..Default::default()
        },
    );
    vdb.metadata.namespace = Some("default".to_string());
    vdb.metadata.uid = Some("uid-1".to_string());
    vdb.metadata.resource_version = Some("1".to_string());
    vdb
}

fn object_labels(vdb: &VerticaDB, sc_name: &str, sandbox: &str) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::from([
        (VDB_INSTANCE_LABEL.to_string(), vdb.name_any()),
        (MANAGED_BY_LABEL.to_string(), OPERATOR_NAME.to_string()),
        (SUBCLUSTER_NAME_LABEL.to_string(), sc_name.to_string()),
    ]);
    if !sandbox.is_empty() {
        labels.insert(SANDBOX_NAME_LABEL.to_string(), sandbox.to_string());
    }
    labels
}

pub fn make_sts(vdb: &VerticaDB, sc_name: &str, replicas: i32, sandbox: &str) -> StatefulSet {
    StatefulSet {
        metadata: ObjectMeta {
            name: Some(format!(
                "{}-{}",
                vdb.name_any(),
                gen_subcluster_object_name(sc_name)
            )),
            namespace: vdb.namespace(),
            labels: Some(object_labels(vdb, sc_name, sandbox)),
            ..Default::default()
        },
        spec: Some(StatefulSetSpec {
            replicas: Some(replicas),
            ..Default::default()
        }),
        status: None,
    }
}

pub fn make_service(vdb: &VerticaDB, sc_name: &str, sandbox: &str) -> Service {
    Service {
        metadata: ObjectMeta {
            name: Some(format!(
                "{}-{}",
                vdb.name_any(),
                gen_subcluster_object_name(sc_name)
            )),
            namespace: vdb.namespace(),
            labels: Some(object_labels(vdb, sc_name, sandbox)),
            ..Default::default()
        },
        ..Default::default()
    }
}

/// A running pod with IP `10.0.<index>.<n>` where n is derived from the
/// subcluster name length, so pods of different subclusters differ
pub fn make_pod(vdb: &VerticaDB, sc_name: &str, index: i32, sandbox: &str) -> Pod {
    let name = format!(
        "{}-{}-{}",
        vdb.name_any(),
        gen_subcluster_object_name(sc_name),
        index
    );
    Pod {
        metadata: ObjectMeta {
            name: Some(name.clone()),
            namespace: vdb.namespace(),
            labels: Some(object_labels(vdb, sc_name, sandbox)),
            creation_timestamp: None,
            ..Default::default()
        },
        spec: Some(PodSpec {
            hostname: Some(name),
            subdomain: Some(vdb.name_any()),
            containers: vec![Container {
                name: SERVER_CONTAINER.to_string(),
                image: Some(vdb.spec.image.clone()),
                ..Default::default()
            }],
            ..Default::default()
        }),
        status: Some(PodStatus {
            phase: Some("Running".to_string()),
            pod_ip: Some(format!("10.0.{}.{}", index, sc_name.len())),
            container_statuses: Some(vec![ContainerStatus {
                name: SERVER_CONTAINER.to_string(),
                ready: true,
                ..Default::default()
            }]),
            ..Default::default()
        }),
    }
}
