//! Controller module for VerticaDB reconciliation
//!
//! Contains the pod-fact engine, the object finder, the admintools.conf
//! editor and the thin controller loop that drives them.

pub mod atconf;
mod finalizers;
pub mod finder;
pub mod meta;
pub mod objects;
pub mod password;
pub mod pod_runner;
pub mod podfacts;
mod reconciler;
#[cfg(test)]
mod reconciler_test;
#[cfg(test)]
pub(crate) mod testing;

pub use atconf::FileWriter;
pub use finalizers::VERTICADB_FINALIZER;
pub use finder::{FindFlags, SubclusterFinder};
pub use meta::{ClusterScope, NamespacedName};
pub use objects::{apply_pod_annotations, KubeObjectStore, ObjectStore};
pub use password::PasswordManager;
pub use pod_runner::{ExecOutput, KubePodRunner, PodRunner};
pub use podfacts::{DbCheck, Deployment, PodFact, PodFacts};
pub use reconciler::{
    annotate_pods, collect_all, collect_once, dc_table_annotations, retry_delay, run_controller,
    status_patch, subclusters_without_service, ControllerState, OperatorConfig,
};
