//! Tests for the reconciler module
//!
//! These tests verify the pieces of a reconcile pass that don't need an API
//! server:
//! - Collection across the main cluster and sandboxes
//! - Version annotations on pods
//! - Subclusters missing their service
//! - The status patch
//! - Error handling

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use k8s_openapi::apimachinery::pkg::version::Info;

    use super::super::reconciler::*;
    use crate::controller::meta::{
        ClusterScope, NamespacedName, KUBERNETES_BUILD_DATE_ANNOTATION, KUBERNETES_GIT_COMMIT_ANNOTATION,
        KUBERNETES_VERSION_ANNOTATION,
    };
    use crate::controller::podfacts::PodFacts;
    use crate::controller::testing::{
        make_pod, make_service, make_sts, make_vdb, FakeObjectStore, FakePodRunner,
    };
    use crate::crd::{
        Sandbox, SandboxSubcluster, SubclusterStatus, SubclusterType, VerticaDB, VerticaDBStatus,
    };
    use crate::error::Error;

    const UP: &str = "dbExists: true\nverticaPIDRunning: true\n";

    fn version_info() -> Info {
        Info {
            git_version: "v1.30.2".to_string(),
            git_commit: "39683505b630ff2121012f3c5b16215a1449d5ed".to_string(),
            build_date: "2024-06-11T20:21:00Z".to_string(),
            ..Default::default()
        }
    }

    fn sandboxed_vdb() -> VerticaDB {
        let mut vdb = make_vdb(&[
            ("main", 2, SubclusterType::Primary),
            ("sb_sc", 1, SubclusterType::Secondary),
        ]);
        vdb.spec.sandboxes = vec![Sandbox {
            name: "sb1".to_string(),
            image: String::new(),
            subclusters: vec![SandboxSubcluster {
                name: "sb_sc".to_string(),
            }],
        }];
        vdb
    }

    fn sandboxed_store(vdb: &VerticaDB) -> Arc<FakeObjectStore> {
        let store = Arc::new(FakeObjectStore::new());
        store.add_statefulset(make_sts(vdb, "main", 2, ""));
        store.add_pod(make_pod(vdb, "main", 0, ""));
        store.add_pod(make_pod(vdb, "main", 1, ""));
        store.add_statefulset(make_sts(vdb, "sb_sc", 1, "sb1"));
        store.add_pod(make_pod(vdb, "sb_sc", 0, "sb1"));
        store
    }

    async fn collect(
        vdb: &VerticaDB,
        store: &Arc<FakeObjectStore>,
        runner: &Arc<FakePodRunner>,
    ) -> Vec<PodFacts> {
        collect_all(store.clone(), runner.clone(), "", vdb).await.unwrap()
    }

    #[tokio::test]
    async fn test_collect_all_covers_main_and_sandboxes() {
        let vdb = sandboxed_vdb();
        let store = sandboxed_store(&vdb);
        let runner = Arc::new(FakePodRunner::new());
        let facts = collect(&vdb, &store, &runner).await;

        assert_eq!(facts.len(), 2);
        assert_eq!(facts[0].sandbox_name(), "");
        assert_eq!(facts[0].len(), 2);
        assert_eq!(facts[1].sandbox_name(), "sb1");
        assert_eq!(facts[1].len(), 1);
        assert_eq!(runner.call_count(), 3);
    }

    #[tokio::test]
    async fn test_annotate_pods_adds_version_annotations_once() {
        let vdb = make_vdb(&[("main", 2, SubclusterType::Primary)]);
        let store = Arc::new(FakeObjectStore::new());
        store.add_statefulset(make_sts(&vdb, "main", 3, ""));
        store.add_pod(make_pod(&vdb, "main", 0, ""));
        store.add_pod(make_pod(&vdb, "main", 1, ""));
        let runner = Arc::new(FakePodRunner::new());
        let facts = collect(&vdb, &store, &runner).await;
        let annotations = dc_table_annotations(&version_info());

        // The third slot has no pod and is skipped
        let updated = annotate_pods(store.as_ref(), &facts[0], &annotations)
            .await
            .unwrap();
        assert_eq!(updated, 2);
        let pod = store.pod(&NamespacedName::new("default", "v-main-0")).unwrap();
        let got = pod.metadata.annotations.unwrap();
        assert_eq!(got.get(KUBERNETES_VERSION_ANNOTATION).unwrap(), "v1.30.2");
        assert_eq!(
            got.get(KUBERNETES_BUILD_DATE_ANNOTATION).unwrap(),
            "2024-06-11T20:21:00Z"
        );

        // A fresh snapshot sees the annotations and leaves the pods alone
        let facts = collect(&vdb, &store, &runner).await;
        assert!(facts[0]
            .iter()
            .filter(|p| p.exists())
            .all(|p| p.has_dc_table_annotations()));
        let replaced = *store.replace_calls.lock().unwrap();
        assert_eq!(
            annotate_pods(store.as_ref(), &facts[0], &annotations)
                .await
                .unwrap(),
            0
        );
        assert_eq!(*store.replace_calls.lock().unwrap(), replaced);
    }

    #[tokio::test]
    async fn test_subclusters_without_service() {
        let mut vdb = make_vdb(&[
            ("main", 2, SubclusterType::Primary),
            ("sec", 1, SubclusterType::Secondary),
            ("sb_sc", 1, SubclusterType::Secondary),
        ]);
        vdb.spec.sandboxes = vec![Sandbox {
            name: "sb1".to_string(),
            image: String::new(),
            subclusters: vec![SandboxSubcluster {
                name: "sb_sc".to_string(),
            }],
        }];
        let store = FakeObjectStore::new();
        store.add_service(make_service(&vdb, "main", ""));
        // A service for a removed subcluster doesn't count
        store.add_service(make_service(&vdb, "old", ""));

        let main = subclusters_without_service(&store, &vdb, &ClusterScope::Main)
            .await
            .unwrap();
        assert_eq!(main, vec!["sec".to_string()]);
        let sandbox = ClusterScope::from_sandbox("sb1");
        let sb = subclusters_without_service(&store, &vdb, &sandbox)
            .await
            .unwrap();
        assert_eq!(sb, vec!["sb_sc".to_string()]);

        store.add_service(make_service(&vdb, "sb_sc", "sb1"));
        assert!(subclusters_without_service(&store, &vdb, &sandbox)
            .await
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_dc_table_annotations() {
        let annotations = dc_table_annotations(&version_info());
        assert_eq!(annotations.len(), 3);
        assert_eq!(
            annotations.get(KUBERNETES_GIT_COMMIT_ANNOTATION).map(String::as_str),
            Some("39683505b630ff2121012f3c5b16215a1449d5ed")
        );
    }

    #[tokio::test]
    async fn test_status_patch_counts_up_nodes_across_scopes() {
        let mut vdb = sandboxed_vdb();
        vdb.status = Some(VerticaDBStatus {
            subclusters: vec![SubclusterStatus {
                name: "main".to_string(),
                installed_count: 2,
                up_node_count: 0,
                ..Default::default()
            }],
            ..Default::default()
        });
        let store = sandboxed_store(&vdb);
        let runner = Arc::new(FakePodRunner::new());
        runner.push_stdout(&NamespacedName::new("default", "v-main-0"), UP);
        runner.push_stdout(&NamespacedName::new("default", "v-sb-sc-0"), UP);
        let facts = collect(&vdb, &store, &runner).await;
        let refs: Vec<&PodFacts> = facts.iter().collect();

        let patch = status_patch(&vdb, &refs);
        let status = &patch["status"];
        assert_eq!(status["upNodeCount"], 2);
        let scs = status["subclusters"].as_array().unwrap();
        assert_eq!(scs.len(), 2);
        assert_eq!(scs[0]["name"], "main");
        assert_eq!(scs[0]["upNodeCount"], 1);
        // Existing fields are carried over
        assert_eq!(scs[0]["installedCount"], 2);
        assert_eq!(scs[1]["name"], "sb_sc");
        assert_eq!(scs[1]["upNodeCount"], 1);
    }

    #[test]
    fn test_retry_delay() {
        let retriable = Error::ExecError {
            pod: "default/v-main-0".to_string(),
            container: "server".to_string(),
            message: "timeout".to_string(),
            stderr: String::new(),
        };
        assert_eq!(retry_delay(&retriable), Duration::from_secs(15));
        assert_eq!(
            retry_delay(&Error::ConfigError("bad".to_string())),
            Duration::from_secs(60)
        );
        assert_eq!(
            retry_delay(&Error::NotFound("VerticaDB default/v".to_string())),
            Duration::from_secs(60)
        );
    }

    #[test]
    fn test_operator_config_defaults() {
        let config = OperatorConfig::default();
        assert!(config.namespace.is_empty());
        assert_eq!(config.requeue_secs, 30);
        assert_eq!(config.low_disk_threshold, 1024 * 1024 * 1024);
    }
}
