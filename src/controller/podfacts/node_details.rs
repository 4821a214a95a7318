//! Best-effort enrichment of an up node with catalog details
//!
//! Two sources are supported: vsql run inside the pod, and the HTTPS service
//! of the server. Both fill the same [`NodeDetails`].

use std::net::IpAddr;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use crate::controller::meta::{NamespacedName, VERTICA_HTTP_PORT};
use crate::controller::pod_runner::PodRunner;
use crate::crd::{
    VerticaDB, VerticaVersion, NODES_HAVE_READ_ONLY_STATE_VERSION, NODES_HAVE_SANDBOX_STATE_VERSION,
};
use crate::error::{Error, Result};

const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NodeDetails {
    pub read_only: bool,
    pub subcluster_oid: String,
    pub sandbox_name: String,
    pub shard_subscriptions: i32,
    pub max_depot_size: u64,
    pub depot_disk_percent_size: String,
}

#[async_trait]
pub trait NodeDetailsFetcher: Send + Sync {
    async fn fetch_node_details(&self) -> Result<NodeDetails>;
}

// ----------------------------------------------------------------------------
// vsql
// ----------------------------------------------------------------------------

/// Runs three catalog queries through vsql in the pod
pub struct VsqlNodeDetailsFetcher<'a> {
    pub runner: &'a dyn PodRunner,
    pub vdb: &'a VerticaDB,
    pub pod: &'a NamespacedName,
    pub container: &'a str,
    pub vnode_name: &'a str,
}

impl VsqlNodeDetailsFetcher<'_> {
    pub fn node_state_query(&self) -> String {
        let eon = self.vdb.is_eon();
        let version = self.vdb.version();
        let at_least = |min: &VerticaVersion| version.map(|v| v.is_equal_or_newer(min)).unwrap_or(false);

        // Node name and state are informational only
        let mut cols = String::from("n.node_name, node_state");
        cols.push_str(if eon { ", subcluster_oid" } else { ", ''" });
        if at_least(&NODES_HAVE_READ_ONLY_STATE_VERSION) {
            cols.push_str(", is_readonly");
        }
        if eon && at_least(&NODES_HAVE_SANDBOX_STATE_VERSION) {
            cols.push_str(", n.sandbox");
        }

        if eon {
            format!(
                "select {cols} from nodes as n, subclusters as s \
                 where s.node_oid = n.node_id and n.node_name in (select node_name from current_session)"
            )
        } else {
            format!(
                "select {cols} from nodes as n \
                 where n.node_name in (select node_name from current_session)"
            )
        }
    }

    pub fn shard_subscriptions_query(&self) -> String {
        format!(
            "select count(*) from v_catalog.node_subscriptions where node_name = '{}' and shard_name != 'replica'",
            self.vnode_name
        )
    }

    pub fn depot_query(&self) -> String {
        format!(
            "select max_size, disk_percent from storage_locations \
             where location_usage = 'DEPOT' and node_name = '{}'",
            self.vnode_name
        )
    }

    async fn execute_sql(&self, sql: String) -> Result<String> {
        let cmd = vec!["-tAc".to_string(), sql];
        let out = self.runner.exec_vsql(self.pod, self.container, &cmd).await?;
        Ok(out.stdout)
    }
}

#[async_trait]
impl NodeDetailsFetcher for VsqlNodeDetailsFetcher<'_> {
    async fn fetch_node_details(&self) -> Result<NodeDetails> {
        let mut details = NodeDetails::default();
        let out = self.execute_sql(self.node_state_query()).await?;
        parse_node_state(&out, &mut details)?;
        let out = self.execute_sql(self.shard_subscriptions_query()).await?;
        parse_shard_subscriptions(&out, &mut details)?;
        let out = self.execute_sql(self.depot_query()).await?;
        parse_depot_details(&out, &mut details)?;
        Ok(details)
    }
}

fn first_line(out: &str) -> &str {
    out.lines().next().unwrap_or("").trim_end()
}

/// Parse `v_db_node0001|UP|4503599627370497|t|sb1`. The read-only and
/// sandbox columns are missing on older servers. Empty output leaves the
/// details untouched.
fn parse_node_state(out: &str, details: &mut NodeDetails) -> Result<()> {
    if out.is_empty() {
        return Ok(());
    }
    let cols: Vec<&str> = first_line(out).split('|').collect();
    if cols.len() < 3 {
        return Err(Error::NodeDetailsError(format!(
            "expected at least 3 columns from node query but only got {}",
            cols.len()
        )));
    }
    details.subcluster_oid = cols[2].to_string();
    details.read_only = cols.get(3).map(|c| *c == "t").unwrap_or(false);
    if let Some(sandbox) = cols.get(4) {
        details.sandbox_name = sandbox.to_string();
    }
    Ok(())
}

fn parse_shard_subscriptions(out: &str, details: &mut NodeDetails) -> Result<()> {
    if out.is_empty() {
        return Ok(());
    }
    let line = first_line(out);
    details.shard_subscriptions = line.parse().map_err(|_| {
        Error::NodeDetailsError(format!("invalid shard subscription count {line:?}"))
    })?;
    Ok(())
}

fn parse_depot_details(out: &str, details: &mut NodeDetails) -> Result<()> {
    if out.is_empty() {
        return Ok(());
    }
    let cols: Vec<&str> = first_line(out).split('|').collect();
    if cols.len() != 2 {
        return Err(Error::NodeDetailsError(format!(
            "expected 2 columns from storage_locations query but got {}",
            cols.len()
        )));
    }
    details.max_depot_size = cols[0]
        .parse()
        .map_err(|_| Error::NodeDetailsError(format!("invalid depot max size {:?}", cols[0])))?;
    details.depot_disk_percent_size = cols[1].to_string();
    Ok(())
}

// ----------------------------------------------------------------------------
// HTTPS
// ----------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct NodeList {
    #[serde(default)]
    node_list: Vec<NodeEntry>,
}

#[derive(Debug, Deserialize)]
struct NodeEntry {
    #[serde(default)]
    address: String,
    #[serde(default)]
    is_readonly: bool,
    /// Reported as a number by some server versions and a string by others
    #[serde(default)]
    subcluster_id: Value,
    #[serde(default)]
    sandbox_name: String,
    #[serde(default)]
    number_shard_subscriptions: i32,
}

#[derive(Debug, Deserialize)]
struct StorageLocationList {
    #[serde(default)]
    storage_location_list: Vec<StorageLocation>,
}

#[derive(Debug, Deserialize)]
struct StorageLocation {
    #[serde(default)]
    location_usage_type: String,
    #[serde(default)]
    max_size: u64,
    #[serde(default)]
    disk_percent: String,
}

/// Reads node details from the server's HTTPS service. Servers use
/// self-signed certificates, so certificate validation is off.
pub struct HttpsNodeDetailsFetcher {
    http_client: Client,
    base_url: String,
    pod_ip: String,
    superuser: String,
    password: String,
}

impl HttpsNodeDetailsFetcher {
    pub fn new(pod_ip: &str, superuser: &str, password: &str) -> Result<Self> {
        let host = match pod_ip.parse::<IpAddr>() {
            Ok(IpAddr::V6(_)) => format!("[{pod_ip}]"),
            _ => pod_ip.to_string(),
        };
        Self::with_base_url(
            &format!("https://{host}:{VERTICA_HTTP_PORT}"),
            pod_ip,
            superuser,
            password,
        )
    }

    pub fn with_base_url(
        base_url: &str,
        pod_ip: &str,
        superuser: &str,
        password: &str,
    ) -> Result<Self> {
        let http_client = Client::builder()
            .timeout(HTTP_TIMEOUT)
            .danger_accept_invalid_certs(true)
            .build()?;
        Ok(Self {
            http_client,
            base_url: base_url.trim_end_matches('/').to_string(),
            pod_ip: pod_ip.to_string(),
            superuser: superuser.to_string(),
            password: password.to_string(),
        })
    }

    async fn get<T: for<'de> Deserialize<'de>>(&self, path: &str) -> Result<T> {
        let url = format!("{}{}", self.base_url, path);
        debug!("Fetching node details from {}", url);
        let response = self
            .http_client
            .get(&url)
            .basic_auth(&self.superuser, Some(&self.password))
            .send()
            .await?
            .error_for_status()?;
        Ok(response.json().await?)
    }
}

#[async_trait]
impl NodeDetailsFetcher for HttpsNodeDetailsFetcher {
    async fn fetch_node_details(&self) -> Result<NodeDetails> {
        let nodes: NodeList = self.get("/v1/node").await?;
        // The endpoint answers for the node it is called on; older servers
        // list every node, so match on the address.
        let node = nodes
            .node_list
            .iter()
            .find(|n| n.address == self.pod_ip)
            .or_else(|| nodes.node_list.first())
            .ok_or_else(|| Error::NodeDetailsError("node list is empty".to_string()))?;

        let mut details = NodeDetails {
            read_only: node.is_readonly,
            subcluster_oid: match &node.subcluster_id {
                Value::String(s) => s.clone(),
                Value::Number(n) => n.to_string(),
                _ => String::new(),
            },
            sandbox_name: node.sandbox_name.clone(),
            shard_subscriptions: node.number_shard_subscriptions,
            ..Default::default()
        };

        let locations: StorageLocationList = self.get("/v1/node/storage-locations").await?;
        if let Some(depot) = locations
            .storage_location_list
            .iter()
            .find(|l| l.location_usage_type == "DEPOT")
        {
            details.max_depot_size = depot.max_size;
            details.depot_disk_percent_size = depot.disk_percent.clone();
        }
        Ok(details)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::testing::{make_vdb, CallKind, FakePodRunner};
    use crate::crd::{SubclusterType, VERSION_ANNOTATION};
    use std::collections::BTreeMap;
    use wiremock::matchers::{header_exists, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn versioned_vdb(version: &str, shard_count: i32) -> VerticaDB {
        let mut vdb = make_vdb(&[("main", 3, SubclusterType::Primary)]);
        vdb.spec.shard_count = shard_count;
        vdb.metadata
            .annotations
            .get_or_insert_with(BTreeMap::new)
            .insert(VERSION_ANNOTATION.to_string(), version.to_string());
        vdb
    }

    fn fetcher<'a>(
        runner: &'a FakePodRunner,
        vdb: &'a VerticaDB,
        pod: &'a NamespacedName,
    ) -> VsqlNodeDetailsFetcher<'a> {
        VsqlNodeDetailsFetcher {
            runner,
            vdb,
            pod,
            container: "server",
            vnode_name: "v_vertdb_node0001",
        }
    }

    #[test]
    fn test_node_state_query_columns() {
        let runner = FakePodRunner::new();
        let pod = NamespacedName::new("default", "v-main-0");

        let vdb = versioned_vdb("v12.0.4", 6);
        let q = fetcher(&runner, &vdb, &pod).node_state_query();
        assert!(q.starts_with(
            "select n.node_name, node_state, subcluster_oid, is_readonly, n.sandbox from nodes as n, subclusters as s"
        ));

        let vdb = versioned_vdb("v11.0.1", 6);
        let q = fetcher(&runner, &vdb, &pod).node_state_query();
        assert!(q.starts_with("select n.node_name, node_state, subcluster_oid from"));

        let vdb = versioned_vdb("v24.1.0", 0);
        let q = fetcher(&runner, &vdb, &pod).node_state_query();
        assert_eq!(
            q,
            "select n.node_name, node_state, '', is_readonly from nodes as n \
             where n.node_name in (select node_name from current_session)"
        );
    }

    #[test]
    fn test_parse_node_state() {
        let mut d = NodeDetails::default();
        parse_node_state("v_db_node0001|UP|123456|t|sb1\n", &mut d).unwrap();
        assert_eq!(d.subcluster_oid, "123456");
        assert!(d.read_only);
        assert_eq!(d.sandbox_name, "sb1");

        let mut d = NodeDetails::default();
        parse_node_state("v_db_node0001|UP|123456", &mut d).unwrap();
        assert!(!d.read_only);
        assert_eq!(d.sandbox_name, "");

        let mut d = NodeDetails::default();
        parse_node_state("", &mut d).unwrap();
        assert_eq!(d, NodeDetails::default());

        assert!(parse_node_state("v_db_node0001|UP", &mut d).is_err());
    }

    #[test]
    fn test_parse_shards_and_depot() {
        let mut d = NodeDetails::default();
        parse_shard_subscriptions("4\n", &mut d).unwrap();
        assert_eq!(d.shard_subscriptions, 4);
        assert!(parse_shard_subscriptions("four", &mut d).is_err());

        parse_depot_details("1073741824|60%\n", &mut d).unwrap();
        assert_eq!(d.max_depot_size, 1073741824);
        assert_eq!(d.depot_disk_percent_size, "60%");
        assert!(parse_depot_details("1|2|3", &mut d).is_err());
        assert!(parse_depot_details("big|60%", &mut d).is_err());
    }

    #[tokio::test]
    async fn test_vsql_fetch_runs_three_queries() {
        let runner = FakePodRunner::new();
        let pod = NamespacedName::new("default", "v-main-0");
        runner.push_stdout(&pod, "v_vertdb_node0001|UP|999|f|\n");
        runner.push_stdout(&pod, "3\n");
        runner.push_stdout(&pod, "2048|50%\n");

        let vdb = versioned_vdb("v12.0.4", 6);
        let details = fetcher(&runner, &vdb, &pod).fetch_node_details().await.unwrap();
        assert_eq!(
            details,
            NodeDetails {
                read_only: false,
                subcluster_oid: "999".to_string(),
                sandbox_name: String::new(),
                shard_subscriptions: 3,
                max_depot_size: 2048,
                depot_disk_percent_size: "50%".to_string(),
            }
        );

        let calls = runner.calls();
        assert_eq!(calls.len(), 3);
        assert!(calls.iter().all(|c| c.kind == CallKind::Vsql));
        assert_eq!(calls[0].command[0], "-tAc");
        assert!(calls[1].command[1].contains("node_name = 'v_vertdb_node0001'"));
    }

    #[tokio::test]
    async fn test_vsql_fetch_stops_on_exec_error() {
        let runner = FakePodRunner::new();
        let pod = NamespacedName::new("default", "v-main-0");
        runner.push_failure(&pod, "vsql: could not connect");
        let vdb = versioned_vdb("v12.0.4", 6);
        assert!(fetcher(&runner, &vdb, &pod).fetch_node_details().await.is_err());
        assert_eq!(runner.call_count(), 1);
    }

    #[tokio::test]
    async fn test_https_fetch() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/node"))
            .and(header_exists("authorization"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "node_list": [
                    {"name": "v_vertdb_node0002", "address": "10.0.0.2", "state": "UP",
                     "is_readonly": false, "subcluster_id": 1, "sandbox_name": "",
                     "number_shard_subscriptions": 1},
                    {"name": "v_vertdb_node0001", "address": "10.0.0.1", "state": "UP",
                     "is_readonly": true, "subcluster_id": 45035996273704980_u64,
                     "sandbox_name": "sb1", "number_shard_subscriptions": 7}
                ]
            })))
            .mount(&mock_server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1/node/storage-locations"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "storage_location_list": [
                    {"node_name": "v_vertdb_node0001", "location_usage_type": "DATA,TEMP",
                     "max_size": 0, "disk_percent": ""},
                    {"node_name": "v_vertdb_node0001", "location_usage_type": "DEPOT",
                     "max_size": 4096, "disk_percent": "60%"}
                ]
            })))
            .mount(&mock_server)
            .await;

        let fetcher =
            HttpsNodeDetailsFetcher::with_base_url(&mock_server.uri(), "10.0.0.1", "dbadmin", "pw")
                .unwrap();
        let details = fetcher.fetch_node_details().await.unwrap();
        assert!(details.read_only);
        assert_eq!(details.subcluster_oid, "45035996273704980");
        assert_eq!(details.sandbox_name, "sb1");
        assert_eq!(details.shard_subscriptions, 7);
        assert_eq!(details.max_depot_size, 4096);
        assert_eq!(details.depot_disk_percent_size, "60%");
    }

    #[tokio::test]
    async fn test_https_fetch_error_status() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/node"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&mock_server)
            .await;
        let fetcher =
            HttpsNodeDetailsFetcher::with_base_url(&mock_server.uri(), "10.0.0.1", "dbadmin", "bad")
                .unwrap();
        assert!(fetcher.fetch_node_details().await.is_err());
    }
}
