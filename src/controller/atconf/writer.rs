//! Generates a new admintools.conf with hosts added or removed.
//!
//! Each call starts from a base file (a built-in skeleton or the live file of
//! a source pod), edits the owned [`IniFile`] and writes the result to a new
//! temporary file. The caller owns the returned path and must remove it.

use std::collections::{BTreeSet, HashSet};
use std::net::IpAddr;
use std::path::PathBuf;

use tracing::{debug, instrument, warn};

use super::ini::IniFile;
use crate::controller::meta::{NamespacedName, ADMINTOOLS_CONF, SERVER_CONTAINER};
use crate::controller::pod_runner::PodRunner;
use crate::crd::VerticaDB;
use crate::error::Result;

pub const CLUSTER_SECTION: &str = "Cluster";
pub const NODES_SECTION: &str = "Nodes";
pub const CONFIGURATION_SECTION: &str = "Configuration";
pub const CLUSTER_HOSTS_OPTION: &str = "hosts";
pub const CONFIGURATION_IPV6_OPTION: &str = "ipv6";

const NODE_PREFIX: &str = "node";
const KEY_VALUE_DELIMITER: &str = " = ";

/// admintools.conf used when there is no existing cluster to copy from
pub const DEFAULT_ADMINTOOLS_CONF: &str = "\
[Configuration]
format = 3
install_opts =
default_base = /home/dbadmin
controlmode = pt2pt
controlsubnet = default
spreadlog = False
last_port = 5433
tmp_dir = /tmp
atdebug = False
atgui_default_license = False
unreachable_host_caching = True
aws_metadata_conn_timeout = 2
rebalance_shards_timeout = 36000
database_state_change_poll_timeout = 21600
wait_for_shutdown_timeout = 3600
pexpect_verbose_logging = False
sync_catalog_retries = 2000
client_connect_timeout_sec = 5.0
admintools_config_version = 110
thread_timeout = 1200

[Cluster]

[Nodes]

[SSHConfig]
ssh_user =
ssh_ident =
ssh_options = -oConnectTimeout=30 -o TCPKeepAlive=no -o ServerAliveInterval=15 -o ServerAliveCountMax=2 -o StrictHostKeyChecking=no -o BatchMode=yes

[BootstrapParameters]
awsendpoint = null
awsregion = null
";

/// Edits admintools.conf on behalf of the install and scale-in actors
pub struct FileWriter<'a> {
    runner: &'a dyn PodRunner,
    vdb: &'a VerticaDB,
}

impl<'a> FileWriter<'a> {
    pub fn new(runner: &'a dyn PodRunner, vdb: &'a VerticaDB) -> Self {
        Self { runner, vdb }
    }

    /// Add `ips` as hosts, each with a new node entry. Hosts already present
    /// are left untouched. An empty `source_pod` builds from the default
    /// skeleton.
    #[instrument(skip(self), fields(source_pod = %source_pod))]
    pub async fn add_hosts(&self, source_pod: &NamespacedName, ips: &[String]) -> Result<PathBuf> {
        let conf = self.load_base(source_pod).await?;
        let conf = set_ipv6_flag(conf, ips);
        let conf = self.add_new_hosts(conf, ips);
        save(conf).await
    }

    /// Remove `ips` from the host list along with their node entries. Hosts
    /// that are not present are ignored.
    #[instrument(skip(self), fields(source_pod = %source_pod))]
    pub async fn remove_hosts(
        &self,
        source_pod: &NamespacedName,
        ips: &[String],
    ) -> Result<PathBuf> {
        let conf = self.load_base(source_pod).await?;
        let conf = remove_from_cluster_hosts(conf, ips);
        let conf = remove_nodes(conf, ips);
        save(conf).await
    }

    /// Parsed base file. When the source pod's copy can't be parsed, its
    /// node and host lines are dumped to the log before the error is returned.
    async fn load_base(&self, source_pod: &NamespacedName) -> Result<IniFile> {
        let base = self.create_base(source_pod).await;
        match IniFile::parse(&base) {
            Ok(conf) => Ok(conf),
            Err(e) => {
                warn!("Unable to parse {} from pod {}: {}", ADMINTOOLS_CONF, source_pod, e);
                self.runner.dump_admintools_conf(source_pod).await;
                Err(e)
            }
        }
    }

    /// Content to start from. A failure to read the file from the source pod
    /// is logged and yields an empty base.
    async fn create_base(&self, source_pod: &NamespacedName) -> String {
        if source_pod.is_empty() {
            return DEFAULT_ADMINTOOLS_CONF.to_string();
        }
        let cmd = vec!["cat".to_string(), ADMINTOOLS_CONF.to_string()];
        match self
            .runner
            .exec_in_pod(source_pod, SERVER_CONTAINER, &cmd)
            .await
        {
            Ok(out) => out.stdout,
            Err(e) => {
                warn!(
                    "Failed to read {} from pod {}, starting from an empty file: {}",
                    ADMINTOOLS_CONF, source_pod, e
                );
                String::new()
            }
        }
    }

    fn add_new_hosts(&self, mut conf: IniFile, ips: &[String]) -> IniFile {
        let mut hosts = host_list(&conf).unwrap_or_default();
        let mut existing: HashSet<String> = hosts.iter().cloned().collect();
        let mut in_use = nodes_in_use(&conf);

        for ip in ips {
            if !existing.insert(ip.clone()) {
                continue;
            }
            hosts.push(ip.clone());
            let number = next_node_number(&mut in_use);
            let node_name = format!("{NODE_PREFIX}{number:04}");
            let node_info = format!(
                "{},{},{}",
                ip,
                self.vdb.catalog_path(),
                self.vdb.spec.local.data_path
            );
            debug!("Assigning {} to {}", ip, node_name);
            conf.set(NODES_SECTION, &node_name, node_info);
        }
        conf.set(CLUSTER_SECTION, CLUSTER_HOSTS_OPTION, hosts.join(","));
        conf
    }
}

/// Hosts in file order; `None` when the option is absent
fn host_list(conf: &IniFile) -> Option<Vec<String>> {
    let line = conf.get(CLUSTER_SECTION, CLUSTER_HOSTS_OPTION)?;
    Some(
        line.split(',')
            .map(str::trim)
            .filter(|h| !h.is_empty())
            .map(str::to_string)
            .collect(),
    )
}

/// The address family of the first IP decides the flag
fn set_ipv6_flag(mut conf: IniFile, ips: &[String]) -> IniFile {
    let Some(first) = ips.first() else {
        return conf;
    };
    let value = if is_ipv6(first) { "True" } else { "False" };
    conf.set(CONFIGURATION_SECTION, CONFIGURATION_IPV6_OPTION, value);
    conf
}

fn is_ipv6(ip: &str) -> bool {
    matches!(ip.parse::<IpAddr>(), Ok(IpAddr::V6(_)))
}

fn remove_from_cluster_hosts(mut conf: IniFile, ips: &[String]) -> IniFile {
    let mut hosts = host_list(&conf).unwrap_or_default();
    for ip in ips {
        if let Some(pos) = hosts.iter().position(|h| h == ip) {
            hosts.remove(pos);
        }
    }
    conf.set(CLUSTER_SECTION, CLUSTER_HOSTS_OPTION, hosts.join(","));
    conf
}

fn remove_nodes(mut conf: IniFile, ips: &[String]) -> IniFile {
    let doomed: Vec<String> = match conf.section(NODES_SECTION) {
        Some(nodes) => nodes
            .items()
            .filter(|(_, details)| {
                let node_ip = details.split(',').next().unwrap_or_default().trim();
                ips.iter().any(|ip| ip == node_ip)
            })
            .map(|(k, _)| k.to_string())
            .collect(),
        None => return conf,
    };
    let nodes = conf.section_mut(NODES_SECTION);
    for key in doomed {
        nodes.remove(&key);
    }
    conf
}

/// Node numbers already taken. node0000 is never used by Vertica.
fn nodes_in_use(conf: &IniFile) -> BTreeSet<u32> {
    let mut in_use = BTreeSet::from([0]);
    if let Some(nodes) = conf.section(NODES_SECTION) {
        for (key, _) in nodes.items() {
            if let Some(n) = key
                .strip_prefix(NODE_PREFIX)
                .and_then(|n| n.parse::<u32>().ok())
            {
                in_use.insert(n);
            }
        }
    }
    in_use
}

/// Smallest free node number; marks it as used
fn next_node_number(in_use: &mut BTreeSet<u32>) -> u32 {
    let mut candidate = 0;
    while in_use.contains(&candidate) {
        candidate += 1;
    }
    in_use.insert(candidate);
    candidate
}

async fn save(conf: IniFile) -> Result<PathBuf> {
    let path = tempfile::Builder::new()
        .prefix("admintools.conf.")
        .tempfile()?
        .into_temp_path()
        .keep()
        .map_err(std::io::Error::from)?;
    tokio::fs::write(&path, conf.write_to_string(KEY_VALUE_DELIMITER)).await?;
    Ok(path)
}
