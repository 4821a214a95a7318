//! The per-pod gather script and the state it reports
//!
//! One script is copied into each running pod and executed in a single exec.
//! It prints YAML whose top-level keys are exactly the fields of
//! [`GatherState`]; the two must change together.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};

use crate::controller::meta::{
    EULA_ACCEPTANCE_FILE, GATHERED_DIRS, GATHERED_FILES, HTTP_SERVER_VERSION_PATH,
    SERVER_CONTAINER, VERTICA_HTTP_PORT,
};
use crate::crd::VerticaDB;
use crate::error::Result;

/// State reported by the gather script. Missing keys take their default.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct GatherState {
    pub install_indicator_exists: bool,
    pub eula_accepted: bool,
    pub dir_exists: BTreeMap<String, bool>,
    pub file_exists: BTreeMap<String, bool>,
    pub db_exists: bool,
    #[serde(rename = "verticaPIDRunning")]
    pub vertica_pid_running: bool,
    pub vertica_process: String,
    pub up_node: bool,
    pub startup_complete: bool,
    pub compat21_node_name: String,
    pub vnode_name: String,
    pub local_data_size: u64,
    pub local_data_avail: u64,
    pub admintools_exists: bool,
}

impl GatherState {
    /// Parse script output. Empty output yields the default state.
    pub fn parse(output: &str) -> Result<Self> {
        if output.trim().is_empty() {
            return Ok(GatherState::default());
        }
        Ok(serde_yaml::from_str(output)?)
    }

    pub fn file_exists(&self, path: &str) -> bool {
        self.file_exists.get(path).copied().unwrap_or(false)
    }
}

/// Inputs the script depends on that come from the pod
pub struct GatherTarget<'a> {
    pub pod_ip: &'a str,
    pub catalog_path: &'a str,
    pub is_primary: bool,
    pub exec_container: &'a str,
}

/// Suffix checked to decide whether a catalog exists. Primaries always hold
/// an up to date catalog, so the config file is required. Secondaries may
/// only have the directory (e.g. right after a revive).
fn catalog_check_suffix(is_primary: bool) -> &'static str {
    if is_primary {
        "Catalog/*config*.cat"
    } else {
        "Catalog"
    }
}

/// curl of the HTTPS version endpoint, printing only the status code
pub fn node_up_command(pod_ip: &str) -> String {
    let host = match pod_ip.parse::<IpAddr>() {
        Ok(IpAddr::V6(_)) => format!("[{pod_ip}]"),
        _ => pod_ip.to_string(),
    };
    format!(
        "curl -k -s -o /dev/null -w '%{{http_code}}' https://{host}:{VERTICA_HTTP_PORT}{HTTP_SERVER_VERSION_PATH}"
    )
}

pub fn gen_gather_script(vdb: &VerticaDB, target: &GatherTarget<'_>) -> String {
    let indicator = vdb.installer_indicator_file();
    let db = &vdb.spec.db_name;
    let db_lower = db.to_lowercase();
    let cat = target.catalog_path;

    let mut s = String::new();
    s.push_str("set -o errexit\nset -o pipefail\n");
    let _ = writeln!(s, "echo -n 'installIndicatorExists: '");
    let _ = writeln!(s, "test -f {indicator} && echo true || echo false");
    let _ = writeln!(s, "echo -n 'eulaAccepted: '");
    let _ = writeln!(s, "test -f {EULA_ACCEPTANCE_FILE} && echo true || echo false");
    let _ = writeln!(s, "echo    'dirExists:'");
    for dir in GATHERED_DIRS {
        let _ = writeln!(s, "echo -n '  {dir}: '");
        let _ = writeln!(s, "test -d {dir} && echo true || echo false");
    }
    let _ = writeln!(s, "echo    'fileExists:'");
    for file in GATHERED_FILES {
        let _ = writeln!(s, "echo -n '  {file}: '");
        let _ = writeln!(s, "test -f {file} && echo true || echo false");
    }
    let _ = writeln!(s, "echo -n 'dbExists: '");
    let _ = writeln!(
        s,
        "ls --almost-all --hide-control-chars -1 {cat}/{db}/v_{db_lower}_node????_catalog/{} 2> /dev/null \\\n  | grep --quiet . && echo true || echo false",
        catalog_check_suffix(target.is_primary)
    );
    let _ = writeln!(s, "echo -n 'compat21NodeName: '");
    let _ = writeln!(
        s,
        "test -f {indicator} && echo -n '\"' && echo -n $(cat {indicator}) && echo '\"' || echo '\"\"'"
    );
    let _ = writeln!(s, "echo -n 'vnodeName: '");
    let _ = writeln!(
        s,
        "cd {cat}/{db}/v_{db_lower}_node????_catalog 2> /dev/null && basename $(pwd) | rev | cut -c9- | rev || echo \"\""
    );
    let _ = writeln!(s, "echo -n 'upNode: '");
    let _ = writeln!(
        s,
        "{} 2> /dev/null | grep --quiet 200 2> /dev/null && echo true || echo false",
        node_up_command(target.pod_ip)
    );
    let _ = writeln!(s, "echo -n 'startupComplete: '");
    let _ = writeln!(
        s,
        "grep --quiet -e 'Startup Complete' -e 'Database Halted' {cat}/{db}/*_catalog/startup.log 2> /dev/null && echo true || echo false"
    );
    let _ = writeln!(s, "echo -n 'localDataSize: '");
    let _ = writeln!(s, "df --block-size=1 --output=size {cat} | tail -1");
    let _ = writeln!(s, "echo -n 'localDataAvail: '");
    let _ = writeln!(s, "df --block-size=1 --output=avail {cat} | tail -1");
    let _ = writeln!(s, "echo -n 'admintoolsExists: '");
    let _ = writeln!(s, "which admintools &> /dev/null && echo true || echo false");

    // The vertica process only lives in the server container. The IP in the
    // pattern excludes a process left over from a previous pod incarnation.
    if target.exec_container == SERVER_CONTAINER {
        let _ = writeln!(s, "echo -n 'verticaPIDRunning: '");
        let _ = writeln!(
            s,
            "[[ $(pgrep -f \"/opt/vertica/bin/vertica.*-h {}\") ]] && echo true || echo false",
            target.pod_ip
        );
        let _ = writeln!(s, "echo -n 'verticaProcess: '");
        let _ = writeln!(s, "pgrep -f \"^.*vertica\\s-D\" -a | tail -1 || echo error");
    }
    s
}
