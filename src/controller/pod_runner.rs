//! Remote command execution inside pod containers
//!
//! [`PodRunner`] is the seam between the controller and the pods it manages.
//! The production implementation, [`KubePodRunner`], uses the pod `exec`
//! subresource over a websocket. Tests substitute a scripted fake.
//!
//! Copies never use the exec stdin channel. kube closes the websocket as soon
//! as stdin reaches EOF, which would drop the output of the post-copy command,
//! so file content travels base64 encoded inside the command itself.

use std::path::Path;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Status;
use kube::api::{Api, AttachParams};
use kube::Client;
use tokio::io::AsyncReadExt;
use tracing::{debug, info};

use crate::controller::meta::{NamespacedName, ADMINTOOLS_CONF, SERVER_CONTAINER};
use crate::error::{Error, Result};

/// Captured output of a successful command
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    pub fn stdout(s: impl Into<String>) -> Self {
        Self {
            stdout: s.into(),
            stderr: String::new(),
        }
    }
}

#[async_trait]
pub trait PodRunner: Send + Sync {
    /// Run `command` in `container` of `pod`. A non-zero exit or a transport
    /// failure is returned as [`Error::ExecError`] carrying the stderr.
    async fn exec_in_pod(
        &self,
        pod: &NamespacedName,
        container: &str,
        command: &[String],
    ) -> Result<ExecOutput>;

    /// Run vsql with the superuser credentials prepended
    async fn exec_vsql(
        &self,
        pod: &NamespacedName,
        container: &str,
        command: &[String],
    ) -> Result<ExecOutput>;

    /// Write the content of `source` to `dest` inside the container, then
    /// run `post_copy` (if any) in the same exec.
    async fn copy_to_pod(
        &self,
        pod: &NamespacedName,
        container: &str,
        source: &Path,
        dest: &str,
        post_copy: &[String],
    ) -> Result<ExecOutput>;

    /// Log the node and host lines of admintools.conf. Errors are ignored.
    async fn dump_admintools_conf(&self, pod: &NamespacedName) {
        let cmd = vec![
            "bash".to_string(),
            "-c".to_string(),
            format!("ls -l {ADMINTOOLS_CONF} && grep '^node\\|^v_\\|^host' {ADMINTOOLS_CONF}"),
        ];
        match self.exec_in_pod(pod, SERVER_CONTAINER, &cmd).await {
            Ok(out) => info!("{} in pod {}:\n{}", ADMINTOOLS_CONF, pod, out.stdout),
            Err(e) => debug!("Could not dump {} in pod {}: {}", ADMINTOOLS_CONF, pod, e),
        }
    }
}

/// Build the vsql invocation for the given superuser and password
pub fn vsql_command(superuser: &str, password: &str, args: &[String]) -> Vec<String> {
    let mut cmd = vec!["vsql".to_string(), "-U".to_string(), superuser.to_string()];
    if !password.is_empty() {
        cmd.push("--password".to_string());
        cmd.push(password.to_string());
    }
    cmd.extend(args.iter().cloned());
    cmd
}

/// Largest file [`KubePodRunner::copy_to_pod`] inlines into a command. The
/// encoded form has to fit in one argv string of the container's shell.
pub const MAX_INLINE_COPY_BYTES: usize = 96 * 1024;

/// Shell command that decodes `content` into `dest` and then runs `post_copy`
pub fn copy_command(dest: &str, content: &[u8], post_copy: &[String]) -> Vec<String> {
    let encoded = STANDARD.encode(content);
    let mut script = format!("printf '%s' '{encoded}' | base64 -d > {dest}");
    if !post_copy.is_empty() {
        script.push_str(" && ");
        script.push_str(&post_copy.join(" "));
    }
    vec!["sh".to_string(), "-c".to_string(), script]
}

const SENSITIVE_SETTINGS: [&str; 3] = ["awsauth = ", "GCSAuth = ", "AzureStorageCredentials = "];

/// Render a command for logging with credentials masked
pub fn obfuscate_command(command: &[String]) -> String {
    let mut out = Vec::with_capacity(command.len());
    let mut iter = command.iter();
    while let Some(arg) = iter.next() {
        if arg == "--password" {
            out.push(arg.clone());
            if iter.next().is_some() {
                out.push("****".to_string());
            }
            continue;
        }
        out.push(obfuscate_arg(arg));
    }
    out.join(" ")
}

fn obfuscate_arg(arg: &str) -> String {
    let mut s = arg.to_string();
    for setting in SENSITIVE_SETTINGS {
        if let Some(pos) = s.find(setting) {
            s.truncate(pos + setting.len());
            s.push_str("****");
        }
    }
    s
}

/// [`PodRunner`] backed by the Kubernetes exec subresource
#[derive(Clone)]
pub struct KubePodRunner {
    client: Client,
    superuser: String,
    password: String,
}

impl KubePodRunner {
    pub fn new(client: Client, superuser: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            client,
            superuser: superuser.into(),
            password: password.into(),
        }
    }

    async fn run(
        &self,
        pod: &NamespacedName,
        container: &str,
        command: Vec<String>,
        logged: String,
    ) -> Result<ExecOutput> {
        info!("Exec in pod {} (container {}): {}", pod, container, logged);

        let exec_error = |message: String, stderr: String| Error::ExecError {
            pod: pod.to_string(),
            container: container.to_string(),
            message,
            stderr,
        };

        let api: Api<Pod> = Api::namespaced(self.client.clone(), &pod.namespace);
        let params = AttachParams::default()
            .container(container)
            .stdin(false)
            .stdout(true)
            .stderr(true);
        let mut attached = api
            .exec(&pod.name, command, &params)
            .await
            .map_err(|e| exec_error(e.to_string(), String::new()))?;

        let mut stdout_reader = attached.stdout();
        let mut stderr_reader = attached.stderr();
        let status = attached.take_status();

        let read_stdout = async {
            let mut buf = Vec::new();
            if let Some(r) = stdout_reader.as_mut() {
                r.read_to_end(&mut buf).await?;
            }
            Ok::<_, std::io::Error>(buf)
        };
        let read_stderr = async {
            let mut buf = Vec::new();
            if let Some(r) = stderr_reader.as_mut() {
                r.read_to_end(&mut buf).await?;
            }
            Ok::<_, std::io::Error>(buf)
        };
        let (stdout, stderr) = tokio::try_join!(read_stdout, read_stderr)?;
        let output = ExecOutput {
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
        };
        debug!(
            "Exec in pod {} finished: stdout={:?} stderr={:?}",
            pod, output.stdout, output.stderr
        );

        let status = match status {
            Some(fut) => fut.await,
            None => None,
        };
        attached
            .join()
            .await
            .map_err(|e| exec_error(e.to_string(), output.stderr.clone()))?;

        match exit_status(status) {
            Ok(()) => Ok(output),
            Err(message) => Err(exec_error(message, output.stderr)),
        }
    }
}

/// Map the final status of an exec stream to success or a failure message.
/// A stream that ends without a status lost its output and is a failure.
fn exit_status(status: Option<Status>) -> std::result::Result<(), String> {
    let Some(status) = status else {
        return Err("exec stream closed without an exit status".to_string());
    };
    if status.status.as_deref() == Some("Success") {
        return Ok(());
    }
    Err(status
        .message
        .or(status.reason)
        .unwrap_or_else(|| "command failed".to_string()))
}

#[async_trait]
impl PodRunner for KubePodRunner {
    async fn exec_in_pod(
        &self,
        pod: &NamespacedName,
        container: &str,
        command: &[String],
    ) -> Result<ExecOutput> {
        self.run(pod, container, command.to_vec(), obfuscate_command(command))
            .await
    }

    async fn exec_vsql(
        &self,
        pod: &NamespacedName,
        container: &str,
        command: &[String],
    ) -> Result<ExecOutput> {
        let cmd = vsql_command(&self.superuser, &self.password, command);
        let logged = obfuscate_command(&cmd);
        self.run(pod, container, cmd, logged).await
    }

    async fn copy_to_pod(
        &self,
        pod: &NamespacedName,
        container: &str,
        source: &Path,
        dest: &str,
        post_copy: &[String],
    ) -> Result<ExecOutput> {
        let content = tokio::fs::read(source).await?;
        if content.len() > MAX_INLINE_COPY_BYTES {
            return Err(Error::ConfigError(format!(
                "{} is {} bytes, over the {} byte copy limit",
                source.display(),
                content.len(),
                MAX_INLINE_COPY_BYTES
            )));
        }
        let logged = format!(
            "copy {} bytes to {} then {}",
            content.len(),
            dest,
            obfuscate_command(post_copy)
        );
        self.run(pod, container, copy_command(dest, &content, post_copy), logged)
            .await
    }
}
