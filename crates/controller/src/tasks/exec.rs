//! Remote command execution inside a target container
//!
//! [`PodExec`] is the seam the dump executor and archive locator are written
//! against. [`KubePodExec`] implements it on top of the pod `exec`
//! subresource; tests substitute in-memory fakes.

use crate::tasks::types::{Error, Result};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Status;
use kube::api::{Api, AttachParams};
use kube::Client;
use std::fmt;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, warn};

/// Identity of the container a command runs in
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct PodRef {
    pub namespace: String,
    pub name: String,
    pub container: String,
}

impl fmt::Display for PodRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{} ({})", self.namespace, self.name, self.container)
    }
}

/// Raw result of a finished remote command
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl ExecOutput {
    #[must_use]
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Run a command in a container and wait for it to exit.
///
/// Implementations return `Error::NotFound` when the pod does not exist and
/// `Error::TransientExec` for anything that may succeed on a later attempt.
/// A non-zero exit is *not* an error at this level.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PodExec: Send + Sync {
    async fn exec(&self, target: &PodRef, command: &[String]) -> Result<ExecOutput>;
}

/// `PodExec` over the Kubernetes exec subresource
pub struct KubePodExec {
    client: Client,
    timeout: Duration,
}

impl KubePodExec {
    #[must_use]
    pub fn new(client: Client, timeout: Duration) -> Self {
        Self { client, timeout }
    }

    async fn run(&self, target: &PodRef, command: &[String]) -> Result<ExecOutput> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &target.namespace);

        let pod = match pods.get_opt(&target.name).await {
            Ok(Some(pod)) => pod,
            Ok(None) => {
                return Err(Error::NotFound(format!(
                    "pod {} does not exist in namespace {}",
                    target.name, target.namespace
                )))
            }
            Err(e) => {
                return Err(Error::TransientExec(format!(
                    "failed to look up pod {}: {e}",
                    target.name
                )))
            }
        };

        let phase = pod
            .status
            .as_ref()
            .and_then(|s| s.phase.as_deref())
            .unwrap_or("Unknown");
        if phase != "Running" {
            return Err(Error::TransientExec(format!(
                "pod {} is in phase {phase}, not Running",
                target.name
            )));
        }

        debug!(pod = %target, command = ?command, "Executing remote command");

        let params = AttachParams::default()
            .container(target.container.clone())
            .stdin(false)
            .stdout(true)
            .stderr(true);

        let mut attached = pods
            .exec(&target.name, command.to_vec(), &params)
            .await
            .map_err(|e| Error::TransientExec(format!("exec into {target} failed: {e}")))?;

        let stdout_reader = attached.stdout();
        let stderr_reader = attached.stderr();
        let status_future = attached.take_status();

        let (stdout, stderr) = tokio::join!(read_stream(stdout_reader), read_stream(stderr_reader));
        let status = match status_future {
            Some(fut) => fut.await,
            None => None,
        };

        if let Err(e) = attached.join().await {
            warn!(pod = %target, error = %e, "Exec stream did not shut down cleanly");
        }

        Ok(ExecOutput {
            stdout,
            stderr,
            exit_code: exit_code_from_status(status.as_ref()),
        })
    }
}

#[async_trait]
impl PodExec for KubePodExec {
    async fn exec(&self, target: &PodRef, command: &[String]) -> Result<ExecOutput> {
        match tokio::time::timeout(self.timeout, self.run(target, command)).await {
            Ok(result) => result,
            Err(_) => Err(Error::TransientExec(format!(
                "command in {target} did not finish within {}s",
                self.timeout.as_secs()
            ))),
        }
    }
}

async fn read_stream<R: AsyncRead + Unpin>(reader: Option<R>) -> String {
    let Some(mut reader) = reader else {
        return String::new();
    };
    let mut buf = Vec::new();
    if let Err(e) = reader.read_to_end(&mut buf).await {
        warn!(error = %e, "Failed to read exec output stream");
    }
    String::from_utf8_lossy(&buf).into_owned()
}

/// Map the exec subresource's final `Status` to a process exit code.
///
/// A missing status means the stream ended without a verdict; that is reported
/// as `-1` so callers treat it as a failed command.
fn exit_code_from_status(status: Option<&Status>) -> i32 {
    let Some(status) = status else {
        return -1;
    };

    if status.status.as_deref() == Some("Success") {
        return 0;
    }

    status
        .details
        .as_ref()
        .and_then(|d| d.causes.as_ref())
        .and_then(|causes| {
            causes
                .iter()
                .find(|c| c.reason.as_deref() == Some("ExitCode"))
                .and_then(|c| c.message.as_deref())
                .and_then(|m| m.trim().parse::<i32>().ok())
        })
        .unwrap_or(-1)
}
