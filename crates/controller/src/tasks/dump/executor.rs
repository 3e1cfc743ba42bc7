//! Dump executor
//!
//! Starts a dump inside the target container and returns as soon as the
//! launcher has been forked; it never waits for the archive. Completion is
//! detected separately by the archive locator.

use super::locator::convention_root;
use crate::crds::CaptureKind;
use crate::tasks::config::DumpConfig;
use crate::tasks::exec::{ExecOutput, PodExec, PodRef};
use crate::tasks::types::{Error, Result};
use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use tracing::{debug, info, warn};

/// File name of the archive written into each capture directory
pub const ARCHIVE_FILE_NAME: &str = "dump.zip";

/// A successfully launched capture
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DumpDispatch {
    pub capture_id: String,
    pub capture_dir: String,
    pub output: ExecOutput,
}

pub struct DumpExecutor<'a> {
    exec: &'a dyn PodExec,
    config: &'a DumpConfig,
}

impl<'a> DumpExecutor<'a> {
    #[must_use]
    pub fn new(exec: &'a dyn PodExec, config: &'a DumpConfig) -> Self {
        Self { exec, config }
    }

    /// One subdirectory per invocation: `<dispatch time>-<request name>`
    #[must_use]
    pub fn capture_id(now: DateTime<Utc>, request: &str) -> String {
        format!("{}-{request}", now.format("%Y%m%d-%H%M%S"))
    }

    /// `<root>/<namespace>/<capture-id>`
    #[must_use]
    pub fn capture_dir(root: &str, namespace: &str, now: DateTime<Utc>, request: &str) -> String {
        format!(
            "{}/{}",
            convention_root(root, namespace),
            Self::capture_id(now, request)
        )
    }

    /// Shell command that creates the capture directory and launches the dump detached
    #[must_use]
    pub fn build_command(&self, capture_dir: &str, kinds: &BTreeSet<CaptureKind>) -> Vec<String> {
        let include = kinds
            .iter()
            .filter(|k| **k != CaptureKind::All)
            .map(|k| k.as_str())
            .collect::<Vec<_>>()
            .join(",");
        let archive = format!("{capture_dir}/{ARCHIVE_FILE_NAME}");

        let script = format!(
            "mkdir -p {dir} && nohup {server} dump --archive={archive} --include={include} >/dev/null 2>&1 &",
            dir = shell_quote(capture_dir),
            server = self.config.server_command,
            archive = shell_quote(&archive),
        );

        vec!["/bin/sh".to_string(), "-c".to_string(), script]
    }

    /// Launch the capture.
    ///
    /// `Error::NotFound` when the pod is gone, `Error::TransientExec` for an
    /// unreachable target or a rejected command (non-zero exit).
    pub async fn dispatch(
        &self,
        request: &str,
        target: &PodRef,
        kinds: &BTreeSet<CaptureKind>,
        now: DateTime<Utc>,
    ) -> Result<DumpDispatch> {
        let capture_id = Self::capture_id(now, request);
        let capture_dir = Self::capture_dir(
            &self.config.serviceability_root,
            &target.namespace,
            now,
            request,
        );
        let command = self.build_command(&capture_dir, kinds);

        debug!(pod = %target, capture_dir = %capture_dir, "Dispatching dump command");

        let output = self.exec.exec(target, &command).await?;

        if !output.success() {
            let detail = if output.stderr.trim().is_empty() {
                output.stdout.trim()
            } else {
                output.stderr.trim()
            };
            warn!(
                pod = %target,
                exit_code = output.exit_code,
                output = %detail,
                "Dump command rejected"
            );
            return Err(Error::TransientExec(format!(
                "dump command exited with code {} in {target}: {detail}",
                output.exit_code
            )));
        }

        info!(pod = %target, capture_dir = %capture_dir, "Dump command dispatched");

        Ok(DumpDispatch {
            capture_id,
            capture_dir,
            output,
        })
    }
}

/// Single-quote a value for `/bin/sh`
fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}
