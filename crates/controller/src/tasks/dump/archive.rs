//! Archive contents check
//!
//! Advisory only: a located archive is reported as completed whether or not
//! this check passes. It lists the archive inside the container with
//! `unzip -l` and reports which requested kinds have no matching entry.

use crate::crds::CaptureKind;
use crate::tasks::exec::{PodExec, PodRef};
use crate::tasks::types::{Error, Result};
use lazy_static::lazy_static;
use regex::Regex;
use std::collections::BTreeSet;

lazy_static! {
    // "  1234567  01-01-2024 12:00   heapdump.20240101.120000.1.0001.phd"
    static ref UNZIP_ENTRY: Regex =
        Regex::new(r"^\s*\d+\s+\d{2,4}-\d{2}-\d{2,4}\s+\d{2}:\d{2}\s+(.+?)\s*$")
            .expect("unzip entry pattern is valid");
}

/// Entry names inside one archive
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ArchiveManifest {
    entries: Vec<String>,
}

impl ArchiveManifest {
    #[must_use]
    pub fn from_entries<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            entries: entries.into_iter().map(Into::into).collect(),
        }
    }

    /// Parse the table printed by `unzip -l`
    #[must_use]
    pub fn parse_unzip_listing(stdout: &str) -> Self {
        let entries = stdout
            .lines()
            .filter_map(|line| UNZIP_ENTRY.captures(line))
            .map(|caps| caps[1].to_string())
            .collect();
        Self { entries }
    }

    #[must_use]
    pub fn entries(&self) -> &[String] {
        &self.entries
    }

    /// Whether some entry looks like an artifact of this kind
    #[must_use]
    pub fn contains_kind(&self, kind: CaptureKind) -> bool {
        match kind {
            CaptureKind::Heap => self.entries.iter().any(|e| e.contains("heapdump")),
            CaptureKind::Thread => self.entries.iter().any(|e| e.contains("javacore")),
            CaptureKind::All => {
                self.contains_kind(CaptureKind::Heap) && self.contains_kind(CaptureKind::Thread)
            }
        }
    }

    /// Requested kinds with no matching entry
    #[must_use]
    pub fn missing_kinds(&self, kinds: &BTreeSet<CaptureKind>) -> Vec<CaptureKind> {
        kinds
            .iter()
            .copied()
            .filter(|kind| !self.contains_kind(*kind))
            .collect()
    }
}

/// List an archive inside the target container
pub async fn inspect_archive(
    exec: &dyn PodExec,
    target: &PodRef,
    path: &str,
) -> Result<ArchiveManifest> {
    let command = vec!["unzip".to_string(), "-l".to_string(), path.to_string()];
    let output = exec.exec(target, &command).await?;
    if !output.success() {
        return Err(Error::TransientExec(format!(
            "unzip -l {path} exited with code {}: {}",
            output.exit_code,
            output.stderr.trim()
        )));
    }
    Ok(ArchiveManifest::parse_unzip_listing(&output.stdout))
}
