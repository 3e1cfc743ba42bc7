//! Archive locator
//!
//! Finds the archive produced by a capture by walking the serviceability
//! convention inside the target container:
//!
//! ```text
//! <root>/<namespace>/<capture-id>/<archive>.zip
//! ```
//!
//! Both levels are listed with `ls -1tp`, which orders entries newest first by
//! modification time, and the first entry is taken at each level. Older
//! archives in the same directory are ignored.

use crate::tasks::exec::{PodExec, PodRef};
use crate::tasks::types::{Error, Result};
use tracing::debug;

/// Entry kind kept from a listing
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EntryKind {
    Directory,
    File,
}

/// `<root>/<namespace>`
#[must_use]
pub fn convention_root(root: &str, namespace: &str) -> String {
    format!("{}/{}", root.trim_end_matches('/'), namespace)
}

/// Parse `ls -1p` output, keeping only entries of the requested kind in listing order
#[must_use]
pub fn parse_listing(stdout: &str, kind: EntryKind) -> Vec<String> {
    stdout
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter_map(|line| match (kind, line.strip_suffix('/')) {
            (EntryKind::Directory, Some(dir)) => Some(dir.to_string()),
            (EntryKind::File, None) => Some(line.to_string()),
            _ => None,
        })
        .collect()
}

/// Pick the most recent entry from a newest-first listing
#[must_use]
pub fn select_newest(entries: &[String]) -> Option<&str> {
    entries.first().map(String::as_str)
}

pub struct ArchiveLocator<'a> {
    exec: &'a dyn PodExec,
    root: &'a str,
}

impl<'a> ArchiveLocator<'a> {
    #[must_use]
    pub fn new(exec: &'a dyn PodExec, root: &'a str) -> Self {
        Self { exec, root }
    }

    /// Path of the newest archive, or `None` if nothing has been written yet.
    ///
    /// A missing convention root is `Error::NotFound`; a capture directory that
    /// vanished between the two listings counts as "not yet".
    pub async fn locate(&self, target: &PodRef) -> Result<Option<String>> {
        let root = convention_root(self.root, &target.namespace);

        let Some(listing) = self.list(target, &root).await? else {
            return Err(Error::NotFound(format!(
                "serviceability directory {root} does not exist in {target}"
            )));
        };
        let directories = parse_listing(&listing, EntryKind::Directory);
        let Some(newest_dir) = select_newest(&directories) else {
            debug!(pod = %target, root = %root, "No capture directories yet");
            return Ok(None);
        };

        let capture_dir = format!("{root}/{newest_dir}");
        let Some(listing) = self.list(target, &capture_dir).await? else {
            debug!(pod = %target, dir = %capture_dir, "Capture directory disappeared");
            return Ok(None);
        };
        let files = parse_listing(&listing, EntryKind::File);
        let Some(archive) = select_newest(&files) else {
            debug!(pod = %target, dir = %capture_dir, "Capture directory is still empty");
            return Ok(None);
        };

        Ok(Some(format!("{capture_dir}/{archive}")))
    }

    /// `ls -1tp <dir>`; `None` when the directory does not exist
    async fn list(&self, target: &PodRef, dir: &str) -> Result<Option<String>> {
        let command = vec!["ls".to_string(), "-1tp".to_string(), dir.to_string()];
        let output = self.exec.exec(target, &command).await?;

        if output.success() {
            return Ok(Some(output.stdout));
        }
        if output.stderr.contains("No such file or directory") {
            return Ok(None);
        }
        Err(Error::TransientExec(format!(
            "listing {dir} in {target} exited with code {}: {}",
            output.exit_code,
            output.stderr.trim()
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::exec::{ExecOutput, MockPodExec};

    fn target() -> PodRef {
        PodRef {
            namespace: "ns1".to_string(),
            name: "p".to_string(),
            container: "app".to_string(),
        }
    }

    fn ok(stdout: &str) -> ExecOutput {
        ExecOutput {
            stdout: stdout.to_string(),
            stderr: String::new(),
            exit_code: 0,
        }
    }

    fn missing(dir: &str) -> ExecOutput {
        ExecOutput {
            stdout: String::new(),
            stderr: format!("ls: cannot access '{dir}': No such file or directory"),
            exit_code: 2,
        }
    }

    #[test]
    fn selects_first_entry_of_newest_first_listing() {
        let entries = vec!["d3".to_string(), "d1".to_string(), "d2".to_string()];
        assert_eq!(select_newest(&entries), Some("d3"));
        assert_eq!(select_newest(&[]), None);
    }

    #[test]
    fn parse_listing_splits_directories_and_files() {
        let stdout = "20240101-1200/\nstray.log\n\n20231231-0900/\n";
        assert_eq!(
            parse_listing(stdout, EntryKind::Directory),
            vec!["20240101-1200", "20231231-0900"]
        );
        assert_eq!(parse_listing(stdout, EntryKind::File), vec!["stray.log"]);
    }

    #[test]
    fn convention_root_tolerates_trailing_slash() {
        assert_eq!(convention_root("serviceability/", "ns1"), "serviceability/ns1");
    }

    #[tokio::test]
    async fn locates_newest_archive_in_newest_directory() {
        let mut exec = MockPodExec::new();
        exec.expect_exec().returning(|_, command| {
            Ok(match command[2].as_str() {
                "serviceability/ns1" => ok("20240101-1200/\n20231231-0900/\n"),
                "serviceability/ns1/20240101-1200" => ok("dump.zip\nold.zip\n"),
                other => missing(other),
            })
        });

        let locator = ArchiveLocator::new(&exec, "serviceability");
        let found = locator.locate(&target()).await.unwrap();
        assert_eq!(
            found.as_deref(),
            Some("serviceability/ns1/20240101-1200/dump.zip")
        );
    }

    #[tokio::test]
    async fn empty_listings_are_not_yet_found() {
        let mut exec = MockPodExec::new();
        exec.expect_exec().times(1).returning(|_, _| Ok(ok("")));
        let locator = ArchiveLocator::new(&exec, "serviceability");
        assert_eq!(locator.locate(&target()).await.unwrap(), None);

        let mut exec = MockPodExec::new();
        exec.expect_exec().returning(|_, command| {
            Ok(if command[2] == "serviceability/ns1" {
                ok("20240101-1200/\n")
            } else {
                ok("")
            })
        });
        let locator = ArchiveLocator::new(&exec, "serviceability");
        assert_eq!(locator.locate(&target()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn missing_root_is_not_found() {
        let mut exec = MockPodExec::new();
        exec.expect_exec()
            .returning(|_, command| Ok(missing(&command[2])));

        let err = ArchiveLocator::new(&exec, "serviceability")
            .locate(&target())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn other_listing_failures_are_transient() {
        let mut exec = MockPodExec::new();
        exec.expect_exec().returning(|_, _| {
            Ok(ExecOutput {
                stdout: String::new(),
                stderr: "ls: Permission denied".to_string(),
                exit_code: 1,
            })
        });

        let err = ArchiveLocator::new(&exec, "serviceability")
            .locate(&target())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::TransientExec(_)));
    }
}
