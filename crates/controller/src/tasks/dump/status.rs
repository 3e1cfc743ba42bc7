//! Status reporter
//!
//! Every status write goes through [`StatusReporter`]: fetch the latest
//! object, upsert one condition by type, write the status subresource with
//! the fetched `resourceVersion`, and on a conflict start over from a fresh
//! read. Writes against an object that already reached a terminal state are
//! dropped, and `Completed=True` is refused unless the stored object already
//! has `Started=True`.

use crate::crds::{ConditionStatus, ConditionType, DumpRequest};
use crate::tasks::store::ResourceStore;
use crate::tasks::types::{Error, Result};
use chrono::{DateTime, Utc};
use kube::ResourceExt;
use tracing::{debug, info, warn};

pub const REASON_DISPATCH_FAILED: &str = "DispatchFailed";
pub const REASON_DISPATCHED: &str = "DumpDispatched";
pub const REASON_ARCHIVE_FOUND: &str = "ArchiveFound";
pub const REASON_DETECTION_TIMEOUT: &str = "DetectionTimeout";
pub const REASON_TARGET_NOT_FOUND: &str = "TargetNotFound";
pub const REASON_INVALID_SPEC: &str = "InvalidSpec";
pub const REASON_STARTED_REVOKED: &str = "StartedRevoked";

#[derive(Clone, Debug)]
enum StatusChange<'m> {
    DispatchFailed { message: &'m str },
    Started { message: &'m str },
    Completed { dump_file: &'m str, message: &'m str },
    Failed { reason: &'m str, message: &'m str },
}

/// Status writer scoped to one `DumpRequest` for one reconciliation attempt
pub struct StatusReporter<'a> {
    store: &'a dyn ResourceStore,
    namespace: String,
    name: String,
    max_attempts: u32,
}

impl<'a> StatusReporter<'a> {
    pub fn for_request(
        store: &'a dyn ResourceStore,
        dump: &DumpRequest,
        max_attempts: u32,
    ) -> Result<Self> {
        let namespace = dump.namespace().ok_or(Error::MissingObjectKey)?;
        Ok(Self {
            store,
            namespace,
            name: dump.name_any(),
            max_attempts: max_attempts.max(1),
        })
    }

    /// Record a transient dispatch failure as Started=Unknown.
    /// Never downgrades an existing Started=True.
    pub async fn mark_dispatch_failed(
        &self,
        message: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<DumpRequest>> {
        self.apply(&StatusChange::DispatchFailed { message }, now)
            .await
    }

    pub async fn mark_started(
        &self,
        message: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<DumpRequest>> {
        self.apply(&StatusChange::Started { message }, now).await
    }

    /// Completed=True with the archive path
    pub async fn mark_completed(
        &self,
        dump_file: &str,
        message: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<DumpRequest>> {
        self.apply(&StatusChange::Completed { dump_file, message }, now)
            .await
    }

    /// Completed=False; clears any archive path
    pub async fn mark_failed(
        &self,
        reason: &str,
        message: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<DumpRequest>> {
        self.apply(&StatusChange::Failed { reason, message }, now)
            .await
    }

    /// Returns the stored object after the write, or `None` if the resource is gone.
    async fn apply(
        &self,
        change: &StatusChange<'_>,
        now: DateTime<Utc>,
    ) -> Result<Option<DumpRequest>> {
        for attempt in 1..=self.max_attempts {
            let Some(current) = self.store.get(&self.namespace, &self.name).await? else {
                info!(
                    dump_request = %self.name,
                    "DumpRequest no longer exists, dropping status update"
                );
                return Ok(None);
            };

            if current.is_terminal() {
                debug!(
                    dump_request = %self.name,
                    "DumpRequest already terminal, leaving status unchanged"
                );
                return Ok(Some(current));
            }

            let mut updated = current.clone();
            let mut status = updated.status.take().unwrap_or_default();
            let mut conditions = status.condition_set();
            let mut changed = false;

            match change {
                StatusChange::DispatchFailed { message } => {
                    if !conditions.is_true(&ConditionType::Started) {
                        changed |= conditions.upsert(
                            ConditionType::Started,
                            ConditionStatus::Unknown,
                            Some(REASON_DISPATCH_FAILED),
                            message,
                            now,
                        );
                    }
                }
                StatusChange::Started { message } => {
                    changed |= conditions.upsert(
                        ConditionType::Started,
                        ConditionStatus::True,
                        Some(REASON_DISPATCHED),
                        message,
                        now,
                    );
                }
                StatusChange::Completed { dump_file, message } => {
                    if !conditions.is_true(&ConditionType::Started) {
                        return Err(Error::OrderingViolation(format!(
                            "refusing Completed=True for {}/{} before Started=True is stored",
                            self.namespace, self.name
                        )));
                    }
                    changed |= conditions.upsert(
                        ConditionType::Completed,
                        ConditionStatus::True,
                        Some(REASON_ARCHIVE_FOUND),
                        message,
                        now,
                    );
                    if status.dump_file != *dump_file {
                        status.dump_file = (*dump_file).to_string();
                        changed = true;
                    }
                }
                StatusChange::Failed { reason, message } => {
                    changed |= conditions.upsert(
                        ConditionType::Completed,
                        ConditionStatus::False,
                        Some(*reason),
                        message,
                        now,
                    );
                    if !status.dump_file.is_empty() {
                        status.dump_file.clear();
                        changed = true;
                    }
                }
            }

            if !changed {
                return Ok(Some(current));
            }

            status.conditions = conditions.into_conditions();
            updated.status = Some(status);

            match self.store.replace_status(&updated).await {
                Ok(stored) => {
                    debug!(dump_request = %self.name, attempt, "Status updated");
                    return Ok(Some(stored));
                }
                Err(e) if e.is_conflict() => {
                    warn!(
                        dump_request = %self.name,
                        attempt,
                        max_attempts = self.max_attempts,
                        "Status write conflicted, refetching"
                    );
                }
                Err(e) => return Err(e),
            }
        }

        Err(Error::Conflict {
            name: format!("{}/{}", self.namespace, self.name),
            attempts: self.max_attempts,
        })
    }
}
