//! `DumpRequest` reconciler
//!
//! Drives one request through
//! `Pending -> Started(True) -> Completed(True | False)`.
//!
//! Each attempt does one step and returns; waiting for the archive is done by
//! requeueing after the poll interval, never by sleeping inside an attempt.

use super::archive::inspect_archive;
use super::executor::DumpExecutor;
use super::locator::{convention_root, ArchiveLocator};
use super::metrics::{DumpMetrics, MetricsSnapshot};
use super::session::SessionRegistry;
use super::status::{
    StatusReporter, REASON_DETECTION_TIMEOUT, REASON_INVALID_SPEC, REASON_STARTED_REVOKED,
    REASON_TARGET_NOT_FOUND,
};
use crate::crds::{CaptureKind, ConditionType, DumpRequest};
use crate::tasks::config::ControllerConfig;
use crate::tasks::exec::{PodExec, PodRef};
use crate::tasks::store::ResourceStore;
use crate::tasks::types::{Error, Result};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use kube::runtime::controller::Action;
use kube::ResourceExt;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// What the scheduler should do after an attempt
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Nothing left to do until the resource changes
    Done,
    /// Check again after the delay
    Requeue(Duration),
}

impl ReconcileOutcome {
    #[must_use]
    pub fn into_action(self) -> Action {
        match self {
            ReconcileOutcome::Done => Action::await_change(),
            ReconcileOutcome::Requeue(delay) => Action::requeue(delay),
        }
    }
}

/// A dispatch whose Started write has not landed yet
#[derive(Clone, Debug)]
struct PendingStart {
    message: String,
    dispatched_at: DateTime<Utc>,
}

pub struct DumpReconciler {
    store: Arc<dyn ResourceStore>,
    exec: Arc<dyn PodExec>,
    config: Arc<ControllerConfig>,
    sessions: SessionRegistry,
    failures: DashMap<String, u32>,
    pending_starts: DashMap<String, PendingStart>,
    metrics: DumpMetrics,
}

impl DumpReconciler {
    #[must_use]
    pub fn new(
        store: Arc<dyn ResourceStore>,
        exec: Arc<dyn PodExec>,
        config: Arc<ControllerConfig>,
    ) -> Self {
        Self {
            store,
            exec,
            config,
            sessions: SessionRegistry::new(),
            failures: DashMap::new(),
            pending_starts: DashMap::new(),
            metrics: DumpMetrics::default(),
        }
    }

    #[must_use]
    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    #[must_use]
    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    /// Next requeue delay after a transient failure of `key`
    pub fn backoff_for(&self, key: &str) -> Duration {
        let mut failures = self.failures.entry(key.to_string()).or_insert(0);
        *failures += 1;
        self.config.retry.backoff(*failures)
    }

    /// Drop all per-resource state, e.g. after deletion
    pub fn forget(&self, key: &str) {
        self.failures.remove(key);
        self.pending_starts.remove(key);
    }

    pub async fn reconcile(&self, dump: &DumpRequest) -> Result<ReconcileOutcome> {
        self.reconcile_at(dump, Utc::now()).await
    }

    #[instrument(skip(self, dump, now), fields(dump_request = %dump.object_key()))]
    pub async fn reconcile_at(
        &self,
        dump: &DumpRequest,
        now: DateTime<Utc>,
    ) -> Result<ReconcileOutcome> {
        if dump.is_terminal() {
            debug!("DumpRequest already completed, nothing to do");
            return Ok(ReconcileOutcome::Done);
        }

        let key = dump.object_key();
        let Some(_session) = self.sessions.try_acquire(&key) else {
            info!("Another attempt is driving this DumpRequest, requeueing");
            return Ok(ReconcileOutcome::Requeue(self.config.dump.poll_interval()));
        };

        // The watch cache can lag behind our own status writes
        let namespace = dump.namespace().ok_or(Error::MissingObjectKey)?;
        let Some(latest) = self.store.get(&namespace, &dump.name_any()).await? else {
            info!("DumpRequest no longer exists, stopping");
            self.forget(&key);
            return Ok(ReconcileOutcome::Done);
        };
        if latest.is_terminal() {
            debug!("Stored DumpRequest already completed, nothing to do");
            return Ok(ReconcileOutcome::Done);
        }

        let reporter = StatusReporter::for_request(
            self.store.as_ref(),
            &latest,
            self.config.status.max_conflict_retries,
        )?;

        let result = if latest.is_condition_true(&ConditionType::Started) {
            self.detect(&latest, &reporter, now).await
        } else {
            self.dispatch(&key, &latest, &reporter, now).await
        };

        if result.is_ok() {
            self.failures.remove(&key);
        }
        result
    }

    fn target_for(&self, dump: &DumpRequest) -> Result<PodRef> {
        Ok(PodRef {
            namespace: dump.namespace().ok_or(Error::MissingObjectKey)?,
            name: dump.spec.pod_name.trim().to_string(),
            container: dump
                .spec
                .container
                .clone()
                .filter(|c| !c.trim().is_empty())
                .unwrap_or_else(|| self.config.dump.container_name.clone()),
        })
    }

    async fn dispatch(
        &self,
        key: &str,
        dump: &DumpRequest,
        reporter: &StatusReporter<'_>,
        now: DateTime<Utc>,
    ) -> Result<ReconcileOutcome> {
        let pending = self.pending_starts.get(key).map(|p| p.value().clone());
        if let Some(pending) = pending {
            info!("Dump already dispatched, retrying Started update");
            return self.record_started(key, reporter, pending).await;
        }

        if dump.spec.pod_name.trim().is_empty() {
            self.metrics.record_failed();
            reporter
                .mark_failed(
                    REASON_INVALID_SPEC,
                    "spec.podName must name the pod to capture from",
                    now,
                )
                .await?;
            return Ok(ReconcileOutcome::Done);
        }

        let target = self.target_for(dump)?;
        let kinds = dump.spec.capture_kinds();
        let executor = DumpExecutor::new(self.exec.as_ref(), &self.config.dump);

        match executor.dispatch(&dump.name_any(), &target, &kinds, now).await {
            Ok(dispatch) => {
                self.metrics.record_dispatched();
                let pending = PendingStart {
                    message: format!(
                        "Dump ({}) dispatched to {}; writing to {}",
                        describe_kinds(&kinds),
                        target,
                        dispatch.capture_dir
                    ),
                    dispatched_at: now,
                };
                self.pending_starts.insert(key.to_string(), pending.clone());
                self.record_started(key, reporter, pending).await
            }
            Err(e) if e.is_terminal() => {
                warn!(error = %e, "Dump target not found");
                self.metrics.record_failed();
                reporter
                    .mark_failed(REASON_TARGET_NOT_FOUND, &e.to_string(), now)
                    .await?;
                Ok(ReconcileOutcome::Done)
            }
            Err(e) => {
                warn!(error = %e, "Dump dispatch failed, will retry");
                self.metrics.record_transient_error();
                if let Err(status_err) = reporter.mark_dispatch_failed(&e.to_string(), now).await {
                    warn!(error = %status_err, "Failed to record dispatch failure");
                }
                Err(e)
            }
        }
    }

    /// Persist Started=True for a dispatched capture. The pending record is
    /// kept until the write lands so a failed write never causes a second dispatch.
    async fn record_started(
        &self,
        key: &str,
        reporter: &StatusReporter<'_>,
        pending: PendingStart,
    ) -> Result<ReconcileOutcome> {
        let stored = reporter
            .mark_started(&pending.message, pending.dispatched_at)
            .await?;
        self.pending_starts.remove(key);

        if stored.is_none() {
            return Ok(ReconcileOutcome::Done);
        }
        info!("Dump started, waiting for archive");
        Ok(ReconcileOutcome::Requeue(self.config.dump.poll_interval()))
    }

    async fn detect(
        &self,
        dump: &DumpRequest,
        reporter: &StatusReporter<'_>,
        now: DateTime<Utc>,
    ) -> Result<ReconcileOutcome> {
        let target = self.target_for(dump)?;
        let timeout = self.config.dump.detection_timeout();
        let started_at = dump.started_at().unwrap_or(now);
        let elapsed = (now - started_at).to_std().unwrap_or_default();
        let root = &self.config.dump.serviceability_root;

        let locator = ArchiveLocator::new(self.exec.as_ref(), root);
        match locator.locate(&target).await {
            Ok(Some(path)) => {
                let dispatched_dir =
                    DumpExecutor::capture_dir(root, &target.namespace, started_at, &dump.name_any());
                if !path.starts_with(&format!("{dispatched_dir}/")) {
                    debug!(
                        dump_file = %path,
                        dispatched_dir = %dispatched_dir,
                        "Newest archive is not in this request's capture directory"
                    );
                }

                let message = self.completion_message(dump, &target, &path).await;
                match reporter.mark_completed(&path, &message, now).await {
                    Ok(Some(_)) => {
                        self.metrics.record_completed();
                        info!(dump_file = %path, "Dump archive located");
                        Ok(ReconcileOutcome::Done)
                    }
                    Ok(None) => Ok(ReconcileOutcome::Done),
                    Err(e @ Error::OrderingViolation(_)) => {
                        self.fail(reporter, REASON_STARTED_REVOKED, &e, now).await
                    }
                    Err(e) => Err(e),
                }
            }
            Ok(None) if elapsed >= timeout => {
                let err = Error::Timeout(format!(
                    "no dump archive appeared under {} in {} within {}s",
                    convention_root(root, &target.namespace),
                    target,
                    timeout.as_secs()
                ));
                self.fail(reporter, REASON_DETECTION_TIMEOUT, &err, now).await
            }
            Ok(None) => {
                debug!(elapsed_secs = elapsed.as_secs(), "Dump archive not present yet");
                let remaining = timeout - elapsed;
                Ok(ReconcileOutcome::Requeue(
                    self.config.dump.poll_interval().min(remaining),
                ))
            }
            Err(e) if e.is_terminal() => {
                self.fail(reporter, REASON_TARGET_NOT_FOUND, &e, now).await
            }
            Err(e) if elapsed >= timeout => {
                let err = Error::Timeout(format!(
                    "dump archive not detected within {}s; last error: {e}",
                    timeout.as_secs()
                ));
                self.fail(reporter, REASON_DETECTION_TIMEOUT, &err, now).await
            }
            Err(e) => {
                warn!(error = %e, "Archive detection failed, will retry");
                self.metrics.record_transient_error();
                Err(e)
            }
        }
    }

    async fn fail(
        &self,
        reporter: &StatusReporter<'_>,
        reason: &str,
        err: &Error,
        now: DateTime<Utc>,
    ) -> Result<ReconcileOutcome> {
        warn!(error = %err, reason, "Dump failed");
        if reporter
            .mark_failed(reason, &err.to_string(), now)
            .await?
            .is_some()
        {
            self.metrics.record_failed();
        }
        Ok(ReconcileOutcome::Done)
    }

    /// Completed message, noting missing kinds when archive checking is enabled
    async fn completion_message(&self, dump: &DumpRequest, target: &PodRef, path: &str) -> String {
        let message = format!("Dump archive available at {path}");
        if !self.config.dump.verify_archive {
            return message;
        }

        match inspect_archive(self.exec.as_ref(), target, path).await {
            Ok(manifest) => {
                let missing = manifest.missing_kinds(&dump.spec.capture_kinds());
                if missing.is_empty() {
                    message
                } else {
                    let missing: BTreeSet<CaptureKind> = missing.into_iter().collect();
                    warn!(dump_file = %path, missing = %describe_kinds(&missing), "Archive lacks requested artifacts");
                    format!(
                        "{message} (no {} artifact found in archive)",
                        describe_kinds(&missing)
                    )
                }
            }
            Err(e) => {
                warn!(dump_file = %path, error = %e, "Could not inspect dump archive");
                message
            }
        }
    }
}

fn describe_kinds(kinds: &BTreeSet<CaptureKind>) -> String {
    kinds
        .iter()
        .map(|k| k.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}
