//! `DumpRequest` Custom Resource Definition for on-demand runtime dumps

use chrono::{DateTime, Utc};
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

use super::conditions::{ConditionSet, ConditionStatus, ConditionType, DumpCondition};

#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[kube(group = "diagnostics.platform", version = "v1", kind = "DumpRequest")]
#[kube(namespaced)]
#[kube(shortname = "dump")]
#[kube(status = "DumpRequestStatus")]
#[kube(printcolumn = r#"{"name":"Pod","type":"string","jsonPath":".spec.podName"}"#)]
#[kube(
    printcolumn = r#"{"name":"Started","type":"string","jsonPath":".status.conditions[?(@.type==\"Started\")].status"}"#
)]
#[kube(
    printcolumn = r#"{"name":"Completed","type":"string","jsonPath":".status.conditions[?(@.type==\"Completed\")].status"}"#
)]
#[kube(printcolumn = r#"{"name":"Dump File","type":"string","jsonPath":".status.dumpFile"}"#)]
#[kube(printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#)]
pub struct DumpRequestSpec {
    /// Name of the pod to capture from (same namespace as the request)
    #[serde(rename = "podName")]
    pub pod_name: String,

    /// Requested capture kinds. Empty, or containing `all`, means heap and thread.
    #[serde(default)]
    pub include: Vec<CaptureKind>,

    /// Optional: container inside the pod. Defaults to the controller's configured container.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container: Option<String>,
}

/// Kind of artifact to capture
#[derive(Deserialize, Serialize, Clone, Copy, Debug, JsonSchema, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum CaptureKind {
    Heap,
    Thread,
    All,
}

impl CaptureKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            CaptureKind::Heap => "heap",
            CaptureKind::Thread => "thread",
            CaptureKind::All => "all",
        }
    }
}

impl fmt::Display for CaptureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl DumpRequestSpec {
    /// Concrete kinds to capture, with `all` (or nothing) expanded to heap and thread
    #[must_use]
    pub fn capture_kinds(&self) -> BTreeSet<CaptureKind> {
        if self.include.is_empty() || self.include.contains(&CaptureKind::All) {
            return BTreeSet::from([CaptureKind::Heap, CaptureKind::Thread]);
        }
        self.include.iter().copied().collect()
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DumpRequestStatus {
    /// Ordered conditions, `Started` before `Completed`
    #[serde(default)]
    pub conditions: Vec<DumpCondition>,

    /// Path of the archive inside the target container, empty until produced
    #[serde(default)]
    pub dump_file: String,
}

impl DumpRequestStatus {
    #[must_use]
    pub fn condition(&self, kind: &ConditionType) -> Option<&DumpCondition> {
        self.conditions.iter().rev().find(|c| &c.kind() == kind)
    }

    #[must_use]
    pub fn condition_set(&self) -> ConditionSet {
        ConditionSet::from_conditions(&self.conditions)
    }

    /// Completed has been decided either way
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.condition(&ConditionType::Completed)
            .is_some_and(|c| c.status != ConditionStatus::Unknown)
    }
}

impl DumpRequest {
    #[must_use]
    pub fn condition(&self, kind: &ConditionType) -> Option<&DumpCondition> {
        self.status.as_ref().and_then(|s| s.condition(kind))
    }

    #[must_use]
    pub fn is_condition_true(&self, kind: &ConditionType) -> bool {
        self.condition(kind).is_some_and(DumpCondition::is_true)
    }

    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.status
            .as_ref()
            .is_some_and(DumpRequestStatus::is_terminal)
    }

    #[must_use]
    pub fn dump_file(&self) -> &str {
        self.status.as_ref().map_or("", |s| s.dump_file.as_str())
    }

    /// When the capture was dispatched. Falls back to the creation timestamp
    /// if the Started condition carries no usable time.
    #[must_use]
    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.condition(&ConditionType::Started)
            .and_then(DumpCondition::transitioned_at)
            .or_else(|| self.creation_timestamp().map(|ts| ts.0))
    }

    /// `namespace/name` key used for per-resource bookkeeping
    #[must_use]
    pub fn object_key(&self) -> String {
        format!(
            "{}/{}",
            self.namespace().unwrap_or_default(),
            self.name_any()
        )
    }
}
