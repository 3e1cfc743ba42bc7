//! Status conditions for `DumpRequest`
//!
//! Conditions are stored on the resource as an ordered list, but they are
//! updated through [`ConditionSet`], which keys them by type so an upsert can
//! never produce duplicates. The list written back always starts with
//! `Started` then `Completed`; other condition types follow in the order they
//! were first seen.

use chrono::{DateTime, SecondsFormat, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Condition types understood by the controller
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ConditionType {
    /// The dump command was dispatched into the target container
    Started,
    /// The dump reached a terminal state (True = archive found, False = failed)
    Completed,
    /// Any other condition type written by external tooling
    Custom(String),
}

impl ConditionType {
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            ConditionType::Started => "Started",
            ConditionType::Completed => "Completed",
            ConditionType::Custom(name) => name,
        }
    }
}

impl From<&str> for ConditionType {
    fn from(value: &str) -> Self {
        match value {
            "Started" => ConditionType::Started,
            "Completed" => ConditionType::Completed,
            other => ConditionType::Custom(other.to_string()),
        }
    }
}

impl fmt::Display for ConditionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of a condition (True, False, or Unknown)
#[derive(Deserialize, Serialize, Clone, Copy, Debug, JsonSchema, PartialEq, Eq, Default)]
pub enum ConditionStatus {
    True,
    False,
    #[default]
    Unknown,
}

impl fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let value = match self {
            ConditionStatus::True => "True",
            ConditionStatus::False => "False",
            ConditionStatus::Unknown => "Unknown",
        };
        f.write_str(value)
    }
}

/// Condition for the `DumpRequest`
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DumpCondition {
    /// Type of condition
    #[serde(rename = "type")]
    pub condition_type: String,

    /// Status of the condition (True, False, or Unknown)
    pub status: ConditionStatus,

    /// Human-readable message about the condition
    #[serde(default)]
    pub message: String,

    /// Last time the condition transitioned (RFC3339 format)
    #[serde(default)]
    pub last_transition_time: String,

    /// Reason for the condition's last transition
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl DumpCondition {
    #[must_use]
    pub fn kind(&self) -> ConditionType {
        ConditionType::from(self.condition_type.as_str())
    }

    #[must_use]
    pub fn is_true(&self) -> bool {
        self.status == ConditionStatus::True
    }

    /// Parsed `lastTransitionTime`, if present and well formed
    #[must_use]
    pub fn transitioned_at(&self) -> Option<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(&self.last_transition_time)
            .ok()
            .map(|ts| ts.with_timezone(&Utc))
    }
}

/// Format a timestamp the way Kubernetes renders `metav1.Time`
#[must_use]
pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Conditions keyed by type
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ConditionSet {
    entries: BTreeMap<ConditionType, DumpCondition>,
    custom_order: Vec<String>,
}

impl ConditionSet {
    /// Build the set from the list stored on the resource. If the list holds
    /// duplicates of a type, the later entry wins.
    #[must_use]
    pub fn from_conditions(conditions: &[DumpCondition]) -> Self {
        let mut set = Self::default();
        for condition in conditions {
            let kind = condition.kind();
            set.track_custom(&kind);
            set.entries.insert(kind, condition.clone());
        }
        set
    }

    fn track_custom(&mut self, kind: &ConditionType) {
        if let ConditionType::Custom(name) = kind {
            if !self.custom_order.contains(name) {
                self.custom_order.push(name.clone());
            }
        }
    }

    #[must_use]
    pub fn get(&self, kind: &ConditionType) -> Option<&DumpCondition> {
        self.entries.get(kind)
    }

    #[must_use]
    pub fn is_true(&self, kind: &ConditionType) -> bool {
        self.get(kind).is_some_and(DumpCondition::is_true)
    }

    /// Replace the entry of the same type, or add it.
    ///
    /// `lastTransitionTime` only moves when the status value changes.
    /// Returns `true` if anything about the entry changed.
    pub fn upsert(
        &mut self,
        kind: ConditionType,
        status: ConditionStatus,
        reason: Option<&str>,
        message: &str,
        now: DateTime<Utc>,
    ) -> bool {
        let reason = reason.map(str::to_string);

        if let Some(existing) = self.entries.get_mut(&kind) {
            if existing.status == status && existing.message == message && existing.reason == reason
            {
                return false;
            }
            if existing.status != status || existing.last_transition_time.is_empty() {
                existing.last_transition_time = format_timestamp(now);
            }
            existing.status = status;
            existing.message = message.to_string();
            existing.reason = reason;
            return true;
        }

        self.track_custom(&kind);
        self.entries.insert(
            kind.clone(),
            DumpCondition {
                condition_type: kind.as_str().to_string(),
                status,
                message: message.to_string(),
                last_transition_time: format_timestamp(now),
                reason,
            },
        );
        true
    }

    /// Serialize back to the ordered list stored on the resource
    #[must_use]
    pub fn into_conditions(self) -> Vec<DumpCondition> {
        let mut entries = self.entries;
        let mut conditions: Vec<DumpCondition> = [ConditionType::Started, ConditionType::Completed]
            .iter()
            .filter_map(|kind| entries.remove(kind))
            .collect();
        conditions.extend(
            self.custom_order
                .into_iter()
                .filter_map(|name| entries.remove(&ConditionType::Custom(name))),
        );
        conditions
    }
}
