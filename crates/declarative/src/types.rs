//! Core types for declarative resource management

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::retry::RetryConfig;

/// The closed set of resource kinds the engine manages
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    NotificationChannel,
    Watchlist,
    CustomAgent,
}

impl ResourceKind {
    pub const ALL: [Self; 3] = [Self::NotificationChannel, Self::Watchlist, Self::CustomAgent];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotificationChannel => "notification_channel",
            Self::Watchlist => "watchlist",
            Self::CustomAgent => "custom_agent",
        }
    }

    /// Whether records of this kind reference notification channels
    pub fn has_references(self) -> bool {
        matches!(self, Self::Watchlist | Self::CustomAgent)
    }

    /// Sort key for deletions: referencing kinds go before what they reference
    pub(crate) fn teardown_rank(self) -> u8 {
        match self {
            Self::Watchlist | Self::CustomAgent => 0,
            Self::NotificationChannel => 1,
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "notification_channel" | "channel" => Ok(Self::NotificationChannel),
            "watchlist" => Ok(Self::Watchlist),
            "custom_agent" | "agent" => Ok(Self::CustomAgent),
            other => Err(format!("unknown resource kind: {other}")),
        }
    }
}

/// A desired resource definition from the configuration source
///
/// Identified by `name` alone: logical names are unique across all kinds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigRecord {
    pub kind: ResourceKind,
    pub name: String,
    /// Kind-specific fields
    #[serde(default)]
    pub fields: BTreeMap<String, Value>,
    /// Logical names of referenced notification channels
    #[serde(default)]
    pub references: Vec<String>,
}

impl ConfigRecord {
    pub fn new(kind: ResourceKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
            fields: BTreeMap::new(),
            references: Vec::new(),
        }
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    pub fn with_reference(mut self, name: impl Into<String>) -> Self {
        self.references.push(name.into());
        self
    }

    /// Monitoring type of a custom agent (the `type` field)
    pub fn monitoring_type(&self) -> Option<&str> {
        if self.kind != ResourceKind::CustomAgent {
            return None;
        }
        self.fields.get("type").and_then(Value::as_str)
    }

    /// References sorted and de-duplicated
    pub fn reference_set(&self) -> Vec<String> {
        let mut refs = self.references.clone();
        refs.sort();
        refs.dedup();
        refs
    }
}

/// What a plan will do to a resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChangeType {
    Create,
    Update,
    Replace,
    Delete,
    NoChange,
}

impl ChangeType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Create => "CREATE",
            Self::Update => "UPDATE",
            Self::Replace => "REPLACE",
            Self::Delete => "DELETE",
            Self::NoChange => "NO_CHANGE",
        }
    }

    pub fn is_change(self) -> bool {
        !matches!(self, Self::NoChange)
    }
}

impl fmt::Display for ChangeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How disruptive a change is; informational, never blocking
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        })
    }
}

/// How a single field path changed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldChange {
    Added,
    Removed,
    Modified,
}

/// A field-level difference between stored and desired state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDiff {
    /// Dotted path, e.g. `trigger.threshold`
    pub path: String,
    pub change: FieldChange,
    /// Desired value; absent for removals
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub desired: Option<Value>,
}

/// One resource's entry in a plan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceChange {
    pub kind: ResourceKind,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_id: Option<String>,
    pub change_type: ChangeType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_fingerprint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub desired_fingerprint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field_diffs: Option<Vec<FieldDiff>>,
    pub risk_level: RiskLevel,
    /// Human-readable reason when the classification is not obvious
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub dependents: Vec<String>,
    /// Dependency layer; only changes of one layer may run concurrently
    #[serde(default)]
    pub depth: usize,
}

/// Outcome of dispatching one change
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ApplyResult {
    /// Provider call succeeded
    Applied,
    /// Nothing to do
    NoChange,
    /// Dry run; this is what would have been dispatched
    Planned,
    /// Provider call failed
    Failed { error: String },
    /// Not attempted
    Skipped { reason: String },
}

impl ApplyResult {
    /// Check if the result represents success (no failure)
    pub fn is_success(&self) -> bool {
        !matches!(self, Self::Failed { .. })
    }
}

/// Per-resource line of an execution result
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceResult {
    pub name: String,
    pub kind: ResourceKind,
    pub change_type: ChangeType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_id: Option<String>,
    pub result: ApplyResult,
    pub duration_ms: u64,
}

/// A rollback step that could not be completed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollbackError {
    pub name: String,
    pub message: String,
}

/// Summary of execution results
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecuteSummary {
    pub created: usize,
    pub updated: usize,
    pub replaced: usize,
    pub deleted: usize,
    pub planned: usize,
    pub skipped: usize,
    pub failed: usize,
    pub no_change: usize,
    /// Successful changes per resource kind
    #[serde(default)]
    pub by_kind: BTreeMap<String, usize>,
    pub duration_ms: u64,
}

impl ExecuteSummary {
    /// Total number of actual changes made
    pub fn total_changes(&self) -> usize {
        self.created + self.updated + self.replaced + self.deleted
    }

    /// Check if execution was fully successful (no failures)
    pub fn is_success(&self) -> bool {
        self.failed == 0
    }

    /// Total number of resources processed
    pub fn total(&self) -> usize {
        self.total_changes() + self.planned + self.skipped + self.failed + self.no_change
    }

    /// Add a result to the summary
    pub fn add_result(&mut self, result: &ResourceResult) {
        match &result.result {
            ApplyResult::Applied => {
                match result.change_type {
                    ChangeType::Create => self.created += 1,
                    ChangeType::Update => self.updated += 1,
                    ChangeType::Replace => self.replaced += 1,
                    ChangeType::Delete => self.deleted += 1,
                    ChangeType::NoChange => self.no_change += 1,
                }
                *self
                    .by_kind
                    .entry(result.kind.as_str().to_string())
                    .or_default() += 1;
            }
            ApplyResult::NoChange => self.no_change += 1,
            ApplyResult::Planned => self.planned += 1,
            ApplyResult::Failed { .. } => self.failed += 1,
            ApplyResult::Skipped { .. } => self.skipped += 1,
        }
    }
}

/// Aggregate outcome of one apply run
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionResult {
    /// True only if every attempted change succeeded
    pub success: bool,
    pub dry_run: bool,
    pub results: Vec<ResourceResult>,
    pub summary: ExecuteSummary,
    /// Changes undone after a failure, in undo order
    pub rolled_back: Vec<String>,
    /// Successful changes that cannot be undone (REPLACE, DELETE)
    pub not_rolled_back: Vec<String>,
    pub rollback_failures: Vec<RollbackError>,
    /// The failure that stopped the run, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Options for execution
#[derive(Debug, Clone)]
pub struct ExecuteOptions {
    /// Don't make changes, just report what would happen
    pub dry_run: bool,
    /// Keep going after a failed change instead of rolling back
    pub continue_on_error: bool,
    /// Number of independent changes dispatched at once
    pub parallelism: usize,
    /// Dispatch NO_CHANGE entries too
    pub include_no_change: bool,
    /// Retry policy for acquiring the operation lock
    pub lock_retry: RetryConfig,
}

impl Default for ExecuteOptions {
    fn default() -> Self {
        Self {
            dry_run: false,
            continue_on_error: false,
            parallelism: 1,
            include_no_change: false,
            lock_retry: RetryConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_round_trips_through_str() {
        for kind in ResourceKind::ALL {
            assert_eq!(kind.as_str().parse::<ResourceKind>().unwrap(), kind);
        }
        assert!("dashboard".parse::<ResourceKind>().is_err());
    }

    #[test]
    fn test_monitoring_type_only_for_agents() {
        let agent = ConfigRecord::new(ResourceKind::CustomAgent, "a").with_field("type", "http");
        assert_eq!(agent.monitoring_type(), Some("http"));

        let list = ConfigRecord::new(ResourceKind::Watchlist, "w").with_field("type", "http");
        assert_eq!(list.monitoring_type(), None);
    }

    #[test]
    fn test_change_type_serializes_screaming() {
        let json = serde_json::to_string(&ChangeType::NoChange).unwrap();
        assert_eq!(json, "\"NO_CHANGE\"");
    }

    #[test]
    fn test_summary_counts_by_change_type_and_kind() {
        let mut summary = ExecuteSummary::default();
        let applied = |kind, change_type| ResourceResult {
            name: "x".into(),
            kind,
            change_type,
            remote_id: None,
            result: ApplyResult::Applied,
            duration_ms: 0,
        };
        summary.add_result(&applied(ResourceKind::Watchlist, ChangeType::Create));
        summary.add_result(&applied(ResourceKind::Watchlist, ChangeType::Delete));
        summary.add_result(&ResourceResult {
            result: ApplyResult::Failed {
                error: "boom".into(),
            },
            ..applied(ResourceKind::CustomAgent, ChangeType::Update)
        });

        assert_eq!(summary.created, 1);
        assert_eq!(summary.deleted, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.total_changes(), 2);
        assert_eq!(summary.by_kind.get("watchlist"), Some(&2));
        assert!(!summary.is_success());
    }
}
