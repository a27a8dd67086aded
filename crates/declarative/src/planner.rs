//! Plan assembly and saved plan artifacts
//!
//! The planner merges graph order, detected changes, warnings and a summary
//! into an [`ExecutionPlan`]. A plan is fully determined by the desired
//! records and the state it was computed against: only `created_at` varies
//! between two plans of identical input, and it is excluded from the hashes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use crate::diff::ChangeDetector;
use crate::error::{Error, Result};
use crate::fingerprint::{FINGERPRINT_LEN, canonical_json, digest, fingerprint};
use crate::fsutil;
use crate::graph::{DependencyEdge, DependencyGraph};
use crate::state::StateFile;
use crate::types::{ChangeType, ConfigRecord, ResourceChange, ResourceKind, RiskLevel};

/// Format version of saved plan artifacts
pub const PLAN_VERSION: u32 = 1;

// ============================================================================
// Plan Structures
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    /// Blocks apply
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarningCode {
    DependencyCycle,
    MissingDependency,
    UnexpectedReferenceKind,
    HighRiskChanges,
    Drift,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanWarning {
    pub severity: Severity,
    pub code: WarningCode,
    pub message: String,
    /// Affected logical names; for cycles, the cycle path in order
    #[serde(default)]
    pub resources: Vec<String>,
}

impl PlanWarning {
    pub fn is_blocking(&self) -> bool {
        self.severity == Severity::Error
    }
}

/// A divergence between the remote service and the state store
///
/// Produced by an external drift check and carried into the plan as a
/// warning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriftFinding {
    pub name: String,
    pub kind: ResourceKind,
    /// Remote fingerprint recorded at last apply
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected: Option<String>,
    /// Remote fingerprint observed now; `None` if the resource is gone
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actual: Option<String>,
}

impl DriftFinding {
    fn describe(&self) -> String {
        match &self.actual {
            None => format!("{} '{}' no longer exists remotely", self.kind, self.name),
            Some(_) => format!("{} '{}' was modified outside watchctl", self.kind, self.name),
        }
    }
}

/// Counts by change type
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeCounts {
    pub to_create: usize,
    pub to_update: usize,
    pub to_replace: usize,
    pub to_delete: usize,
    pub no_change: usize,
}

impl ChangeCounts {
    fn add(&mut self, change_type: ChangeType) {
        match change_type {
            ChangeType::Create => self.to_create += 1,
            ChangeType::Update => self.to_update += 1,
            ChangeType::Replace => self.to_replace += 1,
            ChangeType::Delete => self.to_delete += 1,
            ChangeType::NoChange => self.no_change += 1,
        }
    }

    /// Number of changes that touch the remote service
    pub fn actionable(&self) -> usize {
        self.to_create + self.to_update + self.to_replace + self.to_delete
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanSummary {
    #[serde(flatten)]
    pub totals: ChangeCounts,
    #[serde(default)]
    pub by_kind: BTreeMap<String, ChangeCounts>,
}

impl PlanSummary {
    fn from_changes(changes: &[ResourceChange]) -> Self {
        let mut summary = Self::default();
        for change in changes {
            summary.totals.add(change.change_type);
            summary
                .by_kind
                .entry(change.kind.as_str().to_string())
                .or_default()
                .add(change.change_type);
        }
        summary
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanMetadata {
    pub plan_id: String,
    pub created_at: DateTime<Utc>,
    /// Hash of the desired configuration set
    pub config_hash: String,
    /// Hash of everything in the plan except `created_at`
    pub content_hash: String,
    pub tool_version: String,
    pub resource_count: usize,
    pub drift_checked: bool,
}

/// Immutable, ordered change set
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionPlan {
    pub metadata: PlanMetadata,
    /// Changes in execution order
    pub changes: Vec<ResourceChange>,
    pub summary: PlanSummary,
    pub dependencies: Vec<DependencyEdge>,
    #[serde(default)]
    pub warnings: Vec<PlanWarning>,
}

impl ExecutionPlan {
    pub fn has_changes(&self) -> bool {
        self.summary.totals.actionable() > 0
    }

    /// Changes other than NO_CHANGE, in execution order
    pub fn actionable(&self) -> impl Iterator<Item = &ResourceChange> {
        self.changes.iter().filter(|c| c.change_type.is_change())
    }

    pub fn get(&self, name: &str) -> Option<&ResourceChange> {
        self.changes.iter().find(|c| c.name == name)
    }

    pub fn blocking_warnings(&self) -> impl Iterator<Item = &PlanWarning> {
        self.warnings.iter().filter(|w| w.is_blocking())
    }

    pub fn has_blocking_warnings(&self) -> bool {
        self.blocking_warnings().next().is_some()
    }

    /// Fail with the first blocking warning as an error
    pub fn ensure_executable(&self) -> Result<()> {
        for warning in self.blocking_warnings() {
            match warning.code {
                WarningCode::DependencyCycle => {
                    let mut cycle = warning.resources.clone();
                    if let Some(first) = cycle.first().cloned() {
                        cycle.push(first);
                    }
                    return Err(Error::DependencyCycle { cycle });
                }
                WarningCode::MissingDependency => {
                    let resource = warning.resources.first().cloned().unwrap_or_default();
                    let dependency = warning.resources.get(1).cloned().unwrap_or_default();
                    return Err(Error::MissingDependency {
                        resource,
                        dependency,
                    });
                }
                _ => {}
            }
        }
        Ok(())
    }
}

// ============================================================================
// Planner
// ============================================================================

/// Inputs to plan assembly besides graph and changes
#[derive(Debug, Clone)]
pub struct PlanOptions {
    /// Findings from a drift check; `None` when no check ran
    pub drift: Option<Vec<DriftFinding>>,
    pub tool_version: String,
}

impl Default for PlanOptions {
    fn default() -> Self {
        Self {
            drift: None,
            tool_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Graph, detection and assembly in one call
#[derive(Debug, Clone, Default)]
pub struct Planner {
    detector: ChangeDetector,
    options: PlanOptions,
}

impl Planner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_options(options: PlanOptions) -> Self {
        Self {
            detector: ChangeDetector::new(),
            options,
        }
    }

    pub fn plan(&self, desired: &[ConfigRecord], state: &StateFile) -> Result<ExecutionPlan> {
        let graph = DependencyGraph::build(desired);
        let changes = self.detector.detect(desired, state);
        assemble(&graph, changes, desired, &self.options)
    }
}

/// Order changes by the graph, attach dependents, warn and summarize
///
/// Changes absent from the graph (deletions) are appended in the order
/// given, never dropped.
pub fn assemble(
    graph: &DependencyGraph,
    changes: Vec<ResourceChange>,
    desired: &[ConfigRecord],
    options: &PlanOptions,
) -> Result<ExecutionPlan> {
    let positions = graph.positions();
    let (mut ordered, absent): (Vec<_>, Vec<_>) = changes
        .into_iter()
        .partition(|c| positions.contains_key(c.name.as_str()));
    ordered.sort_by_key(|c| positions.get(c.name.as_str()).copied().unwrap_or(usize::MAX));
    ordered.extend(absent);

    for change in &mut ordered {
        if let Some(node) = graph.get(&change.name) {
            change.dependents = node.dependents.clone();
            change.depth = node.depth;
        }
    }

    let warnings = collect_warnings(graph, &ordered, options);
    let summary = PlanSummary::from_changes(&ordered);
    let dependencies = graph.edges();
    let config_hash = config_hash(desired);

    let content = json!({
        "config_hash": config_hash,
        "changes": serde_json::to_value(&ordered)?,
        "summary": serde_json::to_value(&summary)?,
        "dependencies": serde_json::to_value(&dependencies)?,
        "warnings": serde_json::to_value(&warnings)?,
        "drift_checked": options.drift.is_some(),
    });
    let content_hash = digest(&canonical_json(&content), FINGERPRINT_LEN);

    log::debug!(
        "assembled plan {} ({} changes, {} warnings)",
        content_hash,
        summary.totals.actionable(),
        warnings.len()
    );

    Ok(ExecutionPlan {
        metadata: PlanMetadata {
            plan_id: format!("plan-{}", &content_hash[..12]),
            created_at: Utc::now(),
            config_hash,
            content_hash,
            tool_version: options.tool_version.clone(),
            resource_count: desired.len(),
            drift_checked: options.drift.is_some(),
        },
        changes: ordered,
        summary,
        dependencies,
        warnings,
    })
}

/// Order-independent hash of a configuration set
pub fn config_hash(desired: &[ConfigRecord]) -> String {
    let mut entries: Vec<(&str, String)> = desired
        .iter()
        .map(|r| (r.name.as_str(), fingerprint(r)))
        .collect();
    entries.sort();
    let doc: Value = entries
        .into_iter()
        .map(|(name, fp)| json!([name, fp]))
        .collect();
    digest(&canonical_json(&doc), FINGERPRINT_LEN)
}

fn collect_warnings(
    graph: &DependencyGraph,
    changes: &[ResourceChange],
    options: &PlanOptions,
) -> Vec<PlanWarning> {
    let mut warnings = Vec::new();

    for cycle in &graph.cycles {
        let mut path = cycle.clone();
        if path.len() > 1 && path.first() == path.last() {
            path.pop();
        }
        warnings.push(PlanWarning {
            severity: Severity::Error,
            code: WarningCode::DependencyCycle,
            message: format!("dependency cycle: {}", cycle.join(" -> ")),
            resources: path,
        });
    }

    for change in changes {
        for dep in &change.dependencies {
            match graph.get(dep) {
                None => warnings.push(PlanWarning {
                    severity: Severity::Error,
                    code: WarningCode::MissingDependency,
                    message: format!(
                        "{} '{}' references '{}', which is not defined",
                        change.kind, change.name, dep
                    ),
                    resources: vec![change.name.clone(), dep.clone()],
                }),
                Some(node) if node.kind != ResourceKind::NotificationChannel => {
                    warnings.push(PlanWarning {
                        severity: Severity::Warning,
                        code: WarningCode::UnexpectedReferenceKind,
                        message: format!(
                            "{} '{}' references {} '{}', expected a notification channel",
                            change.kind, change.name, node.kind, dep
                        ),
                        resources: vec![change.name.clone(), dep.clone()],
                    });
                }
                Some(_) => {}
            }
        }
    }

    let high_risk: Vec<String> = changes
        .iter()
        .filter(|c| c.change_type.is_change() && c.risk_level == RiskLevel::High)
        .map(|c| c.name.clone())
        .collect();
    if !high_risk.is_empty() {
        warnings.push(PlanWarning {
            severity: Severity::Warning,
            code: WarningCode::HighRiskChanges,
            message: format!("{} high-risk change(s): {}", high_risk.len(), high_risk.join(", ")),
            resources: high_risk,
        });
    }

    if let Some(findings) = &options.drift {
        for finding in findings {
            log::warn!("{}", finding.describe());
            warnings.push(PlanWarning {
                severity: Severity::Warning,
                code: WarningCode::Drift,
                message: finding.describe(),
                resources: vec![finding.name.clone()],
            });
        }
    }

    warnings
}

// ============================================================================
// Plan Artifact
// ============================================================================

/// A plan saved for a later `apply --plan`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanArtifact {
    pub version: u32,
    pub plan: ExecutionPlan,
    /// BLAKE3 of the canonical serialized plan
    pub signature: String,
}

impl PlanArtifact {
    pub fn seal(plan: ExecutionPlan) -> Result<Self> {
        let signature = sign(&plan)?;
        Ok(Self {
            version: PLAN_VERSION,
            plan,
            signature,
        })
    }

    /// Check the signature against the plan content
    pub fn verify(&self) -> Result<()> {
        if self.version != PLAN_VERSION {
            return Err(Error::UnsupportedPlanVersion {
                found: self.version,
                expected: PLAN_VERSION,
            });
        }
        let actual = sign(&self.plan)?;
        if actual != self.signature {
            return Err(Error::PlanTampered {
                expected: self.signature.clone(),
                actual,
            });
        }
        Ok(())
    }

    /// Check the plan was computed from the current configuration
    pub fn ensure_fresh(&self, current_config_hash: &str) -> Result<()> {
        if self.plan.metadata.config_hash != current_config_hash {
            return Err(Error::StalePlan {
                planned: self.plan.metadata.config_hash.clone(),
                current: current_config_hash.to_string(),
            });
        }
        Ok(())
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(self)?;
        fsutil::write_atomic(path, &bytes)?;
        log::debug!("saved plan {} to {}", self.plan.metadata.plan_id, path.display());
        Ok(())
    }

    /// Load an artifact; the signature is not checked here
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
        let raw: Value = serde_json::from_str(&content)?;

        let found = raw
            .get("version")
            .and_then(Value::as_u64)
            .and_then(|v| u32::try_from(v).ok())
            .unwrap_or(0);
        if found != PLAN_VERSION {
            return Err(Error::UnsupportedPlanVersion {
                found,
                expected: PLAN_VERSION,
            });
        }

        Ok(serde_json::from_value(raw)?)
    }

    pub fn into_plan(self) -> ExecutionPlan {
        self.plan
    }
}

fn sign(plan: &ExecutionPlan) -> Result<String> {
    let value = serde_json::to_value(plan)?;
    Ok(blake3::hash(canonical_json(&value).as_bytes())
        .to_hex()
        .to_string())
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::StateEntry;
    use crate::testing::{agent, channel, entry_for, watchlist};
    use tempfile::TempDir;

    fn plan(desired: &[ConfigRecord], state: &StateFile) -> ExecutionPlan {
        Planner::new().plan(desired, state).unwrap()
    }

    fn state_with(entries: Vec<StateEntry>) -> StateFile {
        let mut state = StateFile::default();
        for entry in entries {
            state.upsert(entry);
        }
        state
    }

    fn names(plan: &ExecutionPlan) -> Vec<&str> {
        plan.changes.iter().map(|c| c.name.as_str()).collect()
    }

    #[test]
    fn test_new_channel_and_watchlist_ordered_without_warnings() {
        let desired = vec![watchlist("w1", &["c1"]), channel("c1")];
        let plan = plan(&desired, &StateFile::default());

        assert_eq!(names(&plan), vec!["c1", "w1"]);
        assert!(plan.changes.iter().all(|c| c.change_type == ChangeType::Create));
        assert!(plan.warnings.is_empty());
        assert_eq!(plan.summary.totals.to_create, 2);
        assert_eq!(plan.get("c1").unwrap().dependents, vec!["w1"]);
        assert_eq!(
            plan.dependencies,
            vec![DependencyEdge {
                from: "w1".into(),
                to: "c1".into()
            }]
        );
        plan.ensure_executable().unwrap();
    }

    #[test]
    fn test_orphan_is_single_delete_at_end() {
        let state = state_with(vec![entry_for(&watchlist("orphan", &[]), "wl-1")]);
        let plan = plan(&[channel("c1")], &state);

        assert_eq!(plan.summary.totals.to_delete, 1);
        assert_eq!(names(&plan), vec!["c1", "orphan"]);
        assert_eq!(plan.changes[1].change_type, ChangeType::Delete);
        assert_eq!(plan.summary.by_kind["watchlist"].to_delete, 1);
    }

    #[test]
    fn test_replanning_applied_state_is_a_noop() {
        let desired = vec![channel("c1"), watchlist("w1", &["c1"]), agent("a1", "http", &["c1"])];
        let state = state_with(
            desired
                .iter()
                .enumerate()
                .map(|(i, r)| entry_for(r, &format!("id-{i}")))
                .collect(),
        );
        let plan = plan(&desired, &state);

        let totals = &plan.summary.totals;
        assert_eq!(
            (totals.to_create, totals.to_update, totals.to_replace, totals.to_delete),
            (0, 0, 0, 0)
        );
        assert_eq!(totals.no_change, 3);
        assert!(!plan.has_changes());
        assert_eq!(plan.actionable().count(), 0);
    }

    #[test]
    fn test_type_change_is_replace_with_high_risk_warning() {
        let state = state_with(vec![entry_for(&agent("pinger", "http", &[]), "ag-1")]);
        let plan = plan(&[agent("pinger", "tcp", &[])], &state);

        let change = plan.get("pinger").unwrap();
        assert_eq!(change.change_type, ChangeType::Replace);
        assert_eq!(change.risk_level, RiskLevel::High);

        let warning = plan
            .warnings
            .iter()
            .find(|w| w.code == WarningCode::HighRiskChanges)
            .unwrap();
        assert_eq!(warning.severity, Severity::Warning);
        assert_eq!(warning.resources, vec!["pinger"]);
        assert!(!plan.has_blocking_warnings());
    }

    #[test]
    fn test_cycle_blocks_execution() {
        let desired = vec![watchlist("x", &["y"]), watchlist("y", &["x"])];
        let plan = plan(&desired, &StateFile::default());

        assert!(plan.has_blocking_warnings());
        let cycle = plan
            .warnings
            .iter()
            .find(|w| w.code == WarningCode::DependencyCycle)
            .unwrap();
        assert_eq!(cycle.severity, Severity::Error);
        assert!(matches!(
            plan.ensure_executable(),
            Err(Error::DependencyCycle { .. })
        ));
    }

    #[test]
    fn test_missing_dependency_blocks_execution() {
        let plan = plan(&[watchlist("w1", &["ghost"])], &StateFile::default());

        match plan.ensure_executable() {
            Err(Error::MissingDependency {
                resource,
                dependency,
            }) => {
                assert_eq!(resource, "w1");
                assert_eq!(dependency, "ghost");
            }
            other => panic!("expected MissingDependency, got {other:?}"),
        }
    }

    #[test]
    fn test_reference_to_non_channel_warns() {
        let desired = vec![channel("c1"), watchlist("w1", &["c1"]), agent("a1", "http", &["w1"])];
        let plan = plan(&desired, &StateFile::default());

        let warning = plan
            .warnings
            .iter()
            .find(|w| w.code == WarningCode::UnexpectedReferenceKind)
            .unwrap();
        assert_eq!(warning.severity, Severity::Warning);
        assert_eq!(warning.resources, vec!["a1", "w1"]);
        assert!(!plan.has_blocking_warnings());
    }

    #[test]
    fn test_drift_findings_become_warnings() {
        let c1 = channel("c1");
        let state = state_with(vec![entry_for(&c1, "ch-1")]);
        let options = PlanOptions {
            drift: Some(vec![DriftFinding {
                name: "c1".into(),
                kind: ResourceKind::NotificationChannel,
                expected: Some("aaaa".into()),
                actual: None,
            }]),
            ..PlanOptions::default()
        };
        let plan = Planner::with_options(options).plan(&[c1], &state).unwrap();

        assert!(plan.metadata.drift_checked);
        let drift: Vec<_> = plan
            .warnings
            .iter()
            .filter(|w| w.code == WarningCode::Drift)
            .collect();
        assert_eq!(drift.len(), 1);
        assert!(drift[0].message.contains("no longer exists"));
    }

    #[test]
    fn test_plans_of_identical_input_share_hashes() {
        let desired = vec![channel("c1"), watchlist("w1", &["c1"])];
        let mut reversed = desired.clone();
        reversed.reverse();

        let a = plan(&desired, &StateFile::default());
        let b = plan(&reversed, &StateFile::default());
        assert_eq!(a.metadata.config_hash, b.metadata.config_hash);
        assert_eq!(a.metadata.content_hash, b.metadata.content_hash);
        assert_eq!(a.metadata.plan_id, b.metadata.plan_id);

        let c = plan(&[channel("c1")], &StateFile::default());
        assert_ne!(a.metadata.config_hash, c.metadata.config_hash);
    }

    #[test]
    fn test_changes_missing_from_graph_are_appended() {
        let graph = DependencyGraph::build(&[channel("c1")]);
        let stray = ChangeDetector::new().detect(&[channel("stray")], &StateFile::default());
        let mut changes = ChangeDetector::new().detect(&[channel("c1")], &StateFile::default());
        changes.extend(stray);

        let plan = assemble(&graph, changes, &[channel("c1")], &PlanOptions::default()).unwrap();
        assert_eq!(names(&plan), vec!["c1", "stray"]);
    }

    #[test]
    fn test_artifact_round_trip_and_verify() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("plan.json");
        let desired = vec![channel("c1")];
        let artifact = PlanArtifact::seal(plan(&desired, &StateFile::default())).unwrap();

        artifact.save(&path).unwrap();
        let loaded = PlanArtifact::load(&path).unwrap();
        loaded.verify().unwrap();
        loaded.ensure_fresh(&config_hash(&desired)).unwrap();
        assert_eq!(loaded, artifact);
    }

    #[test]
    fn test_tampered_artifact_is_rejected() {
        let mut artifact =
            PlanArtifact::seal(plan(&[channel("c1")], &StateFile::default())).unwrap();
        artifact.plan.changes[0].change_type = ChangeType::Delete;

        assert!(matches!(artifact.verify(), Err(Error::PlanTampered { .. })));
    }

    #[test]
    fn test_stale_artifact_is_rejected() {
        let artifact = PlanArtifact::seal(plan(&[channel("c1")], &StateFile::default())).unwrap();
        let current = config_hash(&[channel("c1").with_field("address", "new@example.com")]);

        assert!(matches!(
            artifact.ensure_fresh(&current),
            Err(Error::StalePlan { .. })
        ));
    }

    #[test]
    fn test_load_rejects_unknown_artifact_version() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("plan.json");
        fs::write(&path, r#"{"version": 7, "plan": {}, "signature": ""}"#).unwrap();

        assert!(matches!(
            PlanArtifact::load(&path),
            Err(Error::UnsupportedPlanVersion { found: 7, .. })
        ));
    }
}
