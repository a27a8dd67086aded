//! Change detection between desired records and persisted state

use regex::Regex;
use std::collections::{BTreeMap, HashSet};
use std::sync::LazyLock;

use crate::fingerprint::{field_fingerprints, field_values, fingerprint};
use crate::state::{StateEntry, StateFile};
use crate::types::{
    ChangeType, ConfigRecord, FieldChange, FieldDiff, ResourceChange, ResourceKind, RiskLevel,
};

/// Paths whose change alters alerting behaviour or credentials
static SENSITIVE_PATH: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(
        r"(?i)(?:^|[._])(?:enabled|thresholds?|triggers?|conditions?|webhooks?|urls?|tokens?|secrets?|credentials?|passwords?|api_keys?)(?:$|[._])",
    )
    .ok()
});

/// Top-level fields that only affect display or membership
static DISPLAY_PATH: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(
        r"^(?:name|display_name|description|references|members|channels|tags|labels)(?:$|\.)",
    )
    .ok()
});

/// Classifies every desired record and every orphaned state entry
#[derive(Debug, Clone, Copy, Default)]
pub struct ChangeDetector;

impl ChangeDetector {
    pub fn new() -> Self {
        Self
    }

    /// One change per desired record, then one DELETE per orphaned entry
    ///
    /// Deletions come last, referencing kinds before channels, then by name.
    pub fn detect(&self, desired: &[ConfigRecord], state: &StateFile) -> Vec<ResourceChange> {
        let mut changes: Vec<ResourceChange> = desired
            .iter()
            .map(|record| classify(record, state.get(&record.name)))
            .collect();

        let wanted: HashSet<&str> = desired.iter().map(|r| r.name.as_str()).collect();
        let mut orphans: Vec<&StateEntry> = state
            .resources
            .values()
            .filter(|entry| !wanted.contains(entry.name.as_str()))
            .collect();
        orphans.sort_by(|a, b| {
            a.kind
                .teardown_rank()
                .cmp(&b.kind.teardown_rank())
                .then_with(|| a.name.cmp(&b.name))
        });
        changes.extend(orphans.into_iter().map(deletion));

        changes
    }
}

fn classify(record: &ConfigRecord, entry: Option<&StateEntry>) -> ResourceChange {
    let desired_fingerprint = fingerprint(record);
    let mut change = ResourceChange {
        kind: record.kind,
        name: record.name.clone(),
        remote_id: None,
        change_type: ChangeType::Create,
        current_fingerprint: None,
        desired_fingerprint: Some(desired_fingerprint.clone()),
        field_diffs: None,
        risk_level: RiskLevel::Low,
        reason: None,
        dependencies: record.reference_set(),
        dependents: Vec::new(),
        depth: 0,
    };

    let Some(entry) = entry else {
        return change;
    };
    change.remote_id = Some(entry.remote_id.clone());
    change.current_fingerprint = Some(entry.last_applied_fingerprint.clone());

    if entry.last_applied_fingerprint == desired_fingerprint {
        change.change_type = ChangeType::NoChange;
        return change;
    }

    let diffs = field_diffs(record, entry);

    if let Some((from, to)) = monitoring_type_change(record, entry) {
        change.change_type = ChangeType::Replace;
        change.risk_level = RiskLevel::High;
        change.reason = Some(format!(
            "monitoring type changes from {from} to {to}; requires destroy and recreate"
        ));
    } else {
        if record.kind == ResourceKind::CustomAgent && entry.monitoring_type().is_none() {
            log::debug!(
                "no recorded monitoring type for {}, treating change as in-place update",
                record.name
            );
        }
        change.change_type = ChangeType::Update;
        change.risk_level = diffs.as_deref().map_or(RiskLevel::Low, assess_risk);
    }
    change.field_diffs = diffs;
    change
}

fn deletion(entry: &StateEntry) -> ResourceChange {
    ResourceChange {
        kind: entry.kind,
        name: entry.name.clone(),
        remote_id: Some(entry.remote_id.clone()),
        change_type: ChangeType::Delete,
        current_fingerprint: Some(entry.last_applied_fingerprint.clone()),
        desired_fingerprint: None,
        field_diffs: None,
        risk_level: RiskLevel::Medium,
        reason: Some("no longer present in configuration".to_string()),
        dependencies: Vec::new(),
        dependents: Vec::new(),
        depth: 0,
    }
}

/// Stored and desired monitoring types, when both are known and differ
fn monitoring_type_change<'a>(
    record: &'a ConfigRecord,
    entry: &'a StateEntry,
) -> Option<(&'a str, &'a str)> {
    let desired = record.monitoring_type()?;
    let stored = entry.monitoring_type()?;
    (stored != desired).then_some((stored, desired))
}

/// Field-level differences against the stored digests.
///
/// `None` when the entry has no digests to compare against.
fn field_diffs(record: &ConfigRecord, entry: &StateEntry) -> Option<Vec<FieldDiff>> {
    if entry.field_fingerprints.is_empty() {
        return None;
    }

    let desired = field_fingerprints(record);
    let mut values = field_values(record);
    let mut diffs = Vec::new();

    for (path, digest) in &desired {
        let change = match entry.field_fingerprints.get(path) {
            None => FieldChange::Added,
            Some(stored) if stored != digest => FieldChange::Modified,
            Some(_) => continue,
        };
        diffs.push(FieldDiff {
            path: path.clone(),
            change,
            desired: values.remove(path),
        });
    }
    for path in entry.field_fingerprints.keys() {
        if !desired.contains_key(path) {
            diffs.push(FieldDiff {
                path: path.clone(),
                change: FieldChange::Removed,
                desired: None,
            });
        }
    }

    diffs.sort_by(|a, b| a.path.cmp(&b.path));
    Some(diffs)
}

/// Risk of an in-place update from the paths it touches
pub fn assess_risk(diffs: &[FieldDiff]) -> RiskLevel {
    if diffs.iter().any(|d| matches(&SENSITIVE_PATH, &d.path)) {
        return RiskLevel::High;
    }
    if !diffs.is_empty() && diffs.iter().all(|d| matches(&DISPLAY_PATH, &d.path)) {
        return RiskLevel::Medium;
    }
    RiskLevel::Low
}

fn matches(pattern: &LazyLock<Option<Regex>>, path: &str) -> bool {
    pattern.as_ref().is_some_and(|re| re.is_match(path))
}

/// Group changes by resource kind
pub fn group_by_kind(changes: &[ResourceChange]) -> BTreeMap<ResourceKind, Vec<&ResourceChange>> {
    let mut groups: BTreeMap<ResourceKind, Vec<&ResourceChange>> = BTreeMap::new();
    for change in changes {
        groups.entry(change.kind).or_default().push(change);
    }
    groups
}
