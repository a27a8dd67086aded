//! Persisted record of what was last applied
//!
//! The state file maps logical names to the remote id and fingerprint of the
//! configuration that was last successfully applied. It is read during
//! planning and rewritten atomically at the end of every apply.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::fingerprint::{field_fingerprints, fingerprint, fingerprint_value};
use crate::fsutil;
use crate::provider::RemoteResource;
use crate::types::{ConfigRecord, ResourceKind};

/// State schema version this engine reads and writes
pub const STATE_VERSION: u32 = 1;

/// File name of the state file inside the state directory
pub const STATE_FILE: &str = "state.json";

/// File name of the lock file inside the state directory
pub const LOCK_FILE: &str = "apply.lock";

/// Age after which a lock is considered abandoned
pub const STALE_LOCK_THRESHOLD: Duration = Duration::from_secs(30 * 60);

/// Key in [`EntryMetadata::extra`] holding a custom agent's monitoring type
pub const MONITORING_TYPE_KEY: &str = "monitoring_type";

// ============================================================================
// State Structures
// ============================================================================

/// Bookkeeping attached to each state entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntryMetadata {
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub created_by: String,
    pub tool_version: String,
    /// Kind-specific values recorded at apply time
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, Value>,
}

/// What is known about one applied resource
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateEntry {
    pub kind: ResourceKind,
    pub name: String,
    pub remote_id: String,
    pub last_applied_fingerprint: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seen_remote_fingerprint: Option<String>,
    /// Per-field digests of the applied record, for field-level diffs
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub field_fingerprints: BTreeMap<String, String>,
    pub metadata: EntryMetadata,
}

impl StateEntry {
    /// Build the entry for a record the provider just created or updated.
    ///
    /// `previous` keeps the original creation time and author.
    pub fn applied(
        record: &ConfigRecord,
        remote: &RemoteResource,
        previous: Option<&StateEntry>,
        actor: &str,
        tool_version: &str,
    ) -> Self {
        let now = Utc::now();
        let mut extra = BTreeMap::new();
        if let Some(monitoring_type) = record.monitoring_type() {
            extra.insert(
                MONITORING_TYPE_KEY.to_string(),
                Value::String(monitoring_type.to_string()),
            );
        }

        Self {
            kind: record.kind,
            name: record.name.clone(),
            remote_id: remote.id.clone(),
            last_applied_fingerprint: fingerprint(record),
            last_seen_remote_fingerprint: Some(fingerprint_value(&remote.payload)),
            field_fingerprints: field_fingerprints(record),
            metadata: EntryMetadata {
                created_at: previous.map_or(now, |p| p.metadata.created_at),
                updated_at: now,
                created_by: previous.map_or_else(|| actor.to_string(), |p| {
                    p.metadata.created_by.clone()
                }),
                tool_version: tool_version.to_string(),
                extra,
            },
        }
    }

    /// Monitoring type recorded at the last successful apply
    pub fn monitoring_type(&self) -> Option<&str> {
        self.metadata
            .extra
            .get(MONITORING_TYPE_KEY)
            .and_then(Value::as_str)
    }
}

/// File-level metadata, recomputed on every save
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateFileMetadata {
    pub total_resources: usize,
    #[serde(default)]
    pub resource_counts: BTreeMap<String, usize>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_sync: Option<DateTime<Utc>>,
}

/// The persisted state document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateFile {
    pub version: u32,
    #[serde(default)]
    pub resources: BTreeMap<String, StateEntry>,
    pub metadata: StateFileMetadata,
}

impl Default for StateFile {
    fn default() -> Self {
        Self {
            version: STATE_VERSION,
            resources: BTreeMap::new(),
            metadata: StateFileMetadata {
                total_resources: 0,
                resource_counts: BTreeMap::new(),
                created_at: Utc::now(),
                last_sync: None,
            },
        }
    }
}

/// Lightweight reconciliation view, independent of the planner
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reconciliation {
    pub to_create: Vec<String>,
    pub to_update: Vec<String>,
    pub to_delete: Vec<String>,
    pub no_change: Vec<String>,
}

impl Reconciliation {
    pub fn is_converged(&self) -> bool {
        self.to_create.is_empty() && self.to_update.is_empty() && self.to_delete.is_empty()
    }
}

impl StateFile {
    pub fn get(&self, name: &str) -> Option<&StateEntry> {
        self.resources.get(name)
    }

    pub fn upsert(&mut self, entry: StateEntry) {
        self.resources.insert(entry.name.clone(), entry);
    }

    pub fn remove(&mut self, name: &str) -> Option<StateEntry> {
        self.resources.remove(name)
    }

    /// Recompute totals from the resource map
    pub fn refresh_metadata(&mut self) {
        let mut counts = BTreeMap::new();
        for entry in self.resources.values() {
            *counts.entry(entry.kind.as_str().to_string()).or_insert(0) += 1;
        }
        self.metadata.total_resources = self.resources.len();
        self.metadata.resource_counts = counts;
    }

    /// Classify desired records against this state by fingerprint
    pub fn reconcile(&self, desired: &[ConfigRecord]) -> Reconciliation {
        let mut view = Reconciliation::default();
        let mut seen = HashSet::new();

        for record in desired {
            seen.insert(record.name.as_str());
            match self.resources.get(&record.name) {
                None => view.to_create.push(record.name.clone()),
                Some(entry) if entry.last_applied_fingerprint == fingerprint(record) => {
                    view.no_change.push(record.name.clone());
                }
                Some(_) => view.to_update.push(record.name.clone()),
            }
        }

        view.to_delete = self
            .resources
            .keys()
            .filter(|name| !seen.contains(name.as_str()))
            .cloned()
            .collect();

        view
    }
}

// ============================================================================
// StateStore
// ============================================================================

/// Owner of the state and lock files in one state directory
///
/// No other component touches these files directly.
#[derive(Debug, Clone)]
pub struct StateStore {
    dir: PathBuf,
    pub(crate) stale_after: Duration,
    pub(crate) tool_version: String,
}

impl StateStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            stale_after: STALE_LOCK_THRESHOLD,
            tool_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    /// Override the version recorded in state entries and lock files
    pub fn with_tool_version(mut self, version: impl Into<String>) -> Self {
        self.tool_version = version.into();
        self
    }

    /// Override the lock staleness threshold
    pub fn with_stale_after(mut self, threshold: Duration) -> Self {
        self.stale_after = threshold;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn state_path(&self) -> PathBuf {
        self.dir.join(STATE_FILE)
    }

    pub fn lock_path(&self) -> PathBuf {
        self.dir.join(LOCK_FILE)
    }

    pub fn tool_version(&self) -> &str {
        &self.tool_version
    }

    /// Load state from disk, or an empty state if the file doesn't exist
    pub fn load(&self) -> Result<StateFile> {
        let path = self.state_path();

        if !path.exists() {
            log::debug!("State file does not exist, using empty state");
            return Ok(StateFile::default());
        }

        let content = fs::read_to_string(&path).map_err(|e| Error::io(&path, e))?;

        let raw: Value = serde_json::from_str(&content).map_err(|e| Error::CorruptState {
            path: path.clone(),
            reason: e.to_string(),
        })?;

        let found = raw.get("version").and_then(Value::as_u64);
        if found != Some(u64::from(STATE_VERSION)) {
            return Err(Error::UnsupportedVersion {
                path,
                found,
                expected: STATE_VERSION,
            });
        }

        let state: StateFile = serde_json::from_value(raw).map_err(|e| Error::CorruptState {
            path: path.clone(),
            reason: e.to_string(),
        })?;

        log::debug!(
            "Loaded state from {} ({} resources)",
            path.display(),
            state.resources.len()
        );
        Ok(state)
    }

    /// Save state atomically; counts are always recomputed first
    pub fn save(&self, state: &StateFile) -> Result<()> {
        let path = self.state_path();
        let bytes = self.prepare(state)?;
        fsutil::write_atomic(&path, &bytes)?;
        log::debug!("Saved state to {}", path.display());
        Ok(())
    }

    fn prepare(&self, state: &StateFile) -> Result<Vec<u8>> {
        let mut state = state.clone();
        state.version = STATE_VERSION;
        state.refresh_metadata();
        state.metadata.last_sync = Some(Utc::now());
        Ok(serde_json::to_vec_pretty(&state)?)
    }

    /// Reconcile desired records against the persisted state
    pub fn compare(&self, desired: &[ConfigRecord]) -> Result<Reconciliation> {
        Ok(self.load()?.reconcile(desired))
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{channel, entry_for, watchlist};
    use tempfile::TempDir;

    fn store() -> (TempDir, StateStore) {
        let tmp = TempDir::new().unwrap();
        let store = StateStore::new(tmp.path().join(".watchctl"));
        (tmp, store)
    }

    #[test]
    fn test_load_missing_returns_empty_versioned_state() {
        let (_tmp, store) = store();
        let state = store.load().unwrap();
        assert_eq!(state.version, STATE_VERSION);
        assert!(state.resources.is_empty());
    }

    #[test]
    fn test_save_then_load() {
        let (_tmp, store) = store();
        let mut state = StateFile::default();
        state.upsert(entry_for(&channel("pager"), "ch-1"));
        store.save(&state).unwrap();

        let loaded = store.load().unwrap();
        assert_eq!(loaded.resources.len(), 1);
        assert_eq!(loaded.get("pager").unwrap().remote_id, "ch-1");
        assert!(loaded.metadata.last_sync.is_some());
    }

    #[test]
    fn test_save_recomputes_counts() {
        let (_tmp, store) = store();
        let mut state = StateFile::default();
        state.upsert(entry_for(&channel("pager"), "ch-1"));
        state.upsert(entry_for(&channel("email"), "ch-2"));
        state.upsert(entry_for(&watchlist("w1", &["pager"]), "wl-1"));
        state.metadata.total_resources = 99;
        state.metadata.resource_counts.insert("bogus".into(), 7);
        store.save(&state).unwrap();

        let loaded = store.load().unwrap();
        assert_eq!(loaded.metadata.total_resources, 3);
        assert_eq!(
            loaded.metadata.resource_counts.get("notification_channel"),
            Some(&2)
        );
        assert_eq!(loaded.metadata.resource_counts.get("watchlist"), Some(&1));
        assert!(!loaded.metadata.resource_counts.contains_key("bogus"));
    }

    #[test]
    fn test_load_corrupt_state() {
        let (_tmp, store) = store();
        fs::create_dir_all(store.dir()).unwrap();
        fs::write(store.state_path(), "{ not json").unwrap();

        assert!(matches!(store.load(), Err(Error::CorruptState { .. })));
    }

    #[test]
    fn test_load_structurally_invalid_state_is_corrupt() {
        let (_tmp, store) = store();
        fs::create_dir_all(store.dir()).unwrap();
        fs::write(store.state_path(), r#"{"version": 1, "resources": []}"#).unwrap();

        assert!(matches!(store.load(), Err(Error::CorruptState { .. })));
    }

    #[test]
    fn test_load_rejects_other_versions() {
        let (_tmp, store) = store();
        fs::create_dir_all(store.dir()).unwrap();
        fs::write(store.state_path(), r#"{"version": 2, "resources": {}}"#).unwrap();

        match store.load() {
            Err(Error::UnsupportedVersion {
                found, expected, ..
            }) => {
                assert_eq!(found, Some(2));
                assert_eq!(expected, STATE_VERSION);
            }
            other => panic!("expected UnsupportedVersion, got {other:?}"),
        }
    }

    #[test]
    fn test_failed_rename_leaves_previous_state_byte_for_byte() {
        let (_tmp, store) = store();
        let mut state = StateFile::default();
        state.upsert(entry_for(&channel("pager"), "ch-1"));
        store.save(&state).unwrap();
        let before = fs::read(store.state_path()).unwrap();

        state.upsert(entry_for(&channel("email"), "ch-2"));
        let bytes = store.prepare(&state).unwrap();
        let result = fsutil::write_atomic_with(&store.state_path(), &bytes, |_, _| {
            Err(std::io::Error::other("simulated rename failure"))
        });

        assert!(result.is_err());
        assert_eq!(fs::read(store.state_path()).unwrap(), before);
        let leftovers: Vec<_> = fs::read_dir(store.dir())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains(".tmp-"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_compare_classifies_records() {
        let (_tmp, store) = store();
        let pager = channel("pager");
        let email = channel("email");
        let mut state = StateFile::default();
        state.upsert(entry_for(&pager, "ch-1"));
        state.upsert(entry_for(&email, "ch-2"));
        state.upsert(entry_for(&channel("orphan"), "ch-3"));
        store.save(&state).unwrap();

        let changed_email = email.with_field("address", "ops@example.com");
        let desired = vec![pager, changed_email, channel("sms")];
        let view = store.compare(&desired).unwrap();

        assert_eq!(view.no_change, vec!["pager"]);
        assert_eq!(view.to_update, vec!["email"]);
        assert_eq!(view.to_create, vec!["sms"]);
        assert_eq!(view.to_delete, vec!["orphan"]);
        assert!(!view.is_converged());
    }

    #[test]
    fn test_applied_entry_keeps_creation_metadata() {
        let agent = ConfigRecord::new(ResourceKind::CustomAgent, "pinger").with_field("type", "http");
        let remote = RemoteResource::new("ag-1", serde_json::json!({"id": "ag-1"}));
        let first = StateEntry::applied(&agent, &remote, None, "alice", "0.1.0");
        assert_eq!(first.monitoring_type(), Some("http"));

        let second = StateEntry::applied(&agent, &remote, Some(&first), "bob", "0.2.0");
        assert_eq!(second.metadata.created_by, "alice");
        assert_eq!(second.metadata.created_at, first.metadata.created_at);
        assert_eq!(second.metadata.tool_version, "0.2.0");
    }
}
