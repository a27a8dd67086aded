//! Error types for the reconciliation engine
//!
//! Structural failures (corrupt state, schema mismatch, a held lock) abort
//! an apply before any remote call is made. Per-resource failures are carried
//! inside [`crate::ExecutionResult`] and only surface here when formatted.

use std::path::PathBuf;
use thiserror::Error;

use crate::types::ResourceKind;

/// Errors that can occur while planning or applying
#[derive(Debug, Error)]
pub enum Error {
    /// State file exists but cannot be parsed
    #[error("state file {} is corrupt: {reason}", .path.display())]
    CorruptState { path: PathBuf, reason: String },

    /// State file was written by an incompatible schema
    #[error(
        "state file {} has schema version {}, expected {expected}",
        .path.display(),
        .found.map_or_else(|| "<missing>".to_string(), |v| v.to_string())
    )]
    UnsupportedVersion {
        path: PathBuf,
        found: Option<u64>,
        expected: u32,
    },

    /// Another live operation holds the lock
    #[error(
        "state is locked by {} (pid {})",
        .operation.as_deref().unwrap_or("an unknown operation"),
        .pid.map_or_else(|| "unknown".to_string(), |p| p.to_string())
    )]
    LockHeld {
        pid: Option<u32>,
        operation: Option<String>,
    },

    /// The dependency graph contains a cycle
    #[error("dependency cycle: {}", .cycle.join(" -> "))]
    DependencyCycle { cycle: Vec<String> },

    /// A resource references something absent from the configuration set
    #[error("{resource} depends on {dependency}, which is not defined")]
    MissingDependency {
        resource: String,
        dependency: String,
    },

    /// A provider call for a single resource failed
    #[error("{operation} of {kind} '{name}' failed: {source}")]
    ProviderFailure {
        name: String,
        kind: ResourceKind,
        operation: &'static str,
        #[source]
        source: crate::provider::ProviderError,
    },

    /// A planned change has no matching desired record
    #[error("no desired configuration for '{name}'")]
    MissingRecord { name: String },

    /// A change needs a remote id that neither plan nor state knows
    #[error("no remote id known for '{name}'")]
    UnknownRemote { name: String },

    /// Undoing a previously applied change failed
    #[error("rollback of '{name}' failed: {reason}")]
    RollbackFailure { name: String, reason: String },

    /// No provider registered for a resource kind
    #[error("no provider registered for {kind}")]
    MissingProvider { kind: ResourceKind },

    /// Saved plan does not match its signature
    #[error("plan signature mismatch: expected {expected}, computed {actual}")]
    PlanTampered { expected: String, actual: String },

    /// Saved plan was computed from a different configuration
    #[error("plan is stale: planned against config {planned}, current config is {current}")]
    StalePlan { planned: String, current: String },

    /// Saved plan artifact has an unknown format version
    #[error("unsupported plan artifact version {found}, expected {expected}")]
    UnsupportedPlanVersion { found: u32, expected: u32 },

    /// Filesystem error
    #[error("IO error at {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl Error {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether a retry loop should try again after this error.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::LockHeld { .. })
    }
}

/// Result type for engine operations
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_held_message_names_competitor() {
        let err = Error::LockHeld {
            pid: Some(4242),
            operation: Some("apply".to_string()),
        };
        let msg = err.to_string();
        assert!(msg.contains("4242"));
        assert!(msg.contains("apply"));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_unsupported_version_message() {
        let err = Error::UnsupportedVersion {
            path: PathBuf::from("/tmp/state.json"),
            found: None,
            expected: 1,
        };
        assert!(err.to_string().contains("<missing>"));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_cycle_message_joins_path() {
        let err = Error::DependencyCycle {
            cycle: vec!["a".into(), "b".into(), "a".into()],
        };
        assert_eq!(err.to_string(), "dependency cycle: a -> b -> a");
    }
}
