//! # Declarative
//!
//! A plan/apply reconciliation engine for remotely managed resources.
//!
//! Desired resources are described as [`ConfigRecord`]s. The engine compares
//! them against a local state file, orders the resulting changes by their
//! references, and applies them through one [`ResourceProvider`] per
//! resource kind, rolling back on failure.
//!
//! ## Core Concepts
//!
//! - **Fingerprint**: short BLAKE3 digest of a record's canonical form; equal
//!   fingerprints mean "no change"
//! - **StateStore**: the state file plus the exclusive apply lock
//! - **DependencyGraph**: reference edges and a deterministic execution order
//! - **ChangeDetector**: classifies records as CREATE, UPDATE, REPLACE,
//!   DELETE or NO_CHANGE with a risk level
//! - **ExecutionPlan**: the ordered, hashed change set with warnings
//! - **Executor**: applies a plan with rollback and optional parallelism
//!
//! ## Example
//!
//! ```ignore
//! use declarative::{
//!     ConfigRecord, ExecuteOptions, Executor, NoProgress, Planner, ProviderRegistry,
//!     ResourceKind, StateStore,
//! };
//!
//! let records = vec![
//!     ConfigRecord::new(ResourceKind::NotificationChannel, "pager").with_field("type", "email"),
//!     ConfigRecord::new(ResourceKind::Watchlist, "prod").with_reference("pager"),
//! ];
//!
//! let store = StateStore::new(".watchctl");
//! let plan = Planner::new().plan(&records, &store.load()?)?;
//! plan.ensure_executable()?;
//!
//! let providers = ProviderRegistry::new(); // register one provider per kind
//! let result = Executor::new(&store, &providers).execute(
//!     &plan,
//!     &records,
//!     &ExecuteOptions::default(),
//!     &mut NoProgress,
//! )?;
//! assert!(result.success);
//! ```
//!
//! ## Provider Traits
//!
//! The crate performs no network I/O and no terminal output:
//!
//! - [`ResourceProvider`]: remote create, update, delete and fetch per kind
//! - [`ProgressCallback`]: receives progress updates
//! - [`ConfirmCallback`]: handles user confirmations

pub mod context;
pub mod diff;
pub mod error;
pub mod executor;
pub mod fingerprint;
mod fsutil;
pub mod graph;
pub mod lock;
pub mod planner;
pub mod provider;
pub mod retry;
pub mod state;
pub mod types;

#[cfg(test)]
mod testing;

// Re-export main types at crate root
pub use context::{AutoConfirm, AutoDecline, ConfirmCallback, NoProgress, ProgressCallback};
pub use diff::{ChangeDetector, assess_risk, group_by_kind};
pub use error::{Error, Result};
pub use executor::{Executor, Readiness};
pub use fingerprint::{FINGERPRINT_LEN, field_fingerprints, fingerprint, strip_annotations};
pub use graph::{DependencyEdge, DependencyGraph, GraphNode};
pub use lock::{LockGuard, LockInfo, LockStatus};
pub use planner::{
    ChangeCounts, DriftFinding, ExecutionPlan, PLAN_VERSION, PlanArtifact, PlanMetadata,
    PlanOptions, PlanSummary, PlanWarning, Planner, Severity, WarningCode, assemble, config_hash,
};
pub use provider::{
    ProviderError, ProviderRegistry, ProviderResult, RemoteResource, ResolvedRefs,
    ResourceProvider,
};
pub use retry::{RetryConfig, with_retry};
pub use state::{
    EntryMetadata, Reconciliation, STATE_VERSION, StateEntry, StateFile, StateFileMetadata,
    StateStore,
};
pub use types::{
    ApplyResult, ChangeType, ConfigRecord, ExecuteOptions, ExecuteSummary, ExecutionResult,
    FieldChange, FieldDiff, ResourceChange, ResourceKind, ResourceResult, RiskLevel,
    RollbackError,
};
