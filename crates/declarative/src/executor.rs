//! Execution engine - applies a plan through resource providers
//!
//! A run holds the operation lock for its whole duration, walks the plan's
//! changes in order, keeps an in-memory state snapshot up to date after each
//! success and persists it once at the end. On the first failure (unless
//! `continue_on_error` is set) every earlier success is undone in reverse
//! order where that is possible.

use rayon::prelude::*;
use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::context::ProgressCallback;
use crate::error::{Error, Result};
use crate::planner::ExecutionPlan;
use crate::provider::{ProviderError, ProviderRegistry, RemoteResource, ResolvedRefs};
use crate::state::{StateEntry, StateFile, StateStore};
use crate::types::{
    ApplyResult, ChangeType, ConfigRecord, ExecuteOptions, ExecuteSummary, ExecutionResult,
    ResourceChange, ResourceKind, ResourceResult, RollbackError,
};

/// Whether an apply could start right now
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Readiness {
    pub ready: bool,
    pub reason: Option<String>,
}

/// Applies plans against one state store and provider set
pub struct Executor<'a> {
    store: &'a StateStore,
    providers: &'a ProviderRegistry,
    actor: String,
}

/// One change prepared for dispatch
struct Task<'p> {
    change: &'p ResourceChange,
    record: Option<&'p ConfigRecord>,
    remote_id: Option<String>,
    /// Resolved references, or the first reference that did not resolve
    refs: std::result::Result<ResolvedRefs, String>,
}

/// What a successful dispatch produced
struct Dispatched {
    result: ApplyResult,
    remote: Option<RemoteResource>,
    /// Remote representation before an UPDATE or REPLACE
    before: Option<RemoteResource>,
}

/// A success that rollback may need to undo
struct Applied {
    kind: ResourceKind,
    name: String,
    change_type: ChangeType,
    remote_id: String,
    before: Option<RemoteResource>,
    previous: Option<StateEntry>,
}

/// Mutable state owned by a single `execute` call
struct Run {
    state: StateFile,
    journal: Vec<Applied>,
    results: Vec<ResourceResult>,
    summary: ExecuteSummary,
    error: Option<String>,
}

impl<'a> Executor<'a> {
    pub fn new(store: &'a StateStore, providers: &'a ProviderRegistry) -> Self {
        Self {
            store,
            providers,
            actor: "watchctl".to_string(),
        }
    }

    /// Name recorded as `created_by` on new state entries
    pub fn with_actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = actor.into();
        self
    }

    /// Check whether a live operation currently holds the lock
    pub fn can_execute(&self) -> Result<Readiness> {
        let status = self.store.is_locked()?;
        if !status.locked {
            return Ok(Readiness {
                ready: true,
                reason: None,
            });
        }

        let reason = match status.info {
            Some(info) => format!(
                "{} in progress (pid {}, started {})",
                info.operation,
                info.pid,
                info.created_at.format("%Y-%m-%d %H:%M:%S UTC")
            ),
            None => format!("lock file {} is held", self.store.lock_path().display()),
        };
        Ok(Readiness {
            ready: false,
            reason: Some(reason),
        })
    }

    /// Apply `plan`, using `desired` for the records it refers to
    ///
    /// Structural failures (blocking plan warnings, a held lock, unreadable
    /// state) are returned as errors before any provider call. Per-change
    /// failures are reported inside the [`ExecutionResult`].
    pub fn execute(
        &self,
        plan: &ExecutionPlan,
        desired: &[ConfigRecord],
        options: &ExecuteOptions,
        progress: &mut dyn ProgressCallback,
    ) -> Result<ExecutionResult> {
        plan.ensure_executable()?;

        let operation = if options.dry_run {
            "apply --dry-run"
        } else {
            "apply"
        };
        let guard = self
            .store
            .acquire_lock_with_retry(operation, &options.lock_retry)?;

        let outcome = self.run(plan, desired, options, progress);

        if let Err(e) = guard.release() {
            log::error!("failed to release lock: {e}");
        }
        outcome
    }

    fn run(
        &self,
        plan: &ExecutionPlan,
        desired: &[ConfigRecord],
        options: &ExecuteOptions,
        progress: &mut dyn ProgressCallback,
    ) -> Result<ExecutionResult> {
        let started = Instant::now();
        let records: HashMap<&str, &ConfigRecord> =
            desired.iter().map(|r| (r.name.as_str(), r)).collect();
        let changes: Vec<&ResourceChange> = plan
            .changes
            .iter()
            .filter(|c| options.include_no_change || c.change_type.is_change())
            .collect();

        let mut run = Run {
            state: self.store.load()?,
            journal: Vec::new(),
            results: Vec::with_capacity(changes.len()),
            summary: ExecuteSummary::default(),
            error: None,
        };

        progress.on_run_start(changes.len(), options.dry_run);
        log::info!(
            "applying plan {} ({} changes{})",
            plan.metadata.plan_id,
            changes.len(),
            if options.dry_run { ", dry run" } else { "" }
        );

        let pool = build_pool(options.parallelism);
        let batches = batches(&changes, options.parallelism);

        let mut aborted_at = None;
        for (index, batch) in batches.iter().enumerate() {
            let tasks: Vec<Task> = batch
                .iter()
                .map(|&i| prepare(changes[i], &records, &run.state, options.dry_run))
                .collect();
            for task in &tasks {
                progress.on_change_start(task.change);
            }

            let outcomes = self.dispatch_batch(&tasks, pool.as_ref(), options.dry_run);

            let mut failed = false;
            for (task, (outcome, elapsed)) in tasks.iter().zip(outcomes) {
                let result = self.settle(&mut run, task, outcome, elapsed);
                failed |= !result.result.is_success();
                progress.on_change_complete(&result);
                run.summary.add_result(&result);
                run.results.push(result);
            }

            if failed && !options.continue_on_error {
                aborted_at = Some(index + 1);
                break;
            }
        }

        let mut result = ExecutionResult {
            dry_run: options.dry_run,
            ..ExecutionResult::default()
        };

        if let Some(next) = aborted_at {
            let reason = format!(
                "not attempted after failure: {}",
                run.error.as_deref().unwrap_or("unknown error")
            );
            for &i in batches[next..].iter().flatten() {
                let change = changes[i];
                let skipped = ResourceResult {
                    name: change.name.clone(),
                    kind: change.kind,
                    change_type: change.change_type,
                    remote_id: change.remote_id.clone(),
                    result: ApplyResult::Skipped {
                        reason: reason.clone(),
                    },
                    duration_ms: 0,
                };
                progress.on_change_complete(&skipped);
                run.summary.add_result(&skipped);
                run.results.push(skipped);
            }
            self.rollback(&mut run, &mut result, progress);
        }

        if !options.dry_run {
            self.store.save(&run.state)?;
        }

        run.summary.duration_ms = millis(started.elapsed());
        result.success = run.summary.failed == 0;
        result.results = run.results;
        result.summary = run.summary;
        result.error = run.error;

        log::info!(
            "apply finished: {} changed, {} failed, {} rolled back",
            result.summary.total_changes(),
            result.summary.failed,
            result.rolled_back.len()
        );
        progress.on_run_complete(&result);
        Ok(result)
    }

    fn dispatch_batch(
        &self,
        tasks: &[Task],
        pool: Option<&rayon::ThreadPool>,
        dry_run: bool,
    ) -> Vec<(Result<Dispatched>, Duration)> {
        let timed = |task: &Task| {
            let started = Instant::now();
            let outcome = self.dispatch(task, dry_run);
            (outcome, started.elapsed())
        };

        match pool {
            Some(pool) if tasks.len() > 1 => pool.install(|| tasks.par_iter().map(timed).collect()),
            _ => tasks.iter().map(timed).collect(),
        }
    }

    /// Issue the provider calls for one change
    fn dispatch(&self, task: &Task, dry_run: bool) -> Result<Dispatched> {
        let change = task.change;
        if change.change_type == ChangeType::NoChange {
            return Ok(Dispatched {
                result: ApplyResult::NoChange,
                remote: None,
                before: None,
            });
        }
        if dry_run {
            return Ok(Dispatched {
                result: ApplyResult::Planned,
                remote: None,
                before: None,
            });
        }

        let provider = self.providers.get(change.kind)?;
        let failure = |operation: &'static str, source: ProviderError| Error::ProviderFailure {
            name: change.name.clone(),
            kind: change.kind,
            operation,
            source,
        };

        if change.change_type == ChangeType::Delete {
            let id = self.remote_id(task)?;
            return match provider.delete(id) {
                Ok(()) => Ok(applied(None, None)),
                Err(e) if e.is_not_found() => {
                    log::warn!("{} '{}' was already gone remotely", change.kind, change.name);
                    Ok(applied(None, None))
                }
                Err(e) => Err(failure("delete", e)),
            };
        }

        let record = task.record.ok_or_else(|| Error::MissingRecord {
            name: change.name.clone(),
        })?;
        let refs = task
            .refs
            .as_ref()
            .map_err(|dependency| Error::MissingDependency {
                resource: change.name.clone(),
                dependency: dependency.clone(),
            })?;

        match change.change_type {
            ChangeType::Create => {
                let remote = provider.create(record, refs).map_err(|e| failure("create", e))?;
                Ok(applied(Some(remote), None))
            }
            ChangeType::Update | ChangeType::Replace => {
                let id = self.remote_id(task)?;
                let Some(before) = provider.get_by_id(id).map_err(|e| failure("fetch", e))? else {
                    if change.change_type == ChangeType::Update {
                        return Err(failure(
                            "fetch",
                            ProviderError::NotFound {
                                kind: change.kind,
                                id: id.to_string(),
                            },
                        ));
                    }
                    // An earlier replace destroyed the original but never recreated it
                    log::warn!(
                        "{} '{}' ({id}) is already gone remotely, creating it",
                        change.kind,
                        change.name
                    );
                    let remote = provider.create(record, refs).map_err(|e| failure("create", e))?;
                    return Ok(applied(Some(remote), None));
                };

                let remote = if change.change_type == ChangeType::Replace {
                    provider
                        .replace(id, record, refs)
                        .map_err(|e| failure("replace", e))?
                } else {
                    provider
                        .update(id, record, refs, Some(&before))
                        .map_err(|e| failure("update", e))?
                };
                Ok(applied(Some(remote), Some(before)))
            }
            ChangeType::Delete | ChangeType::NoChange => Ok(applied(None, None)),
        }
    }

    fn remote_id<'t>(&self, task: &'t Task) -> Result<&'t str> {
        task.remote_id.as_deref().ok_or_else(|| Error::UnknownRemote {
            name: task.change.name.clone(),
        })
    }

    /// Record the outcome of one change in the run
    fn settle(
        &self,
        run: &mut Run,
        task: &Task,
        outcome: Result<Dispatched>,
        elapsed: Duration,
    ) -> ResourceResult {
        let change = task.change;
        let mut result = ResourceResult {
            name: change.name.clone(),
            kind: change.kind,
            change_type: change.change_type,
            remote_id: task.remote_id.clone(),
            result: ApplyResult::Applied,
            duration_ms: millis(elapsed),
        };

        let dispatched = match outcome {
            Ok(dispatched) => dispatched,
            Err(e) => {
                log::error!("{e}");
                run.error.get_or_insert_with(|| e.to_string());
                result.result = ApplyResult::Failed {
                    error: e.to_string(),
                };
                return result;
            }
        };
        result.result = dispatched.result;
        if result.result != ApplyResult::Applied {
            return result;
        }

        match (change.change_type, dispatched.remote, task.record) {
            (ChangeType::Delete, _, _) => {
                let previous = run.state.remove(&change.name);
                log::info!("deleted {} '{}'", change.kind, change.name);
                run.journal.push(Applied {
                    kind: change.kind,
                    name: change.name.clone(),
                    change_type: change.change_type,
                    remote_id: task.remote_id.clone().unwrap_or_default(),
                    before: None,
                    previous,
                });
            }
            (change_type, Some(remote), Some(record)) => {
                let previous = run.state.get(&change.name).cloned();
                let entry = StateEntry::applied(
                    record,
                    &remote,
                    previous.as_ref(),
                    &self.actor,
                    self.store.tool_version(),
                );
                run.state.upsert(entry);
                log::info!(
                    "{} {} '{}' ({})",
                    past_tense(change_type),
                    change.kind,
                    change.name,
                    remote.id
                );
                result.remote_id = Some(remote.id.clone());
                run.journal.push(Applied {
                    kind: change.kind,
                    name: change.name.clone(),
                    change_type,
                    remote_id: remote.id,
                    before: dispatched.before,
                    previous,
                });
            }
            _ => {}
        }
        result
    }

    /// Undo journaled successes in reverse order
    fn rollback(
        &self,
        run: &mut Run,
        result: &mut ExecutionResult,
        progress: &mut dyn ProgressCallback,
    ) {
        let journal = std::mem::take(&mut run.journal);
        if journal.is_empty() {
            return;
        }
        log::warn!("rolling back {} applied change(s)", journal.len());

        for applied in journal.into_iter().rev() {
            match applied.change_type {
                ChangeType::Replace | ChangeType::Delete => {
                    log::warn!(
                        "{} of '{}' cannot be rolled back",
                        applied.change_type,
                        applied.name
                    );
                    result.not_rolled_back.push(applied.name);
                    continue;
                }
                ChangeType::Create | ChangeType::Update | ChangeType::NoChange => {}
            }

            match self.undo(&applied) {
                Ok(()) => {
                    match applied.previous {
                        Some(previous) => run.state.upsert(previous),
                        None => {
                            run.state.remove(&applied.name);
                        }
                    }
                    log::info!("rolled back {} '{}'", applied.kind, applied.name);
                    progress.on_rollback(&applied.name, true);
                    result.rolled_back.push(applied.name);
                }
                Err(reason) => {
                    let error = Error::RollbackFailure {
                        name: applied.name.clone(),
                        reason,
                    };
                    log::error!("{error}");
                    progress.on_rollback(&applied.name, false);
                    result.rollback_failures.push(RollbackError {
                        name: applied.name,
                        message: error.to_string(),
                    });
                }
            }
        }
    }

    fn undo(&self, applied: &Applied) -> std::result::Result<(), String> {
        let provider = self
            .providers
            .get(applied.kind)
            .map_err(|e| e.to_string())?;

        match applied.change_type {
            ChangeType::Create => match provider.delete(&applied.remote_id) {
                Ok(()) => Ok(()),
                Err(e) if e.is_not_found() => Ok(()),
                Err(e) => Err(e.to_string()),
            },
            ChangeType::Update => {
                let before = applied
                    .before
                    .as_ref()
                    .ok_or_else(|| "no snapshot taken before update".to_string())?;
                let record = provider.record_from_remote(&applied.name, before);
                provider
                    .update(&applied.remote_id, &record, &ResolvedRefs::new(), None)
                    .map(|_| ())
                    .map_err(|e| e.to_string())
            }
            ChangeType::Replace | ChangeType::Delete | ChangeType::NoChange => Ok(()),
        }
    }
}

fn applied(remote: Option<RemoteResource>, before: Option<RemoteResource>) -> Dispatched {
    Dispatched {
        result: ApplyResult::Applied,
        remote,
        before,
    }
}

/// Gather what a change needs from the current in-memory snapshot
fn prepare<'p>(
    change: &'p ResourceChange,
    records: &HashMap<&str, &'p ConfigRecord>,
    state: &StateFile,
    dry_run: bool,
) -> Task<'p> {
    let record = records.get(change.name.as_str()).copied();
    let remote_id = change
        .remote_id
        .clone()
        .or_else(|| state.get(&change.name).map(|e| e.remote_id.clone()));

    let refs = match record {
        Some(record) if !dry_run && change.change_type != ChangeType::Delete => {
            resolve_refs(record, state)
        }
        _ => Ok(ResolvedRefs::new()),
    };

    Task {
        change,
        record,
        remote_id,
        refs,
    }
}

fn resolve_refs(
    record: &ConfigRecord,
    state: &StateFile,
) -> std::result::Result<ResolvedRefs, String> {
    record
        .reference_set()
        .into_iter()
        .map(|name| match state.get(&name) {
            Some(entry) => Ok((name, entry.remote_id.clone())),
            None => Err(name),
        })
        .collect()
}

/// Split changes into batches that may run concurrently
///
/// A batch only holds changes of one dependency layer, never exceeds
/// `parallelism`, and a DELETE always runs alone.
fn batches(changes: &[&ResourceChange], parallelism: usize) -> Vec<Vec<usize>> {
    let limit = parallelism.max(1);
    let mut batches: Vec<Vec<usize>> = Vec::new();
    let mut current: Vec<usize> = Vec::new();
    let mut depth = 0;

    for (i, change) in changes.iter().enumerate() {
        let is_delete = change.change_type == ChangeType::Delete;

        let closes = is_delete || change.depth != depth || current.len() >= limit;
        if !current.is_empty() && closes {
            batches.push(std::mem::take(&mut current));
        }

        current.push(i);
        depth = change.depth;

        if is_delete {
            batches.push(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        batches.push(current);
    }
    batches
}

fn build_pool(parallelism: usize) -> Option<rayon::ThreadPool> {
    if parallelism <= 1 {
        return None;
    }
    match rayon::ThreadPoolBuilder::new()
        .num_threads(parallelism)
        .build()
    {
        Ok(pool) => Some(pool),
        Err(e) => {
            log::warn!("failed to create thread pool, applying sequentially: {e}");
            None
        }
    }
}

fn past_tense(change_type: ChangeType) -> &'static str {
    match change_type {
        ChangeType::Create => "created",
        ChangeType::Update => "updated",
        ChangeType::Replace => "replaced",
        ChangeType::Delete => "deleted",
        ChangeType::NoChange => "unchanged",
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
