//! Callbacks the executor reports through
//!
//! These traits keep the engine free of terminal and UI dependencies. The
//! binary supplies a progress bar and an interactive prompt; tests and
//! scripted callers use the no-op implementations.

use std::io;

use crate::types::{ExecutionResult, ResourceChange, ResourceResult};

/// Progress callback for an apply run
///
/// Implement this trait to receive progress updates during execution.
pub trait ProgressCallback: Send {
    /// Called once the lock is held, with the number of changes to dispatch
    fn on_run_start(&mut self, total: usize, dry_run: bool);

    /// Called before a change is dispatched
    fn on_change_start(&mut self, change: &ResourceChange);

    /// Called when a change completes, fails or is skipped
    fn on_change_complete(&mut self, result: &ResourceResult);

    /// Called for each undo attempted during rollback
    fn on_rollback(&mut self, _name: &str, _succeeded: bool) {}

    /// Called after state is persisted, before the lock is released
    fn on_run_complete(&mut self, _result: &ExecutionResult) {}
}

/// Confirmation callback for user interaction
pub trait ConfirmCallback {
    /// Ask the user to confirm an action; `false` means abort
    fn confirm(&mut self, prompt: &str) -> io::Result<bool>;
}

/// No-op progress callback
pub struct NoProgress;

impl ProgressCallback for NoProgress {
    fn on_run_start(&mut self, _total: usize, _dry_run: bool) {}
    fn on_change_start(&mut self, _change: &ResourceChange) {}
    fn on_change_complete(&mut self, _result: &ResourceResult) {}
}

/// Auto-confirm callback (always returns true)
pub struct AutoConfirm;

impl ConfirmCallback for AutoConfirm {
    fn confirm(&mut self, _prompt: &str) -> io::Result<bool> {
        Ok(true)
    }
}

/// Auto-decline callback (always returns false)
pub struct AutoDecline;

impl ConfirmCallback for AutoDecline {
    fn confirm(&mut self, _prompt: &str) -> io::Result<bool> {
        Ok(false)
    }
}
