//! Terminal progress for apply runs.

use colored::Colorize;
use declarative::{
    ApplyResult, ExecutionResult, ProgressCallback, ResourceChange, ResourceResult,
};
use indicatif::{ProgressBar, ProgressStyle};

/// Progress bar driven by the executor's callbacks
pub struct ApplyProgress {
    bar: ProgressBar,
    quiet: bool,
}

impl ApplyProgress {
    pub fn new(quiet: bool) -> Self {
        let bar = if quiet {
            ProgressBar::hidden()
        } else {
            ProgressBar::new(0)
        };
        if let Ok(style) = ProgressStyle::default_bar()
            .template("{spinner:.green} {prefix}[{bar:40.cyan/blue}] {pos}/{len} {msg}")
        {
            bar.set_style(style.progress_chars("=>-"));
        }
        Self { bar, quiet }
    }

    fn line(&self, text: String) {
        if !self.quiet {
            self.bar.suspend(|| println!("{text}"));
        }
    }
}

impl ProgressCallback for ApplyProgress {
    fn on_run_start(&mut self, total: usize, dry_run: bool) {
        self.bar.set_length(total as u64);
        if dry_run {
            self.bar.set_prefix("dry run ");
        }
    }

    fn on_change_start(&mut self, change: &ResourceChange) {
        self.bar
            .set_message(format!("{} {}", change.change_type.as_str().to_lowercase(), change.name));
    }

    fn on_change_complete(&mut self, result: &ResourceResult) {
        let action = result.change_type.as_str().to_lowercase();
        match &result.result {
            ApplyResult::Applied => {
                self.line(format!("  {} {} {}", "✓".green(), action, result.name));
            }
            ApplyResult::Planned => {
                self.line(format!("  {} would {} {}", "•".blue(), action, result.name));
            }
            ApplyResult::NoChange => {}
            ApplyResult::Failed { error } => {
                self.line(format!("  {} {} {} ({})", "✗".red(), action, result.name, error));
            }
            ApplyResult::Skipped { reason } => {
                self.line(format!(
                    "  {} {} {}",
                    "-".dimmed(),
                    result.name,
                    format!("skipped: {reason}").dimmed()
                ));
            }
        }
        self.bar.inc(1);
    }

    fn on_rollback(&mut self, name: &str, succeeded: bool) {
        if succeeded {
            self.line(format!("  {} rolled back {}", "↺".yellow(), name));
        } else {
            self.line(format!("  {} rollback of {} failed", "✗".red(), name));
        }
    }

    fn on_run_complete(&mut self, _result: &ExecutionResult) {
        self.bar.finish_and_clear();
    }
}

impl Drop for ApplyProgress {
    fn drop(&mut self) {
        if !self.bar.is_finished() {
            self.bar.finish_and_clear();
        }
    }
}
