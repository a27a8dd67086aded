//! `watchctl status`

use anyhow::{Context as AnyhowContext, Result};
use chrono::{DateTime, Utc};
use colored::Colorize;
use declarative::{LockStatus, Reconciliation, StateFile};

use super::Workspace;
use crate::Context;
use crate::ui;

pub fn run(ctx: &Context) -> Result<()> {
    let workspace = Workspace::open(ctx)?;
    let state = workspace
        .store
        .load()
        .context("Failed to load state")?;
    let lock = workspace
        .store
        .is_locked()
        .context("Failed to inspect lock")?;

    ui::header("watchctl status");
    ui::kv("root", &workspace.root.display().to_string());

    ui::section("State");
    show_state(&state);

    ui::section("Lock");
    show_lock(&lock, Utc::now());

    ui::section("Configuration");
    match workspace.load_config(ctx) {
        Ok(config) => {
            ui::kv("file", &config.path.display().to_string());
            ui::kv("resources", &config.records.len().to_string());
            show_reconciliation(&state.reconcile(&config.records));
        }
        Err(e) => ui::warn(&format!("{e:#}")),
    }

    Ok(())
}

fn show_state(state: &StateFile) {
    if state.resources.is_empty() {
        ui::dim("no resources recorded yet");
        return;
    }
    ui::kv("resources", &state.metadata.total_resources.to_string());
    for (kind, count) in &state.metadata.resource_counts {
        ui::kv(&format!("  {kind}"), &count.to_string());
    }
    if let Some(last_sync) = state.metadata.last_sync {
        ui::kv("last apply", &last_sync.format("%Y-%m-%d %H:%M:%S UTC").to_string());
    }
}

fn show_lock(lock: &LockStatus, now: DateTime<Utc>) {
    match (&lock.info, lock.locked) {
        (Some(info), true) => {
            let minutes = (now - info.created_at).num_minutes();
            println!(
                "  {} {} by pid {} for {}m ({})",
                "locked".red().bold(),
                info.operation,
                info.pid,
                minutes,
                info.cwd.display()
            );
        }
        (None, true) => println!("  {} (owner unknown)", "locked".red().bold()),
        (_, false) if lock.stale => ui::warn("stale lock found and removed"),
        (_, false) => println!("  {}", "unlocked".green()),
    }
}

fn show_reconciliation(rec: &Reconciliation) {
    if rec.is_converged() {
        println!("  {} state matches configuration", "✓".green());
        return;
    }
    let rows = [
        ("to create", rec.to_create.len()),
        ("to update", rec.to_update.len()),
        ("to delete", rec.to_delete.len()),
        ("unchanged", rec.no_change.len()),
    ];
    for (label, count) in rows {
        ui::kv(label, &count.to_string());
    }
    ui::dim("run `watchctl plan` for details");
}
