//! `watchctl plan`

use anyhow::{Context as AnyhowContext, Result, bail};
use declarative::{ExecutionPlan, PlanArtifact, Planner};
use std::path::Path;

use super::{Workspace, render};
use crate::Context;
use crate::cli::PlanArgs;
use crate::config::Config;
use crate::ui;

pub fn run(ctx: &Context, args: PlanArgs) -> Result<()> {
    let workspace = Workspace::open(ctx)?;
    let config = workspace.load_config(ctx)?;
    let plan = build(&workspace, &config)?;

    if let Some(out) = &args.out {
        save(plan.clone(), out)?;
    }

    if args.json {
        println!("{}", serde_json::to_string_pretty(&plan)?);
    } else {
        if !ctx.quiet {
            ui::header("Plan");
            ui::kv("config", &config.path.display().to_string());
            ui::kv("state", &workspace.store.state_path().display().to_string());
        }
        render::display_plan(&plan, ctx.verbose > 0);
        render::display_warnings(&plan.warnings);
        if let Some(out) = &args.out {
            println!();
            ui::info(&format!(
                "Saved plan to {}. Run `watchctl apply --plan {}` to apply it.",
                out.display(),
                out.display()
            ));
        }
    }

    if plan.has_blocking_warnings() {
        bail!("Plan has blocking errors and cannot be applied");
    }
    Ok(())
}

/// Plan the configuration against the current state
pub fn build(workspace: &Workspace, config: &Config) -> Result<ExecutionPlan> {
    let state = workspace
        .store
        .load()
        .context("Failed to load state")?;
    Planner::new()
        .plan(&config.records, &state)
        .context("Failed to compute plan")
}

fn save(plan: ExecutionPlan, out: &Path) -> Result<()> {
    let artifact = PlanArtifact::seal(plan).context("Failed to sign plan")?;
    artifact
        .save(out)
        .with_context(|| format!("Failed to write plan to {}", out.display()))
}
