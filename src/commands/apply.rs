//! `watchctl apply`

use anyhow::{Context as AnyhowContext, Result, bail};
use declarative::{
    AutoConfirm, ConfirmCallback, ExecuteOptions, ExecutionPlan, Executor, PlanArtifact,
    ProviderRegistry, config_hash,
};
use dialoguer::Confirm;
use std::io;
use std::path::Path;

use super::{Workspace, plan, render};
use crate::Context;
use crate::cli::ApplyArgs;
use crate::config::Config;
use crate::progress::ApplyProgress;
use crate::provider::{self, ApiConfig};
use crate::ui;

/// Interactive yes/no prompt
struct Prompt;

impl ConfirmCallback for Prompt {
    fn confirm(&mut self, prompt: &str) -> io::Result<bool> {
        Confirm::new()
            .with_prompt(prompt)
            .default(false)
            .interact()
            .map_err(io::Error::other)
    }
}

pub fn run(ctx: &Context, args: ApplyArgs) -> Result<()> {
    let workspace = Workspace::open(ctx)?;
    let config = workspace.load_config(ctx)?;
    let plan = match &args.plan {
        Some(path) => load_saved(path, &config)?,
        None => plan::build(&workspace, &config)?,
    };

    if !ctx.quiet {
        ui::header("Apply");
        if args.dry_run {
            ui::warn("Dry run - no changes will be made");
        }
    }
    render::display_plan(&plan, ctx.verbose > 0);
    render::display_warnings(&plan.warnings);

    if plan.has_blocking_warnings() {
        bail!("Plan has blocking errors; fix the configuration and plan again");
    }
    if !plan.has_changes() && !args.include_unchanged {
        return Ok(());
    }

    let providers = providers(ctx, args.dry_run)?;
    let executor = Executor::new(&workspace.store, &providers);
    let readiness = executor.can_execute()?;
    if !readiness.ready {
        bail!(
            "Cannot apply: {}. If no other watchctl is running, use `watchctl unlock`.",
            readiness.reason.as_deref().unwrap_or("state is locked")
        );
    }

    if !args.dry_run {
        let mut confirm: Box<dyn ConfirmCallback> = if args.yes {
            Box::new(AutoConfirm)
        } else {
            Box::new(Prompt)
        };
        println!();
        let prompt = format!("Apply {}?", render::plan_summary(&plan));
        if !confirm
            .confirm(&prompt)
            .context("Failed to read confirmation")?
        {
            ui::info("Apply cancelled");
            return Ok(());
        }
    }

    let mut progress = ApplyProgress::new(ctx.quiet);
    let result = executor
        .execute(&plan, &config.records, &options(&args), &mut progress)
        .context("Apply aborted before any change was made")?;
    drop(progress);

    render::display_result(&result);
    if !result.success {
        bail!(
            "{} failed",
            ui::count(result.summary.failed, "change")
        );
    }
    Ok(())
}

/// Load a saved plan and check it still applies to this configuration
fn load_saved(path: &Path, config: &Config) -> Result<ExecutionPlan> {
    let artifact = PlanArtifact::load(path)
        .with_context(|| format!("Failed to load plan from {}", path.display()))?;
    artifact
        .verify()
        .context("Saved plan failed verification")?;
    artifact
        .ensure_fresh(&config_hash(&config.records))
        .context("Configuration changed since the plan was saved; run `watchctl plan` again")?;
    log::info!(
        "using saved plan {} from {}",
        artifact.plan.metadata.plan_id,
        path.display()
    );
    Ok(artifact.into_plan())
}

/// Providers for the run; a dry run never calls them, so the API is optional
fn providers(ctx: &Context, dry_run: bool) -> Result<ProviderRegistry> {
    match ApiConfig::resolve(ctx.api_url.as_deref()) {
        Ok(api) => Ok(provider::registry(&api)),
        Err(e) if dry_run => {
            log::debug!("dry run without API access: {e:#}");
            Ok(ProviderRegistry::new())
        }
        Err(e) => Err(e),
    }
}

fn options(args: &ApplyArgs) -> ExecuteOptions {
    ExecuteOptions {
        dry_run: args.dry_run,
        continue_on_error: args.continue_on_error,
        parallelism: usize::from(args.jobs),
        include_no_change: args.include_unchanged,
        ..ExecuteOptions::default()
    }
}
