use clap::{Args, Parser, Subcommand};
use clap_complete::Shell;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "watchctl")]
#[command(author = "watchctl contributors")]
#[command(version)]
#[command(
    about = "Declarative management of notification channels, watchlists and custom agents",
    long_about = None
)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Verbosity level
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress non-essential output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Working root holding the configuration and the state directory [env: WATCHCTL_ROOT]
    #[arg(long, global = true)]
    pub root: Option<String>,

    /// Configuration file (defaults to watchctl.toml or watchctl.json in the root)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Base URL of the remote API [env: WATCHCTL_API_URL]
    #[arg(long, global = true)]
    pub api_url: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Compute the changes needed to converge the remote service
    Plan(PlanArgs),

    /// Apply the configuration (or a saved plan) to the remote service
    Apply(ApplyArgs),

    /// Show state, lock and a quick comparison with the configuration
    Status,

    /// Remove the apply lock
    Unlock {
        /// Remove the lock even if its owner is still running
        #[arg(short, long)]
        force: bool,
    },

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

// ============================================================================
// Plan
// ============================================================================

#[derive(Args)]
pub struct PlanArgs {
    /// Save a signed plan artifact for a later `apply --plan`
    #[arg(short, long)]
    pub out: Option<PathBuf>,

    /// Print the plan as JSON instead of a table
    #[arg(long)]
    pub json: bool,
}

// ============================================================================
// Apply
// ============================================================================

#[derive(Args)]
pub struct ApplyArgs {
    /// Apply a previously saved plan instead of planning again
    #[arg(short, long)]
    pub plan: Option<PathBuf>,

    /// Report what would happen without calling the remote service
    #[arg(short = 'n', long)]
    pub dry_run: bool,

    /// Skip the confirmation prompt
    #[arg(short, long)]
    pub yes: bool,

    /// Keep going after a failed change instead of rolling back
    #[arg(long)]
    pub continue_on_error: bool,

    /// Number of independent changes to dispatch at once
    #[arg(short, long, default_value = "1", value_parser = clap::value_parser!(u16).range(1..))]
    pub jobs: u16,

    /// Also dispatch resources that have not changed
    #[arg(long)]
    pub include_unchanged: bool,
}
