//! Plan and result display

use colored::{ColoredString, Colorize};
use declarative::{
    ChangeType, ExecutionPlan, ExecutionResult, FieldChange, PlanWarning, ResourceChange,
    ResourceKind, RiskLevel, Severity,
};

use crate::ui;

fn kind_title(kind: ResourceKind) -> &'static str {
    match kind {
        ResourceKind::NotificationChannel => "Notification channels",
        ResourceKind::Watchlist => "Watchlists",
        ResourceKind::CustomAgent => "Custom agents",
    }
}

fn symbol(change_type: ChangeType) -> ColoredString {
    match change_type {
        ChangeType::Create => "+".green(),
        ChangeType::Update => "~".yellow(),
        ChangeType::Replace => "±".magenta(),
        ChangeType::Delete => "-".red(),
        ChangeType::NoChange => "=".dimmed(),
    }
}

fn risk(level: RiskLevel) -> String {
    match level {
        RiskLevel::Low => String::new(),
        RiskLevel::Medium => format!(" [{level} risk]").yellow().to_string(),
        RiskLevel::High => format!(" [{level} risk]").red().bold().to_string(),
    }
}

/// One-line plan summary, e.g. "2 to create, 1 to update, 0 to replace, 0 to delete"
pub fn plan_summary(plan: &ExecutionPlan) -> String {
    let totals = &plan.summary.totals;
    format!(
        "{} to create, {} to update, {} to replace, {} to delete",
        totals.to_create, totals.to_update, totals.to_replace, totals.to_delete
    )
}

/// Display a plan in execution order, grouped by kind
///
/// With `show_unchanged`, NO_CHANGE entries are listed too.
pub fn display_plan(plan: &ExecutionPlan, show_unchanged: bool) {
    if !plan.has_changes() {
        println!();
        println!(
            "  {} No changes needed ({} up to date)",
            "✓".green(),
            ui::count(plan.summary.totals.no_change, "resource")
        );
        return;
    }

    println!();
    println!(
        "┌─ {} ─────────────────────────────────────────┐",
        "Execution Plan".bold()
    );
    println!("│");

    for kind in ResourceKind::ALL {
        let changes: Vec<&ResourceChange> = plan
            .changes
            .iter()
            .filter(|c| c.kind == kind && (show_unchanged || c.change_type.is_change()))
            .collect();
        if changes.is_empty() {
            continue;
        }
        println!("│ {}", kind_title(kind).bold());
        for change in changes {
            display_change(change);
        }
        println!("│");
    }

    println!("├─────────────────────────────────────────────────────┤");
    println!("│ Plan: {}", plan_summary(plan).bold());
    println!("│ {}", format!("id {}", plan.metadata.plan_id).dimmed());
    println!("└─────────────────────────────────────────────────────┘");
}

fn display_change(change: &ResourceChange) {
    let reason = change
        .reason
        .as_deref()
        .map(|r| format!(" ({r})"))
        .unwrap_or_default();
    println!(
        "│   {} {:<30}{}{}",
        symbol(change.change_type),
        change.name,
        reason.dimmed(),
        risk(change.risk_level)
    );

    for diff in change.field_diffs.iter().flatten() {
        let (mark, value) = match diff.change {
            FieldChange::Added => ("+".green(), diff.desired.as_ref()),
            FieldChange::Modified => ("~".yellow(), diff.desired.as_ref()),
            FieldChange::Removed => ("-".red(), None),
        };
        let value = value.map(|v| format!(" = {v}")).unwrap_or_default();
        println!("│       {} {}{}", mark, diff.path, value.dimmed());
    }

    if !change.dependencies.is_empty() {
        println!(
            "│       {}",
            format!("after {}", change.dependencies.join(", ")).dimmed()
        );
    }
}

/// Display plan warnings, most severe first
pub fn display_warnings(warnings: &[PlanWarning]) {
    if warnings.is_empty() {
        return;
    }

    let mut sorted: Vec<&PlanWarning> = warnings.iter().collect();
    sorted.sort_by(|a, b| b.severity.cmp(&a.severity));

    println!();
    for warning in sorted {
        match warning.severity {
            Severity::Error => ui::error(&warning.message),
            Severity::Warning => ui::warn(&warning.message),
            Severity::Info => ui::info(&warning.message),
        }
    }
}

/// Display the outcome of an apply
pub fn display_result(result: &ExecutionResult) {
    let summary = &result.summary;

    ui::section("Summary");
    if result.dry_run {
        ui::kv("would change", &summary.planned.to_string());
    } else {
        ui::kv("created", &summary.created.to_string());
        ui::kv("updated", &summary.updated.to_string());
        ui::kv("replaced", &summary.replaced.to_string());
        ui::kv("deleted", &summary.deleted.to_string());
    }
    if summary.failed > 0 {
        ui::kv("failed", &summary.failed.to_string().red().to_string());
    }
    if summary.skipped > 0 {
        ui::kv("skipped", &summary.skipped.to_string());
    }
    ui::kv("duration", &ui::format_duration(summary.duration_ms));

    if !result.rolled_back.is_empty() {
        ui::section("Rolled back");
        for name in &result.rolled_back {
            ui::dim(name);
        }
    }

    if !result.not_rolled_back.is_empty() {
        println!();
        ui::warn("These changes cannot be undone automatically and were left in place:");
        for name in &result.not_rolled_back {
            ui::dim(name);
        }
    }

    for failure in &result.rollback_failures {
        ui::error(&format!("rollback of {} failed: {}", failure.name, failure.message));
    }

    println!();
    match (&result.error, result.success) {
        (Some(error), _) => ui::error(&format!("Apply failed: {error}")),
        (None, false) => ui::error("Apply finished with failures"),
        (None, true) if result.dry_run => ui::success("Dry run complete, nothing was changed"),
        (None, true) => ui::success(&format!(
            "Apply complete: {}",
            ui::count(summary.total_changes(), "change")
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use declarative::{ConfigRecord, Planner, StateFile};

    #[test]
    fn test_plan_summary_counts() {
        let records = vec![
            ConfigRecord::new(ResourceKind::NotificationChannel, "pager"),
            ConfigRecord::new(ResourceKind::Watchlist, "prod").with_reference("pager"),
        ];
        let plan = Planner::new().plan(&records, &StateFile::default()).unwrap();
        assert_eq!(
            plan_summary(&plan),
            "2 to create, 0 to update, 0 to replace, 0 to delete"
        );
    }

    #[test]
    fn test_low_risk_has_no_marker() {
        assert!(risk(RiskLevel::Low).is_empty());
        assert!(risk(RiskLevel::High).contains("high risk"));
    }
}
