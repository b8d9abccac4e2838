//! Output formatting for engine results.
//!
//! Text output uses coloured tables; JSON output is stable enough to be
//! consumed by CI scripts.

use colored::Colorize;
use serde::Serialize;
use std::fmt::Write;
use tabled::{Table, Tabled};

use crate::graph::DocumentHasher;
use crate::planner::{ApplyOutcome, ApplyReport, ChangeAction, Plan, PlanSummary, PlannedValue};
use crate::reconciler::{DriftReport, RefreshReport};
use crate::state::StateSnapshot;

use super::OutputFormat;

/// Output formatter for engine results.
#[derive(Debug)]
pub struct OutputFormatter {
    /// Output format.
    format: OutputFormat,
}

/// Plan change row for table display.
#[derive(Tabled)]
struct PlanChangeRow {
    #[tabled(rename = "#")]
    index: usize,
    #[tabled(rename = "Action")]
    action: String,
    #[tabled(rename = "Resource")]
    resource: String,
    #[tabled(rename = "Reason")]
    reason: String,
}

/// Apply outcome row for table display.
#[derive(Tabled)]
struct OutcomeRow {
    #[tabled(rename = "Resource")]
    resource: String,
    #[tabled(rename = "Action")]
    action: String,
    #[tabled(rename = "Result")]
    result: String,
    #[tabled(rename = "Attempts")]
    attempts: u32,
    #[tabled(rename = "Time")]
    duration: String,
}

/// State record row for table display.
#[derive(Tabled)]
struct RecordRow {
    #[tabled(rename = "Resource")]
    resource: String,
    #[tabled(rename = "Remote ID")]
    remote_id: String,
    #[tabled(rename = "Version")]
    version: u64,
    #[tabled(rename = "Updated")]
    updated: String,
}

impl OutputFormatter {
    /// Creates a new output formatter.
    #[must_use]
    pub const fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    /// Formats a plan for display.
    #[must_use]
    pub fn format_plan(&self, plan: &Plan) -> String {
        match self.format {
            OutputFormat::Json => to_json(&PlanJson::from(plan)),
            OutputFormat::Text => Self::format_plan_text(plan),
        }
    }

    fn format_plan_text(plan: &Plan) -> String {
        if plan.is_converged() {
            return format!("{} No changes required - state is converged.\n", "✓".green());
        }

        let mut output = String::new();
        let _ = writeln!(output, "\nPlan {}", plan.id);
        let _ = write!(
            output,
            "   Document hash: {}, state version: {}\n\n",
            DocumentHasher::new().short_hash(&plan.document_hash),
            plan.base_version
        );
        if !plan.data.is_empty() {
            let _ = write!(output, "   Data sources read: {}\n\n", plan.data.len());
        }

        let rows: Vec<PlanChangeRow> = plan
            .actionable()
            .into_iter()
            .enumerate()
            .map(|(i, change)| PlanChangeRow {
                index: i + 1,
                action: Self::format_action(change.action),
                resource: change.address.to_string(),
                reason: Self::truncate(&change.reason, 50),
            })
            .collect();
        output.push_str(&Table::new(rows).to_string());
        output.push('\n');

        for change in plan.actionable() {
            if change.diffs.is_empty() {
                continue;
            }
            let _ = writeln!(output, "\n  {} {}", change.action.symbol(), change.address);
            for diff in &change.diffs {
                let before = diff
                    .before
                    .as_ref()
                    .map_or_else(|| String::from("(unset)"), ToString::to_string);
                let after = match &diff.after {
                    PlannedValue::Known(value) => value.to_string(),
                    PlannedValue::Unknown(_) => String::from("(known after apply)"),
                    PlannedValue::Absent => String::from("(unset)"),
                };
                let marker = if diff.force_new { " # forces replacement".red().to_string() } else { String::new() };
                let _ = writeln!(output, "      {}: {before} -> {after}{marker}", diff.attribute);
            }
        }

        let _ = write!(output, "\n{}\n", Self::format_summary(&plan.summary()));

        let destructive = plan.changes.iter().filter(|c| c.action.is_destructive()).count();
        if destructive > 0 {
            let _ = writeln!(
                output,
                "{} {destructive} change(s) delete remote objects",
                "⚠".yellow()
            );
        }
        output
    }

    /// Formats an apply report.
    #[must_use]
    pub fn format_apply(&self, report: &ApplyReport) -> String {
        match self.format {
            OutputFormat::Json => to_json(report),
            OutputFormat::Text => {
                let status = if report.is_success() {
                    format!("{} Apply complete", "✓".green())
                } else if report.cancelled {
                    format!("{} Apply cancelled", "⚠".yellow())
                } else {
                    format!("{} Apply finished with errors", "✗".red())
                };

                let rows: Vec<OutcomeRow> = report
                    .outcomes
                    .iter()
                    .filter(|node| node.action != ChangeAction::NoOp)
                    .map(|node| OutcomeRow {
                        resource: node.address.to_string(),
                        action: Self::format_action(node.action),
                        result: Self::format_outcome(&node.outcome),
                        attempts: node.attempts,
                        duration: format!("{}ms", node.duration_ms),
                    })
                    .collect();

                let mut output = format!("{status}\n\n");
                if !rows.is_empty() {
                    output.push_str(&Table::new(rows).to_string());
                    output.push('\n');
                }
                let _ = write!(
                    output,
                    "\n{} succeeded, {} failed, {} skipped (state version {})\n",
                    report.succeeded().to_string().green(),
                    report.failed().to_string().red(),
                    report.skipped().to_string().yellow(),
                    report.final_version
                );
                output
            }
        }
    }

    /// Formats a drift report.
    #[must_use]
    pub fn format_drift(&self, report: &DriftReport) -> String {
        match self.format {
            OutputFormat::Json => to_json(&DriftJson::from(report)),
            OutputFormat::Text => {
                let mut output = Self::format_refresh_text(&report.refresh);
                if report.is_converged() {
                    let _ = writeln!(output, "{} No drift detected - state is converged.", "✓".green());
                } else {
                    let _ = write!(output, "{} Drift detected:\n\n", "⚠".yellow());
                    for change in report.drifted() {
                        let _ = writeln!(output, "   - {change}");
                    }
                    let _ = write!(output, "\n{}\n", Self::format_summary(&report.plan.summary()));
                }
                output
            }
        }
    }

    /// Formats a refresh report.
    #[must_use]
    pub fn format_refresh(&self, report: &RefreshReport) -> String {
        match self.format {
            OutputFormat::Json => to_json(report),
            OutputFormat::Text => Self::format_refresh_text(report),
        }
    }

    fn format_refresh_text(report: &RefreshReport) -> String {
        let mut output = String::new();
        for address in &report.updated {
            let _ = writeln!(output, "   {} {address} changed remotely", "~".yellow());
        }
        for address in &report.removed {
            let _ = writeln!(output, "   {} {address} no longer exists", "-".red());
        }
        let _ = writeln!(
            output,
            "Refreshed: {} updated, {} removed, {} unchanged",
            report.updated.len(),
            report.removed.len(),
            report.unchanged
        );
        output
    }

    /// Formats a state snapshot.
    #[must_use]
    pub fn format_state(&self, snapshot: &StateSnapshot) -> String {
        match self.format {
            OutputFormat::Json => to_json(&StateJson::from(snapshot)),
            OutputFormat::Text => {
                let mut output = format!("\nState version {}\n\n", snapshot.version);
                if snapshot.is_empty() {
                    output.push_str("   No resources recorded.\n");
                    return output;
                }

                let rows: Vec<RecordRow> = snapshot
                    .records
                    .values()
                    .map(|record| RecordRow {
                        resource: record.address.to_string(),
                        remote_id: Self::truncate(&record.remote_id, 24),
                        version: record.version,
                        updated: record.updated_at.format("%Y-%m-%d %H:%M").to_string(),
                    })
                    .collect();
                output.push_str(&Table::new(rows).to_string());
                output.push('\n');
                output
            }
        }
    }

    fn format_summary(summary: &PlanSummary) -> String {
        format!(
            "Plan: {} to create, {} to update, {} to replace, {} to destroy",
            summary.create.to_string().green(),
            summary.update.to_string().yellow(),
            summary.replace.to_string().yellow(),
            summary.destroy.to_string().red()
        )
    }

    /// Formats an action with color.
    fn format_action(action: ChangeAction) -> String {
        match action {
            ChangeAction::Create => "+create".green().to_string(),
            ChangeAction::Update => "~update".yellow().to_string(),
            ChangeAction::Replace => "-/+replace".yellow().to_string(),
            ChangeAction::Destroy => "-destroy".red().to_string(),
            ChangeAction::NoOp => "no-op".dimmed().to_string(),
        }
    }

    fn format_outcome(outcome: &ApplyOutcome) -> String {
        match outcome {
            ApplyOutcome::Success { .. } => "success".green().to_string(),
            ApplyOutcome::Failure { kind, message } => {
                format!("{} [{kind}] {}", "failed".red(), Self::truncate(message, 40))
            }
            ApplyOutcome::Skipped { reason } => {
                format!("{} {}", "skipped".yellow(), Self::truncate(reason, 40))
            }
        }
    }

    /// Truncates a string to a maximum number of characters.
    fn truncate(s: &str, max_len: usize) -> String {
        if s.chars().count() <= max_len {
            s.to_string()
        } else {
            let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
            format!("{kept}...")
        }
    }
}

fn to_json<T: Serialize>(value: &T) -> String {
    serde_json::to_string_pretty(value).unwrap_or_default()
}

// JSON serialization helpers

#[derive(Serialize)]
struct PlanJson<'a> {
    id: String,
    document_hash: &'a str,
    base_version: u64,
    summary: PlanSummary,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    data_sources: Vec<String>,
    changes: Vec<ChangeJson<'a>>,
}

#[derive(Serialize)]
struct ChangeJson<'a> {
    action: ChangeAction,
    address: String,
    reason: &'a str,
    dependencies: Vec<String>,
    diffs: &'a [crate::planner::AttributeDiff],
}

#[derive(Serialize)]
struct DriftJson<'a> {
    converged: bool,
    refresh: &'a RefreshReport,
    drifted: Vec<ChangeJson<'a>>,
}

#[derive(Serialize)]
struct StateJson<'a> {
    version: u64,
    records: Vec<&'a crate::state::RemoteStateRecord>,
}

impl<'a> From<&'a crate::planner::PlannedChange> for ChangeJson<'a> {
    fn from(change: &'a crate::planner::PlannedChange) -> Self {
        Self {
            action: change.action,
            address: change.address.to_string(),
            reason: &change.reason,
            dependencies: change.dependencies.iter().map(ToString::to_string).collect(),
            diffs: &change.diffs,
        }
    }
}

impl<'a> From<&'a Plan> for PlanJson<'a> {
    fn from(plan: &'a Plan) -> Self {
        Self {
            id: plan.id.to_string(),
            document_hash: &plan.document_hash,
            base_version: plan.base_version,
            summary: plan.summary(),
            data_sources: plan.data.keys().map(ToString::to_string).collect(),
            changes: plan.changes.iter().map(ChangeJson::from).collect(),
        }
    }
}

impl<'a> From<&'a DriftReport> for DriftJson<'a> {
    fn from(report: &'a DriftReport) -> Self {
        Self {
            converged: report.is_converged(),
            refresh: &report.refresh,
            drifted: report.drifted().into_iter().map(ChangeJson::from).collect(),
        }
    }
}

impl<'a> From<&'a StateSnapshot> for StateJson<'a> {
    fn from(snapshot: &'a StateSnapshot) -> Self {
        Self {
            version: snapshot.version,
            records: snapshot.records.values().collect(),
        }
    }
}
