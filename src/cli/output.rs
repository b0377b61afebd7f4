//! Output formatting for CLI commands.
//!
//! This module provides formatting utilities for displaying
//! information to the user in various formats.

use colored::Colorize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt::Write;
use tabled::{Table, Tabled};

use crate::config::{DeployConfig, ValidationResult};
use crate::engine::{ApplyOutcome, DriftKind, DriftReport};
use crate::graph::ResourceGraph;
use crate::health::HealthStatus;
use crate::planner::{ChangeAction, ChangeOutcome, DeploymentPlan, ExecutionReport, PlannedChange};
use crate::resource::reference::value_to_text;
use crate::state::{DeploymentState, LockInfo};

use super::commands::OutputFormat;

/// Output formatter for CLI.
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
    #[tabled(rename = "Type")]
    resource_type: String,
    #[tabled(rename = "Reason")]
    reason: String,
}

/// Execution result row for table display.
#[derive(Tabled)]
struct ResultRow {
    #[tabled(rename = "Resource")]
    resource: String,
    #[tabled(rename = "Action")]
    action: String,
    #[tabled(rename = "Outcome")]
    outcome: String,
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "Time")]
    time: String,
}

/// Resource row for state display.
#[derive(Tabled)]
struct ResourceRow {
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "Type")]
    resource_type: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "ID")]
    id: String,
}

impl OutputFormatter {
    /// Creates a new output formatter.
    #[must_use]
    pub const fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    /// Formats a deployment plan for display.
    #[must_use]
    pub fn format_plan(&self, plan: &DeploymentPlan) -> String {
        match self.format {
            OutputFormat::Json => to_json(&PlanJson::from(plan)),
            OutputFormat::Text => Self::format_plan_text(plan),
        }
    }

    /// Formats a plan as text.
    fn format_plan_text(plan: &DeploymentPlan) -> String {
        if plan.is_empty() {
            return format!(
                "{} No changes required - infrastructure is up to date.\n",
                "✓".green()
            );
        }

        let mut output = String::new();
        let _ = write!(output, "\nDeployment Plan\n");
        let _ = write!(output, "   Config hash: {}\n\n", short(&plan.config_hash));

        let rows: Vec<PlanChangeRow> = plan
            .changes
            .iter()
            .filter(|c| c.action != ChangeAction::NoOp)
            .enumerate()
            .map(|(i, c)| PlanChangeRow {
                index: i + 1,
                action: Self::format_action(c),
                resource: c.resource_name.clone(),
                resource_type: c.resource_type.clone(),
                reason: Self::truncate(&c.reason, 48),
            })
            .collect();
        output.push_str(&Table::new(rows).to_string());
        output.push('\n');

        let detailed: Vec<&PlannedChange> = plan.changes.iter().filter(|c| !c.details.is_empty()).collect();
        if !detailed.is_empty() {
            output.push_str("\nChanged properties:\n");
            for change in detailed {
                let _ = writeln!(output, "   {}:", change.resource_name);
                for detail in &change.details {
                    let marker = if detail.forces_replacement {
                        " (forces replacement)".red().to_string()
                    } else {
                        String::new()
                    };
                    let _ = writeln!(
                        output,
                        "     {}: {} -> {}{marker}",
                        detail.field,
                        detail.old_value.as_ref().map_or_else(|| String::from("(none)"), value_to_text),
                        detail.new_value.as_ref().map_or_else(|| String::from("(none)"), value_to_text),
                    );
                }
            }
        }

        let _ = write!(
            output,
            "\nPlan: {} to create, {} to update, {} to replace, {} to delete\n",
            plan.create_count().to_string().green(),
            plan.update_count().to_string().yellow(),
            plan.replace_count().to_string().yellow(),
            plan.delete_count().to_string().red()
        );

        output
    }

    /// Formats the outcome of an apply or destroy run.
    #[must_use]
    pub fn format_outcome(&self, outcome: &ApplyOutcome) -> String {
        match self.format {
            OutputFormat::Json => to_json(&OutcomeJson::from(outcome)),
            OutputFormat::Text => match &outcome.report {
                None if outcome.plan.is_empty() => format!("{} Nothing to do.\n", "✓".green()),
                None => String::from("Cancelled, no changes were made.\n"),
                Some(report) => {
                    let mut output = Self::format_report_text(report);
                    if !outcome.outputs.is_empty() {
                        output.push_str("\nOutputs:\n");
                        output.push_str(&Self::format_outputs_text(&outcome.outputs));
                    }
                    output
                }
            },
        }
    }

    fn format_report_text(report: &ExecutionReport) -> String {
        let rows: Vec<ResultRow> = report
            .results
            .iter()
            .filter(|r| r.outcome != ChangeOutcome::Unchanged)
            .map(|r| ResultRow {
                resource: if r.old_copy {
                    format!("{} (old copy)", r.resource_name)
                } else {
                    r.resource_name.clone()
                },
                action: r.action.to_string(),
                outcome: Self::format_outcome_kind(r.outcome),
                id: r.physical_id.clone().unwrap_or_default(),
                time: format!("{:.1}s", r.duration.as_secs_f64()),
            })
            .collect();

        let mut output = String::new();
        if !rows.is_empty() {
            output.push_str(&Table::new(rows).to_string());
            output.push('\n');
        }

        let status = if report.is_success() {
            format!("{} Apply complete", "✓".green())
        } else if report.cancelled {
            format!("{} Interrupted", "⚠".yellow())
        } else {
            format!("{} Completed with failures", "✗".red())
        };
        let _ = write!(
            output,
            "\n{status}: {} succeeded, {} failed, {} blocked, {} cancelled ({:.1}s)\n",
            report.succeeded(),
            report.failed(),
            report.blocked(),
            report.cancelled_count(),
            report.duration.as_secs_f64()
        );

        let problems: Vec<_> = report.problems().filter(|r| r.error.is_some()).collect();
        if !problems.is_empty() {
            let _ = write!(output, "\n{} Errors:\n", "⚠".yellow());
            for problem in problems {
                let _ = writeln!(
                    output,
                    "   - {}: {}",
                    problem.resource_name,
                    problem.error.as_deref().unwrap_or_default()
                );
            }
        }

        output
    }

    /// Formats a drift report.
    #[must_use]
    pub fn format_drift(&self, report: &DriftReport) -> String {
        match self.format {
            OutputFormat::Json => to_json(report),
            OutputFormat::Text => {
                if report.is_converged() {
                    format!(
                        "{} No drift detected - {} resources match the state.\n",
                        "✓".green(),
                        report.checked
                    )
                } else {
                    let mut output = format!("{} Drift detected:\n\n", "⚠".yellow());
                    for entry in &report.drifted {
                        let what = match &entry.kind {
                            DriftKind::Missing => "missing".red().to_string(),
                            DriftKind::Modified { fields } => format!("modified: {}", fields.join(", ")),
                        };
                        let _ = writeln!(output, "   - {} ({}) {what}", entry.name, entry.physical_id);
                    }
                    let _ = write!(
                        output,
                        "\n{}/{} resources have drifted.\n",
                        report.drifted.len(),
                        report.checked
                    );
                    output
                }
            }
        }
    }

    /// Formats stack outputs.
    #[must_use]
    pub fn format_outputs(&self, outputs: &BTreeMap<String, Value>) -> String {
        match self.format {
            OutputFormat::Json => to_json(outputs),
            OutputFormat::Text if outputs.is_empty() => String::from("No outputs recorded.\n"),
            OutputFormat::Text => Self::format_outputs_text(outputs),
        }
    }

    fn format_outputs_text(outputs: &BTreeMap<String, Value>) -> String {
        let mut output = String::new();
        for (name, value) in outputs {
            let _ = writeln!(output, "   {} = {}", name.bold(), value_to_text(value));
        }
        output
    }

    /// Formats health check results.
    #[must_use]
    pub fn format_health(&self, results: &[HealthStatus]) -> String {
        match self.format {
            OutputFormat::Json => to_json(&results),
            OutputFormat::Text if results.is_empty() => String::from("No health checks configured.\n"),
            OutputFormat::Text => {
                let mut output = String::new();
                for status in results {
                    let mark = if status.healthy { "✓".green() } else { "✗".red() };
                    let _ = writeln!(output, "{mark} {status}");
                }
                output
            }
        }
    }

    /// Formats a validation result.
    #[must_use]
    pub fn format_validation(&self, config: &DeployConfig, result: &ValidationResult, show_warnings: bool) -> String {
        match self.format {
            OutputFormat::Json => to_json(&serde_json::json!({
                "valid": result.is_valid(),
                "project": config.project.qualified_name(),
                "resources": config.resources.len(),
                "errors": result.errors.iter().map(ToString::to_string).collect::<Vec<_>>(),
                "warnings": result.warnings,
            })),
            OutputFormat::Text => {
                let mut output = format!("{} Configuration is valid!\n", "✓".green());
                if show_warnings && !result.warnings.is_empty() {
                    output.push_str("\nWarnings:\n");
                    for warning in &result.warnings {
                        let _ = writeln!(output, "   - {warning}");
                    }
                }
                output.push_str("\nConfiguration summary:\n");
                let _ = writeln!(output, "   Stack: {}", config.project.qualified_name());
                let _ = writeln!(output, "   Resources: {}", config.resources.len());
                let _ = writeln!(output, "   Outputs: {}", config.outputs.len());
                let _ = writeln!(output, "   Checks: {}", config.checks.len());
                output
            }
        }
    }

    /// Formats the dependency graph as layers of resources that may be
    /// created concurrently.
    #[must_use]
    pub fn format_graph(&self, graph: &ResourceGraph) -> String {
        let layers = graph.layers();
        match self.format {
            OutputFormat::Json => to_json(&layers),
            OutputFormat::Text => {
                let mut output = String::new();
                for (i, layer) in layers.iter().enumerate() {
                    let _ = writeln!(output, "Layer {}:", i + 1);
                    for name in layer {
                        let deps = graph.dependencies(name);
                        if deps.is_empty() {
                            let _ = writeln!(output, "   {name}");
                        } else {
                            let _ = writeln!(output, "   {name} <- {}", deps.join(", "));
                        }
                    }
                }
                output
            }
        }
    }

    /// Formats deployment state.
    #[must_use]
    pub fn format_state(&self, state: &DeploymentState, lock: Option<&LockInfo>) -> String {
        match self.format {
            OutputFormat::Json => to_json(state),
            OutputFormat::Text => {
                let mut output = String::new();

                let _ = write!(output, "\nState: {}/{}\n\n", state.project, state.stack);
                let _ = writeln!(output, "   Version: {} (serial {})", state.version, state.serial);
                let _ = writeln!(output, "   Config hash: {}", short(&state.config_hash));
                let _ = writeln!(output, "   Last updated: {}", state.last_updated);
                if let Some(lock) = lock {
                    let _ = writeln!(
                        output,
                        "   {} Locked by {} for {} since {}",
                        "⚠".yellow(),
                        lock.holder,
                        lock.operation,
                        lock.acquired_at.format("%Y-%m-%d %H:%M:%S")
                    );
                }

                if !state.resources.is_empty() {
                    let rows: Vec<ResourceRow> = state
                        .resources
                        .values()
                        .map(|r| ResourceRow {
                            name: r.name.clone(),
                            resource_type: r.resource_type.clone(),
                            status: r.status.to_string(),
                            id: r.physical_id.clone().unwrap_or_default(),
                        })
                        .collect();
                    output.push('\n');
                    output.push_str(&Table::new(rows).to_string());
                    output.push('\n');
                }

                if !state.pending_deletes.is_empty() {
                    output.push_str("\n   Old copies awaiting deletion:\n");
                    for pending in &state.pending_deletes {
                        let _ = writeln!(output, "     - {} ({})", pending.name, pending.physical_id);
                    }
                }

                if !state.history.is_empty() {
                    let _ = writeln!(output, "\n   Recent history ({}):", state.history.len());
                    for entry in state.history.iter().rev().take(5) {
                        let status = if entry.success { "✓" } else { "✗" };
                        let _ = writeln!(
                            output,
                            "     {status} {} - {} ({})",
                            entry.timestamp.format("%Y-%m-%d %H:%M"),
                            entry.operation,
                            entry.resources.join(", ")
                        );
                    }
                }

                output
            }
        }
    }

    /// Formats an action with color.
    fn format_action(change: &PlannedChange) -> String {
        let label = format!("{}{}", change.action.symbol(), change.action);
        match change.action {
            ChangeAction::Create => label.green().to_string(),
            ChangeAction::Update | ChangeAction::Replace => label.yellow().to_string(),
            ChangeAction::Delete if change.old_copy => format!("{label} (old)").red().to_string(),
            ChangeAction::Delete => label.red().to_string(),
            ChangeAction::NoOp => label.dimmed().to_string(),
        }
    }

    /// Formats a change outcome with color.
    fn format_outcome_kind(outcome: ChangeOutcome) -> String {
        let text = outcome.to_string();
        match outcome {
            ChangeOutcome::Succeeded => text.green().to_string(),
            ChangeOutcome::Unchanged => text.dimmed().to_string(),
            ChangeOutcome::Failed => text.red().to_string(),
            ChangeOutcome::Blocked | ChangeOutcome::Cancelled => text.yellow().to_string(),
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

    /// Formats a success message.
    #[must_use]
    pub fn success(&self, message: &str) -> String {
        self.message("success", &"✓".green(), message)
    }

    /// Formats an error message.
    #[must_use]
    pub fn error(&self, message: &str) -> String {
        self.message("error", &"✗".red(), message)
    }

    /// Formats a warning message.
    #[must_use]
    pub fn warning(&self, message: &str) -> String {
        self.message("warning", &"⚠".yellow(), message)
    }

    fn message(&self, status: &str, mark: &colored::ColoredString, message: &str) -> String {
        match self.format {
            OutputFormat::Json => to_json(&serde_json::json!({ "status": status, "message": message })),
            OutputFormat::Text => format!("{mark} {message}"),
        }
    }
}

fn short(hash: &str) -> &str {
    &hash[..8.min(hash.len())]
}

fn to_json<T: serde::Serialize + ?Sized>(value: &T) -> String {
    serde_json::to_string_pretty(value).unwrap_or_default()
}

// JSON serialization helpers

#[derive(serde::Serialize)]
struct PlanJson {
    config_hash: String,
    change_count: usize,
    creates: usize,
    updates: usize,
    replaces: usize,
    deletes: usize,
    unchanged: usize,
    changes: Vec<ChangeJson>,
}

#[derive(serde::Serialize)]
struct ChangeJson {
    action: String,
    resource: String,
    resource_type: String,
    physical_id: Option<String>,
    old_copy: bool,
    reason: String,
    changed_fields: Vec<String>,
    depends_on: Vec<usize>,
}

#[derive(serde::Serialize)]
struct OutcomeJson {
    plan: PlanJson,
    executed: bool,
    success: bool,
    cancelled: bool,
    results: Vec<ResultJson>,
    outputs: BTreeMap<String, Value>,
}

#[derive(serde::Serialize)]
struct ResultJson {
    resource: String,
    action: String,
    old_copy: bool,
    outcome: String,
    physical_id: Option<String>,
    error: Option<String>,
    duration_ms: u128,
}

impl From<&DeploymentPlan> for PlanJson {
    fn from(plan: &DeploymentPlan) -> Self {
        Self {
            config_hash: plan.config_hash.clone(),
            change_count: plan.change_count(),
            creates: plan.create_count(),
            updates: plan.update_count(),
            replaces: plan.replace_count(),
            deletes: plan.delete_count(),
            unchanged: plan.unchanged_count(),
            changes: plan
                .changes
                .iter()
                .filter(|c| c.action != ChangeAction::NoOp)
                .map(|c| ChangeJson {
                    action: c.action.to_string(),
                    resource: c.resource_name.clone(),
                    resource_type: c.resource_type.clone(),
                    physical_id: c.physical_id.clone(),
                    old_copy: c.old_copy,
                    reason: c.reason.clone(),
                    changed_fields: c.details.iter().map(|d| d.field.clone()).collect(),
                    depends_on: c.dependencies.clone(),
                })
                .collect(),
        }
    }
}

impl From<&ApplyOutcome> for OutcomeJson {
    fn from(outcome: &ApplyOutcome) -> Self {
        let results = outcome
            .report
            .iter()
            .flat_map(|r| r.results.iter())
            .map(|r| ResultJson {
                resource: r.resource_name.clone(),
                action: r.action.to_string(),
                old_copy: r.old_copy,
                outcome: r.outcome.to_string(),
                physical_id: r.physical_id.clone(),
                error: r.error.clone(),
                duration_ms: r.duration.as_millis(),
            })
            .collect();

        Self {
            plan: PlanJson::from(&outcome.plan),
            executed: outcome.report.is_some(),
            success: outcome.is_success(),
            cancelled: outcome.report.as_ref().is_some_and(|r| r.cancelled),
            results,
            outputs: outcome.outputs.clone(),
        }
    }
}
