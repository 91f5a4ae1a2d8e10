//! Output formatting for CLI commands.
//!
//! This module provides formatting utilities for displaying
//! information to the user in various formats.

use colored::Colorize;
use serde::Serialize;
use std::fmt::Write;
use tabled::{Table, Tabled};

use crate::config::{ConfigHasher, ReconcileConfig, ValidationResult};
use crate::planner::{Plan, PlanAction, PlanSummary, PlannedAction};
use crate::reconciler::DriftReport;
use crate::scheduler::{NodeStatus, RunReport, RunStatus};
use crate::state::{AppliedState, LockInfo};

use super::commands::OutputFormat;

/// Output formatter for CLI.
#[derive(Debug)]
pub struct OutputFormatter {
    /// Output format.
    format: OutputFormat,
}

/// Plan action row for table display.
#[derive(Tabled)]
struct PlanActionRow {
    #[tabled(rename = "#")]
    index: usize,
    #[tabled(rename = "Action")]
    action: String,
    #[tabled(rename = "Resource")]
    resource: String,
    #[tabled(rename = "Reason")]
    reason: String,
}

/// Node outcome row for table display.
#[derive(Tabled)]
struct NodeRow {
    #[tabled(rename = "Resource")]
    resource: String,
    #[tabled(rename = "Action")]
    action: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "Attempts")]
    attempts: u32,
    #[tabled(rename = "External ID")]
    external_id: String,
    #[tabled(rename = "Error")]
    error: String,
}

/// Applied record row for table display.
#[derive(Tabled)]
struct RecordRow {
    #[tabled(rename = "Resource")]
    resource: String,
    #[tabled(rename = "Kind")]
    kind: String,
    #[tabled(rename = "External ID")]
    external_id: String,
    #[tabled(rename = "Rev")]
    revision: u64,
    #[tabled(rename = "Deposed")]
    deposed: usize,
    #[tabled(rename = "Updated")]
    updated: String,
}

impl OutputFormatter {
    /// Creates a new output formatter.
    #[must_use]
    pub const fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    /// Returns true for JSON output.
    #[must_use]
    pub const fn is_json(&self) -> bool {
        matches!(self.format, OutputFormat::Json)
    }

    /// Formats a reconciliation plan for display.
    #[must_use]
    pub fn format_plan(&self, plan: &Plan, detailed: bool) -> String {
        match self.format {
            OutputFormat::Json => {
                serde_json::to_string_pretty(&PlanJson::new(plan)).unwrap_or_default()
            }
            OutputFormat::Text => Self::format_plan_text(plan, detailed),
        }
    }

    /// Formats a plan as text.
    fn format_plan_text(plan: &Plan, detailed: bool) -> String {
        if !plan.has_changes() {
            return format!(
                "{} No changes required - {} resources up to date.\n",
                "✓".green(),
                plan.len()
            );
        }

        let mut output = String::new();
        let _ = writeln!(output, "\nReconciliation Plan");
        let _ = write!(
            output,
            "   Graph hash: {}\n\n",
            ConfigHasher::new().short_hash(&plan.graph_hash)
        );

        let changed = plan.changed_actions();
        let rows: Vec<PlanActionRow> = changed
            .iter()
            .enumerate()
            .map(|(i, a)| PlanActionRow {
                index: i + 1,
                action: Self::format_action(a),
                resource: format!("{}.{}", a.kind, a.id),
                reason: Self::truncate(&a.reason, 48),
            })
            .collect();
        output.push_str(&Table::new(rows).to_string());
        output.push('\n');

        if detailed {
            output.push_str("\nChanges:\n");
            for action in &changed {
                let _ = writeln!(output, "   {action}");
                for change in &action.changes {
                    let _ = writeln!(output, "       {change}");
                }
                for deposed in action.deposed() {
                    let _ = writeln!(output, "       - deposed instance {deposed}");
                }
            }
        }

        let _ = write!(output, "\n{}\n", Self::format_summary(&plan.summary()));
        output
    }

    /// Formats a run report.
    #[must_use]
    pub fn format_report(&self, report: &RunReport) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(report).unwrap_or_default(),
            OutputFormat::Text => {
                let status = match report.status {
                    RunStatus::Succeeded => format!("{} Run succeeded", "✓".green()),
                    RunStatus::PartialFailure => format!("{} Run partially failed", "✗".red()),
                    RunStatus::Cancelled => format!("{} Run cancelled", "⚠".yellow()),
                };

                let mut output = format!("{status} ({} ms)\n\n", report.duration_ms());
                let rows: Vec<NodeRow> = report
                    .nodes
                    .iter()
                    .map(|n| NodeRow {
                        resource: format!("{}.{}", n.kind, n.id),
                        action: n.action.to_string(),
                        status: Self::format_node_status(n.status),
                        attempts: n.attempts,
                        external_id: n
                            .external_id
                            .as_ref()
                            .map_or_else(|| String::from("-"), |e| Self::truncate(e.as_str(), 24)),
                        error: n
                            .error
                            .as_deref()
                            .map_or_else(String::new, |e| Self::truncate(e, 48)),
                    })
                    .collect();
                if !rows.is_empty() {
                    output.push_str(&Table::new(rows).to_string());
                    output.push('\n');
                }

                let _ = write!(
                    output,
                    "\n   Succeeded: {}  Unchanged: {}  Failed: {}  Blocked: {}  Cancelled: {}\n",
                    report.count(NodeStatus::Succeeded),
                    report.count(NodeStatus::Unchanged),
                    report.count(NodeStatus::Failed),
                    report.count(NodeStatus::Blocked),
                    report.count(NodeStatus::Cancelled)
                );
                output
            }
        }
    }

    /// Formats a drift report.
    #[must_use]
    pub fn format_drift(&self, report: &DriftReport) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(report).unwrap_or_default(),
            OutputFormat::Text => {
                if report.is_converged() {
                    return format!("{} No drift detected - state is converged.\n", "✓".green());
                }

                let mut output = format!("{} Drift detected:\n\n", "⚠".yellow());
                for resource in &report.drifted {
                    let _ = writeln!(
                        output,
                        "   ~ {}.{}: {}",
                        resource.kind,
                        resource.id,
                        resource.keys.join(", ")
                    );
                }
                for id in &report.vanished {
                    let _ = writeln!(output, "   - {id}: no longer exists");
                }
                let _ = write!(
                    output,
                    "\n{}/{} recorded resources have drifted.\n{}\n",
                    report.drifted.len() + report.vanished.len(),
                    report.total_records,
                    Self::format_summary(&report.pending)
                );
                output
            }
        }
    }

    /// Formats the applied records as a table.
    #[must_use]
    pub fn format_records(&self, records: &[AppliedState]) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(records).unwrap_or_default(),
            OutputFormat::Text => {
                if records.is_empty() {
                    return String::from("No resources recorded.\n");
                }

                let rows: Vec<RecordRow> = records
                    .iter()
                    .map(|r| RecordRow {
                        resource: r.id.to_string(),
                        kind: r.kind.to_string(),
                        external_id: Self::truncate(r.external_id.as_str(), 32),
                        revision: r.revision,
                        deposed: r.deposed.len(),
                        updated: r.updated_at.format("%Y-%m-%d %H:%M").to_string(),
                    })
                    .collect();
                let mut output = Table::new(rows).to_string();
                let _ = write!(output, "\n\n{} resources recorded.\n", records.len());
                output
            }
        }
    }

    /// Formats every record with its properties and outputs.
    #[must_use]
    pub fn format_state(&self, records: &[AppliedState], backend: &str, lock: Option<&LockInfo>) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(&StateJson {
                backend,
                lock,
                records,
            })
            .unwrap_or_default(),
            OutputFormat::Text => {
                let mut output = String::new();
                let _ = writeln!(output, "\nState backend: {backend}");
                let _ = write!(output, "   Lock: {}\n\n", Self::describe_lock(lock));

                for record in records {
                    let _ = writeln!(
                        output,
                        "{}.{} ({}, revision {})",
                        record.kind.to_string().bold(),
                        record.id.to_string().bold(),
                        record.external_id,
                        record.revision
                    );
                    if !record.dependencies.is_empty() {
                        let deps: Vec<_> = record.dependencies.iter().map(ToString::to_string).collect();
                        let _ = writeln!(output, "   depends on: {}", deps.join(", "));
                    }
                    for (key, value) in &record.properties {
                        let _ = writeln!(output, "   {key} = {value}");
                    }
                    for (key, value) in &record.outputs {
                        let _ = writeln!(output, "   {} {key} = {value}", "out".dimmed());
                    }
                    for deposed in &record.deposed {
                        let _ = writeln!(output, "   {} deposed instance {deposed}", "-".red());
                    }
                    output.push('\n');
                }

                let _ = writeln!(output, "{} resources recorded.", records.len());
                output
            }
        }
    }

    /// Formats lock information.
    #[must_use]
    pub fn format_lock(&self, lock: Option<&LockInfo>) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(&lock).unwrap_or_default(),
            OutputFormat::Text => format!("Lock: {}\n", Self::describe_lock(lock)),
        }
    }

    /// Formats a validation result with a configuration summary.
    #[must_use]
    pub fn format_validation(
        &self,
        config: &ReconcileConfig,
        result: &ValidationResult,
        show_warnings: bool,
    ) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(&ValidationJson {
                valid: result.is_valid(),
                project: &config.project.name,
                environment: &config.project.environment,
                resources: config.resources.len(),
                errors: result.messages(),
                warnings: &result.warnings,
            })
            .unwrap_or_default(),
            OutputFormat::Text => {
                let mut output = if result.is_valid() {
                    format!("{} Configuration is valid.\n", "✓".green())
                } else {
                    let mut out = format!(
                        "{} Configuration has {} error(s):\n",
                        "✗".red(),
                        result.error_count()
                    );
                    for message in result.messages() {
                        let _ = writeln!(out, "   - {message}");
                    }
                    out
                };

                if show_warnings && result.warning_count() > 0 {
                    let _ = write!(output, "\n{} Warnings:\n", "⚠".yellow());
                    for warning in &result.warnings {
                        let _ = writeln!(output, "   - {warning}");
                    }
                }

                output.push_str("\nConfiguration summary:\n");
                let _ = writeln!(output, "   Project: {}", config.project.name);
                let _ = writeln!(output, "   Environment: {}", config.project.environment);
                let _ = writeln!(output, "   Resources: {}", config.resources.len());
                let kinds: Vec<_> = config.kinds().into_iter().collect();
                let _ = writeln!(output, "   Kinds: {}", kinds.join(", "));
                output
            }
        }
    }

    /// Formats a plan summary with color.
    fn format_summary(summary: &PlanSummary) -> String {
        format!(
            "Plan: {} to create, {} to update, {} to replace, {} to delete, {} unchanged",
            summary.create.to_string().green(),
            summary.update.to_string().yellow(),
            summary.replace.to_string().magenta(),
            summary.delete.to_string().red(),
            summary.unchanged
        )
    }

    /// Formats an action with color.
    fn format_action(action: &PlannedAction) -> String {
        let label = match action.replace_order {
            Some(order) if action.action == PlanAction::Replace => {
                format!("{} replace ({order})", action.symbol())
            }
            _ => format!("{} {}", action.symbol(), action.action),
        };
        match action.action {
            PlanAction::Create => label.green().to_string(),
            PlanAction::Update => label.yellow().to_string(),
            PlanAction::Replace => label.magenta().to_string(),
            PlanAction::Delete => label.red().to_string(),
            PlanAction::NoOp => "~ cleanup".dimmed().to_string(),
        }
    }

    /// Formats a node status with color.
    fn format_node_status(status: NodeStatus) -> String {
        let s = status.to_string();
        match status {
            NodeStatus::Succeeded => s.green().to_string(),
            NodeStatus::Unchanged => s.dimmed().to_string(),
            NodeStatus::Failed => s.red().to_string(),
            NodeStatus::Blocked | NodeStatus::Cancelled => s.yellow().to_string(),
            NodeStatus::Pending | NodeStatus::Ready | NodeStatus::Running => s,
        }
    }

    fn describe_lock(lock: Option<&LockInfo>) -> String {
        match lock {
            None => String::from("unlocked"),
            Some(lock) if lock.is_expired() => format!("{} held by {} (expired)", lock.lock_id, lock.holder),
            Some(lock) => format!(
                "{} held by {} ({}s remaining)",
                lock.lock_id,
                lock.holder,
                lock.remaining_secs()
            ),
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

// JSON serialization helpers

#[derive(Serialize)]
struct PlanJson<'a> {
    graph_hash: &'a str,
    created_at: chrono::DateTime<chrono::Utc>,
    summary: PlanSummary,
    order: &'a [crate::model::ResourceId],
    actions: Vec<&'a PlannedAction>,
}

impl<'a> PlanJson<'a> {
    fn new(plan: &'a Plan) -> Self {
        Self {
            graph_hash: &plan.graph_hash,
            created_at: plan.created_at,
            summary: plan.summary(),
            order: &plan.order,
            actions: plan.changed_actions(),
        }
    }
}

#[derive(Serialize)]
struct StateJson<'a> {
    backend: &'a str,
    lock: Option<&'a LockInfo>,
    records: &'a [AppliedState],
}

#[derive(Serialize)]
struct ValidationJson<'a> {
    valid: bool,
    project: &'a str,
    environment: &'a str,
    resources: usize,
    errors: Vec<String>,
    warnings: &'a [String],
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ExternalId, Properties, ResourceId, ResourceKind};
    use chrono::Utc;
    use std::collections::{BTreeMap, BTreeSet};

    fn create_action(id: &str) -> PlannedAction {
        PlannedAction {
            id: ResourceId::new(id),
            kind: ResourceKind::new("local_file"),
            action: PlanAction::Create,
            changes: Vec::new(),
            replace_order: None,
            desired: None,
            prior: None,
            base_revision: 0,
            vanished: false,
            reason: String::from("not yet created"),
        }
    }

    fn plan(actions: Vec<PlannedAction>) -> Plan {
        Plan {
            created_at: Utc::now(),
            graph_hash: String::from("0123456789abcdef"),
            edges: actions.iter().map(|a| (a.id.clone(), BTreeSet::new())).collect(),
            order: actions.iter().map(|a| a.id.clone()).collect(),
            actions: actions.into_iter().map(|a| (a.id.clone(), a)).collect::<BTreeMap<_, _>>(),
        }
    }

    #[test]
    fn test_plan_json_lists_changed_actions() {
        let formatter = OutputFormatter::new(OutputFormat::Json);
        let json = formatter.format_plan(&plan(vec![create_action("readme")]), false);

        let value: serde_json::Value = serde_json::from_str(&json).expect("valid json");
        assert_eq!(value["summary"]["create"], 1);
        assert_eq!(value["actions"][0]["id"], "readme");
        assert_eq!(value["actions"][0]["action"], "create");
    }

    #[test]
    fn test_plan_text_without_changes() {
        let formatter = OutputFormatter::new(OutputFormat::Text);
        let text = formatter.format_plan(&plan(Vec::new()), true);
        assert!(text.contains("No changes required"));
    }

    #[test]
    fn test_records_table() {
        let record = AppliedState::new(
            ResourceId::new("readme"),
            ResourceKind::new("local_file"),
            ExternalId::new("out/readme.txt"),
            Properties::new(),
            Properties::new(),
            3,
        );
        let formatter = OutputFormatter::new(OutputFormat::Text);
        let text = formatter.format_records(&[record]);
        assert!(text.contains("readme"));
        assert!(text.contains("out/readme.txt"));
        assert!(text.contains("1 resources recorded."));
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        assert_eq!(OutputFormatter::truncate("short", 10), "short");
        assert_eq!(OutputFormatter::truncate("ééééééééé", 6), "ééé...");
    }
}
