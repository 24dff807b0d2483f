//! Output formatters for migration status, plans and reports.

use crate::commands::ModuleStatus;
use aurora_migrate_core::migration::{MigrationOperationDescription, MigrationReport};
use aurora_migrate_core::Version;
use clap::ValueEnum;
use comfy_table::{Cell, Table};

/// Output format for results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// ASCII table format
    Table,
    /// JSON format
    Json,
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OutputFormat::Table => write!(f, "table"),
            OutputFormat::Json => write!(f, "json"),
        }
    }
}

/// Trait for formatting output.
pub trait Formatter: Send + Sync {
    /// Format the status of each module.
    fn format_status(&self, statuses: &[ModuleStatus]) -> String;

    /// Format planned operations.
    fn format_plans(&self, plans: &[(String, MigrationOperationDescription)]) -> String;

    /// Format the report of an executed operation.
    fn format_report(&self, report: &MigrationReport) -> String;

    /// Format an error message.
    fn format_error(&self, error: &str) -> String;

    /// Format a simple message.
    fn format_message(&self, message: &str) -> String;
}

/// Create a formatter for the given output format.
pub fn create_formatter(format: OutputFormat) -> Box<dyn Formatter> {
    match format {
        OutputFormat::Table => Box::new(TableFormatter),
        OutputFormat::Json => Box::new(JsonFormatter),
    }
}

fn version_text(version: Option<&Version>) -> String {
    version.map_or_else(|| "-".to_string(), |v| v.to_string())
}

/// Table formatter using comfy-table.
pub struct TableFormatter;

impl Formatter for TableFormatter {
    fn format_status(&self, statuses: &[ModuleStatus]) -> String {
        if statuses.is_empty() {
            return "No modules registered".to_string();
        }

        let mut table = Table::new();
        table.set_header(vec!["Module", "Persisted", "Latest", "State", "Lock"]);
        for status in statuses {
            table.add_row(vec![
                Cell::new(&status.module),
                Cell::new(version_text(status.persisted.as_ref())),
                Cell::new(status.latest.to_string()),
                Cell::new(status.state.to_string()),
                Cell::new(status.lock_holder.as_deref().unwrap_or("-")),
            ]);
        }
        table.to_string()
    }

    fn format_plans(&self, plans: &[(String, MigrationOperationDescription)]) -> String {
        let mut table = Table::new();
        table.set_header(vec!["Module", "Operation", "Current", "Start", "End", "Breaking"]);
        for (module, plan) in plans {
            table.add_row(vec![
                Cell::new(module),
                Cell::new(plan.operation_type.to_string()),
                Cell::new(plan.current_version.to_string()),
                Cell::new(version_text(plan.start_version.as_ref())),
                Cell::new(version_text(plan.end_version.as_ref())),
                Cell::new(if plan.breaking_changes { "yes" } else { "no" }),
            ]);
        }
        table.to_string()
    }

    fn format_report(&self, report: &MigrationReport) -> String {
        let mut output = format!(
            "{}: {} ({} -> {})",
            report.module,
            report.operation,
            version_text(report.from_version.as_ref()),
            version_text(report.to_version.as_ref()),
        );

        if !report.steps.is_empty() {
            let mut table = Table::new();
            table.set_header(vec!["Step", "Version", "Status", "Time (ms)", "Detail"]);
            for step in &report.steps {
                table.add_row(vec![
                    Cell::new(step.kind.to_string()),
                    Cell::new(step.version.to_string()),
                    Cell::new(step.status.to_string()),
                    Cell::new(step.duration.as_millis()),
                    Cell::new(step.detail.as_deref().unwrap_or("")),
                ]);
            }
            output.push('\n');
            output.push_str(&table.to_string());
        }

        for warning in &report.warnings {
            output.push_str(&format!("\nwarning: {}", warning));
        }
        output
    }

    fn format_error(&self, error: &str) -> String {
        format!("Error: {}", error)
    }

    fn format_message(&self, message: &str) -> String {
        message.to_string()
    }
}

/// JSON formatter.
pub struct JsonFormatter;

impl Formatter for JsonFormatter {
    fn format_status(&self, statuses: &[ModuleStatus]) -> String {
        let rows: Vec<serde_json::Value> = statuses
            .iter()
            .map(|s| {
                serde_json::json!({
                    "module": s.module,
                    "persisted": s.persisted.map(|v| v.to_string()),
                    "latest": s.latest.to_string(),
                    "state": s.state,
                    "lock_holder": s.lock_holder,
                })
            })
            .collect();
        serde_json::to_string_pretty(&rows).unwrap_or_else(|_| "[]".to_string())
    }

    fn format_plans(&self, plans: &[(String, MigrationOperationDescription)]) -> String {
        let rows: Vec<serde_json::Value> = plans
            .iter()
            .map(|(module, plan)| {
                serde_json::json!({
                    "module": module,
                    "plan": plan,
                })
            })
            .collect();
        serde_json::to_string_pretty(&rows).unwrap_or_else(|_| "[]".to_string())
    }

    fn format_report(&self, report: &MigrationReport) -> String {
        serde_json::to_string_pretty(report).unwrap_or_else(|_| "{}".to_string())
    }

    fn format_error(&self, error: &str) -> String {
        serde_json::json!({
            "error": error
        })
        .to_string()
    }

    fn format_message(&self, message: &str) -> String {
        serde_json::json!({
            "message": message
        })
        .to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aurora_migrate_core::migration::{ModuleState, OperationType, StepKind};
    use std::time::Instant;

    fn status() -> ModuleStatus {
        ModuleStatus {
            module: "Estates".to_string(),
            persisted: Some(Version::parse("1.0").unwrap()),
            latest: Version::parse("1.2").unwrap(),
            state: ModuleState::Behind,
            lock_holder: None,
        }
    }

    #[test]
    fn test_table_status() {
        let out = TableFormatter.format_status(&[status()]);
        assert!(out.contains("Estates"));
        assert!(out.contains("behind"));
        assert!(out.contains("1.2"));
        assert_eq!(TableFormatter.format_status(&[]), "No modules registered");
    }

    #[test]
    fn test_json_status() {
        let out = JsonFormatter.format_status(&[status()]);
        let parsed: serde_json::Value = serde_json::from_str(&out).unwrap();
        assert_eq!(parsed[0]["module"], "Estates");
        assert_eq!(parsed[0]["persisted"], "1.0");
        assert_eq!(parsed[0]["state"], "behind");
        assert!(parsed[0]["lock_holder"].is_null());
    }

    #[test]
    fn test_report_formats() {
        let v = Version::parse("1.1").unwrap();
        let mut report = MigrationReport::new("Estates", OperationType::UpgradeToTarget, None);
        report.record(StepKind::Migrate, v, Instant::now(), None);
        report.to_version = Some(v);
        report.warn("upgrade to 1.1 includes breaking changes");

        let table = TableFormatter.format_report(&report);
        assert!(table.starts_with("Estates: upgrade (- -> 1.1)"));
        assert!(table.contains("migrate"));
        assert!(table.contains("warning: upgrade to 1.1"));

        let json: serde_json::Value =
            serde_json::from_str(&JsonFormatter.format_report(&report)).unwrap();
        assert_eq!(json["to_version"], "1.1");
        assert_eq!(json["steps"][0]["kind"], "migrate");
    }

    #[test]
    fn test_plan_formats() {
        let plan = MigrationOperationDescription::do_nothing(Version::parse("2.0").unwrap());
        let plans = vec![("Assets".to_string(), plan)];

        assert!(TableFormatter.format_plans(&plans).contains("do_nothing"));
        let json: serde_json::Value =
            serde_json::from_str(&JsonFormatter.format_plans(&plans)).unwrap();
        assert_eq!(json[0]["plan"]["operation_type"], "do_nothing");
    }

    #[test]
    fn test_error_and_message() {
        assert_eq!(TableFormatter.format_error("boom"), "Error: boom");
        assert_eq!(JsonFormatter.format_message("ok"), r#"{"message":"ok"}"#);
    }
}
