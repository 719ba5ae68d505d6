//! Output formatting utilities

use anyhow::Result;
use clap::ValueEnum;
use colored::Colorize;
use scan_lib::{
    ErrorScope, ItemError, RecommendedValue, ResourceType, ScanReport, ScanStatus, Severity,
};
use serde::Serialize;
use tabled::{settings::Style, Table, Tabled};

/// Output format for CLI commands
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Table format (default)
    #[default]
    Table,
    /// JSON format
    Json,
}

/// Print a table from a list of items
pub fn print_table<T: Tabled + Serialize>(items: &[T], format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Table => {
            if items.is_empty() {
                println!("{}", "No items found".yellow());
                return Ok(());
            }
            println!("{}", Table::new(items).with(Style::rounded()));
        }
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&items)?),
    }
    Ok(())
}

/// Print an error message
pub fn print_error(message: &str) {
    eprintln!("{} {}", "✗".red().bold(), message);
}

/// Print a warning message
pub fn print_warning(message: &str) {
    println!("{} {}", "⚠".yellow().bold(), message);
}

/// Print an info message
pub fn print_info(message: &str) {
    println!("{} {}", "ℹ".blue().bold(), message);
}

/// Row for the recommendations table
#[derive(Tabled)]
struct RecommendationRow {
    #[tabled(rename = "Cluster")]
    cluster: String,
    #[tabled(rename = "Namespace")]
    namespace: String,
    #[tabled(rename = "Workload")]
    workload: String,
    #[tabled(rename = "Container")]
    container: String,
    #[tabled(rename = "Resource")]
    resource: String,
    #[tabled(rename = "Req")]
    current_request: String,
    #[tabled(rename = "Lim")]
    current_limit: String,
    #[tabled(rename = "Rec Req")]
    request: String,
    #[tabled(rename = "Rec Lim")]
    limit: String,
    #[tabled(rename = "Samples")]
    samples: usize,
    #[tabled(rename = "Severity")]
    severity: String,
}

/// Row for the errors table
#[derive(Tabled)]
struct ErrorRow {
    #[tabled(rename = "Cluster")]
    cluster: String,
    #[tabled(rename = "Target")]
    target: String,
    #[tabled(rename = "Kind")]
    kind: String,
    #[tabled(rename = "Message")]
    message: String,
}

impl From<&ItemError> for ErrorRow {
    fn from(err: &ItemError) -> Self {
        let target = match &err.scope {
            ErrorScope::Cluster { .. } => "-".to_string(),
            ErrorScope::Item(key) => format!(
                "{}/{} {}/{} [{}]",
                key.container.namespace,
                key.container.workload,
                key.container.kind,
                key.container.container,
                key.resource
            ),
        };
        Self {
            cluster: err.scope.cluster().to_string(),
            target,
            kind: serde_json::to_value(err.kind)
                .ok()
                .and_then(|v| v.as_str().map(str::to_string))
                .unwrap_or_default(),
            message: err.message.clone(),
        }
    }
}

/// Render a scan report
pub fn print_report(report: &ScanReport, format: OutputFormat) -> Result<()> {
    if format == OutputFormat::Json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }

    let rows: Vec<RecommendationRow> = report
        .recommendations
        .iter()
        .map(|rec| RecommendationRow {
            cluster: rec.container.cluster.clone(),
            namespace: rec.container.namespace.clone(),
            workload: format!("{}/{}", rec.container.kind, rec.container.workload),
            container: rec.container.container.clone(),
            resource: rec.resource.to_string(),
            current_request: format_current(rec.resource, rec.current.request),
            current_limit: format_current(rec.resource, rec.current.limit),
            request: format_recommended(rec.resource, rec.request),
            limit: format_recommended(rec.resource, rec.limit),
            samples: rec.sample_count,
            severity: color_severity(rec.severity),
        })
        .collect();

    if rows.is_empty() {
        print_warning("No recommendations produced");
    } else {
        println!("{}", Table::new(&rows).with(Style::rounded()));
    }

    for notice in &report.notices {
        print_info(&format!("{}: {}", notice.scope.cluster(), notice.message));
    }

    if !report.errors.is_empty() {
        println!();
        print_errors(&report.errors);
    }

    println!();
    let summary = &report.summary;
    let by_severity: Vec<String> = summary
        .by_severity
        .iter()
        .map(|(severity, count)| format!("{} {}", count, color_severity(*severity)))
        .collect();
    println!(
        "{} {} items, {} errors ({} clusters failed){}{}",
        color_status(report.status()),
        summary.total_items,
        summary.total_errors,
        summary.failed_clusters,
        if by_severity.is_empty() { "" } else { ": " },
        by_severity.join(", ")
    );
    Ok(())
}

/// Render recorded errors as a table
pub fn print_errors(errors: &[ItemError]) {
    let rows: Vec<ErrorRow> = errors.iter().map(ErrorRow::from).collect();
    println!("{}", Table::new(&rows).with(Style::rounded()));
}

/// Format bytes as human-readable string
pub fn format_bytes(bytes: f64) -> String {
    const KB: f64 = 1024.0;
    const MB: f64 = KB * 1024.0;
    const GB: f64 = MB * 1024.0;

    if bytes >= GB {
        format!("{:.2}Gi", bytes / GB)
    } else if bytes >= MB {
        format!("{:.0}Mi", bytes / MB)
    } else if bytes >= KB {
        format!("{:.0}Ki", bytes / KB)
    } else {
        format!("{:.0}B", bytes)
    }
}

/// Format cores as human-readable string
pub fn format_cpu(cores: f64) -> String {
    if cores >= 1.0 {
        format!("{:.2}", cores)
    } else {
        format!("{:.0}m", cores * 1000.0)
    }
}

fn format_amount(resource: ResourceType, value: f64) -> String {
    match resource {
        ResourceType::Cpu => format_cpu(value),
        ResourceType::Memory => format_bytes(value),
    }
}

/// Current spec value; `-` when the field is absent
pub fn format_current(resource: ResourceType, value: Option<f64>) -> String {
    value.map_or_else(|| "-".to_string(), |v| format_amount(resource, v))
}

pub fn format_recommended(resource: ResourceType, value: RecommendedValue) -> String {
    match value {
        RecommendedValue::Value(v) => format_amount(resource, v),
        RecommendedValue::Unset => "unset".to_string(),
        RecommendedValue::Undetermined => "?".to_string(),
    }
}

pub fn color_severity(severity: Severity) -> String {
    match severity {
        Severity::Ok => severity.as_str().green().to_string(),
        Severity::Warning => severity.as_str().yellow().to_string(),
        Severity::Critical => severity.as_str().red().bold().to_string(),
        Severity::Undetermined => severity.as_str().dimmed().to_string(),
    }
}

pub fn color_status(status: ScanStatus) -> String {
    match status {
        ScanStatus::Complete => "✓ complete".green().bold().to_string(),
        ScanStatus::Partial => "⚠ partial".yellow().bold().to_string(),
        ScanStatus::Failed => "✗ failed".red().bold().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_cpu() {
        assert_eq!(format_cpu(0.25), "250m");
        assert_eq!(format_cpu(0.0104), "10m");
        assert_eq!(format_cpu(1.5), "1.50");
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512.0), "512B");
        assert_eq!(format_bytes(256.0 * 1024.0 * 1024.0), "256Mi");
        assert_eq!(format_bytes(1.5 * 1024.0 * 1024.0 * 1024.0), "1.50Gi");
    }

    #[test]
    fn test_format_recommended() {
        assert_eq!(
            format_recommended(ResourceType::Cpu, RecommendedValue::Value(0.5)),
            "500m"
        );
        assert_eq!(
            format_recommended(ResourceType::Memory, RecommendedValue::Unset),
            "unset"
        );
        assert_eq!(
            format_recommended(ResourceType::Memory, RecommendedValue::Undetermined),
            "?"
        );
        assert_eq!(format_current(ResourceType::Cpu, None), "-");
    }

    #[test]
    fn test_error_row_kind_name() {
        let err = ItemError::cluster("prod", scan_lib::ErrorKind::EmptySelection, "nothing");
        let row = ErrorRow::from(&err);
        assert_eq!(row.kind, "empty_selection");
        assert_eq!(row.target, "-");
        assert_eq!(row.cluster, "prod");
    }
}
