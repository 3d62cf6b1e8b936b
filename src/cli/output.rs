//! Output formatting shared by CLI commands.

use anyhow::{Context, Result};
use clap::ValueEnum;
use serde::Serialize;

use crate::reconcile::{ApplyReport, Plan};
use crate::secrets::PathStatus;
use crate::state::Outputs;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Json,
    Yaml,
}

pub fn print_output<T: Serialize>(data: &T, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => print_json(data),
        OutputFormat::Yaml => print_yaml(data),
    }
}

pub fn print_json<T: Serialize>(data: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(data).context("Failed to serialize to JSON")?;
    println!("{}", json);
    Ok(())
}

pub fn print_yaml<T: Serialize>(data: &T) -> Result<()> {
    let yaml = serde_yaml::to_string(data).context("Failed to serialize to YAML")?;
    println!("{}", yaml);
    Ok(())
}

pub fn print_plan(plan: &Plan) {
    print!("{}", plan);
}

pub fn print_apply_report(report: &ApplyReport) {
    if report.changes.is_empty() {
        println!("No changes. Infrastructure matches the declared configuration.");
    } else {
        for change in &report.changes {
            println!("  {} ({}): {}", change.address, change.action.as_str(), change.detail);
        }
        println!("Apply complete: {} change(s), state serial {}.", report.changes.len(), report.serial);
    }
    print_outputs(&report.outputs);
}

pub fn print_outputs(outputs: &Outputs) {
    println!();
    println!("Outputs:");
    println!("  bucket_id = {}", outputs.bucket_id);
    println!("  key_id    = {}", outputs.key_id);
    println!("  role_arn  = {}", outputs.role_arn);
}

pub fn print_sync_status(statuses: &[PathStatus]) {
    print_table_header(&[("PATH", 48), ("CONDITION", 10), ("FAILURES", 8), ("LAST SYNCED", 25)]);
    for status in statuses {
        let synced = status.last_synced_at.map(|t| t.to_rfc3339()).unwrap_or_else(|| "-".to_string());
        println!(
            "{:<48} {:<10} {:<8} {:<25}",
            truncate(&status.path, 48),
            format!("{:?}", status.condition),
            status.consecutive_failures,
            synced
        );
        if let Some(error) = &status.last_error {
            println!("    last error: {}", error);
        }
    }
}

/// Truncate string to maximum length with ellipsis
pub fn truncate(s: &str, max_len: usize) -> String {
    if s.len() <= max_len {
        s.to_string()
    } else {
        format!("{}...", &s[..max_len.saturating_sub(3)])
    }
}

fn print_table_header(columns: &[(&str, usize)]) {
    let header: Vec<String> = columns.iter().map(|(name, width)| format!("{:<width$}", name, width = width)).collect();
    println!("{}", header.join(" "));
    let total: usize = columns.iter().map(|(_, w)| w + 1).sum();
    println!("{}", "-".repeat(total.saturating_sub(1)));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("secret/data/platform/payments/db", 12), "secret/da...");
    }
}
