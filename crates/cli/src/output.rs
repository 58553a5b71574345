//! Output formatting utilities

use chrono::{DateTime, Utc};
use clap::ValueEnum;
use colored::Colorize;
use guard_lib::{PortMapping, Verdict};
use serde::Serialize;
use std::collections::BTreeSet;
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

/// Print rows as a table, or the raw items as JSON
pub fn print_rows<R: Tabled, T: Serialize>(rows: Vec<R>, items: &T, format: OutputFormat) -> anyhow::Result<()> {
    match format {
        OutputFormat::Table => {
            if rows.is_empty() {
                println!("{}", "No items found".yellow());
                return Ok(());
            }
            let table = Table::new(rows).with(Style::rounded()).to_string();
            println!("{}", table);
        }
        OutputFormat::Json => print_json(items)?,
    }
    Ok(())
}

pub fn print_json<T: Serialize + ?Sized>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Print a success message
pub fn print_success(message: &str) {
    println!("{} {}", "✓".green().bold(), message);
}

/// Print a warning message
pub fn print_warning(message: &str) {
    println!("{} {}", "⚠".yellow().bold(), message);
}

/// Print an info message
pub fn print_info(message: &str) {
    println!("{} {}", "ℹ".blue().bold(), message);
}

/// Render a minute-resolution epoch as a UTC timestamp
pub fn format_minute(minute: i64) -> String {
    DateTime::<Utc>::from_timestamp(minute.saturating_mul(60), 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M UTC").to_string())
        .unwrap_or_else(|| minute.to_string())
}

/// "tcp/80, udp/53"
pub fn format_ports(mappings: &BTreeSet<PortMapping>) -> String {
    if mappings.is_empty() {
        return "-".to_string();
    }
    mappings
        .iter()
        .map(|m| format!("{}/{}", m.protocol, m.port))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Format a seconds count as "1d 2h 3m"
pub fn format_duration(secs: i64) -> String {
    let secs = secs.max(0);
    let (days, hours, minutes) = (secs / 86_400, (secs % 86_400) / 3_600, (secs % 3_600) / 60);
    if days > 0 {
        format!("{}d {}h {}m", days, hours, minutes)
    } else if hours > 0 {
        format!("{}h {}m", hours, minutes)
    } else {
        format!("{}m {}s", minutes, secs % 60)
    }
}

/// Format a ratio as percentage
pub fn format_percent(ratio: f64) -> String {
    format!("{:.1}%", ratio * 100.0)
}

/// Color a ban state or verdict
pub fn color_state(state: &str) -> String {
    match state.to_lowercase().as_str() {
        "banned" | "attack" => state.red().to_string(),
        "tracked" => state.yellow().to_string(),
        "benign" => state.green().to_string(),
        _ => state.to_string(),
    }
}

pub fn color_verdict(verdict: Verdict) -> String {
    color_state(&verdict.to_string())
}

/// Color accuracy based on value
pub fn color_accuracy(accuracy: f64) -> String {
    let formatted = format_percent(accuracy);
    if accuracy >= 0.95 {
        formatted.green().to_string()
    } else if accuracy >= 0.8 {
        formatted.yellow().to_string()
    } else {
        formatted.red().to_string()
    }
}
