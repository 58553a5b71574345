//! Commands that query a running agent

use anyhow::Result;
use colored::Colorize;
use tabled::Tabled;

use crate::client::ApiClient;
use crate::output::{
    color_state, format_duration, format_minute, format_ports, print_json, print_rows,
    print_warning, OutputFormat,
};

/// Row for the offenders table
#[derive(Tabled)]
struct OffenderRow {
    #[tabled(rename = "Address")]
    address: String,
    #[tabled(rename = "Direction")]
    direction: String,
    #[tabled(rename = "Violations")]
    violations: u32,
    #[tabled(rename = "Ports")]
    ports: String,
    #[tabled(rename = "State")]
    state: String,
    #[tabled(rename = "Banned Since")]
    since: String,
}

/// List tracked offenders
pub async fn show_offenders(client: &ApiClient, banned_only: bool, format: OutputFormat) -> Result<()> {
    let mut offenders = client.offenders().await?;
    if banned_only {
        offenders.retain(|o| o.is_banned());
    }
    // Worst first
    offenders.sort_by(|a, b| b.violations.cmp(&a.violations).then(a.key.cmp(&b.key)));

    let rows: Vec<OffenderRow> = offenders
        .iter()
        .map(|o| OffenderRow {
            address: o.key.addr.to_string(),
            direction: o.key.direction.to_string(),
            violations: o.violations,
            ports: format_ports(&o.port_mappings),
            state: color_state(if o.is_banned() { "banned" } else { "tracked" }),
            since: o.banned_since().map(format_minute).unwrap_or_else(|| "-".to_string()),
        })
        .collect();

    print_rows(rows, &offenders, format)
}

#[derive(Tabled)]
struct BanRow {
    #[tabled(rename = "Address")]
    address: String,
    #[tabled(rename = "Direction")]
    direction: String,
    #[tabled(rename = "Banned Since")]
    since: String,
}

/// List active bans
pub async fn show_bans(client: &ApiClient, format: OutputFormat) -> Result<()> {
    let bans = client.bans().await?;

    let rows: Vec<BanRow> = bans
        .iter()
        .map(|b| BanRow {
            address: b.key.addr.to_string().red().to_string(),
            direction: b.key.direction.to_string(),
            since: format_minute(b.since_minute),
        })
        .collect();

    print_rows(rows, &bans, format)?;
    if format == OutputFormat::Table && !bans.is_empty() {
        println!("\nTotal: {} active bans", bans.len());
    }
    Ok(())
}

/// Show agent status
pub async fn show_status(client: &ApiClient, format: OutputFormat) -> Result<()> {
    let status = client.status().await?;

    match format {
        OutputFormat::Json => print_json(&status)?,
        OutputFormat::Table => {
            println!("{}", "Agent Status".bold());
            println!("{}", "=".repeat(50));
            println!("Host:                   {}", status.host.cyan());
            println!("Version:                {}", status.agent_version);
            println!("Uptime:                 {}", format_duration(status.uptime_secs));
            println!("Firewall Backend:       {}", status.backend);
            match &status.model_version {
                Some(version) => println!("Model Version:          {}", version),
                None => println!("Model Version:          {}", "none".red()),
            }
            println!();
            println!("{}", "Offenders".bold());
            println!("{}", "-".repeat(50));
            println!("Tracked:                {}", status.tracked);
            println!("Banned:                 {}", status.banned.to_string().red());
            println!(
                "Policy:                 ban above {} violations for {} min",
                status.naughty_count, status.ban_duration_minutes
            );

            if status.enforcement_pending > 0 {
                println!();
                print_warning(&format!(
                    "{} firewall changes pending retry",
                    status.enforcement_pending
                ));
            }
        }
    }

    Ok(())
}
