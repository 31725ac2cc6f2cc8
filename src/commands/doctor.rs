use clap::Args;
use serde::Serialize;

use super::{GlobalArgs, OutputFormat, live_seams, print_json};
use crate::config::SETTINGS_TOML;
use crate::error::TownError;
use crate::town;

#[derive(Debug, Args)]
pub struct DoctorArgs {
    /// Skip the container runtime health check
    #[arg(long)]
    pub offline: bool,
}

#[derive(Debug, Serialize)]
pub struct DoctorReport {
    pub data_dir: String,
    pub settings_file: bool,
    pub runtime_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub runtime_healthy: Option<bool>,
    pub token_secret: bool,
    pub towns: Vec<String>,
    pub issues: Vec<String>,
}

impl DoctorArgs {
    pub fn execute(&self, global: &GlobalArgs) -> anyhow::Result<()> {
        let (data_dir, settings) = global.settings()?;
        let mut report = DoctorReport {
            data_dir: data_dir.display().to_string(),
            settings_file: data_dir.join(SETTINGS_TOML).is_file(),
            runtime_url: settings.runtime.url.clone(),
            runtime_healthy: None,
            token_secret: settings.auth.secret().is_ok(),
            towns: town::list_town_ids(&data_dir)?,
            issues: Vec::new(),
        };

        if !report.settings_file {
            report
                .issues
                .push(format!("{SETTINGS_TOML} not found, using defaults"));
        }
        if !report.token_secret {
            report
                .issues
                .push("no token secret: agents cannot be started".to_string());
        }
        if report.towns.is_empty() {
            report.issues.push("no towns initialized".to_string());
        }
        if !self.offline {
            let (runtime, _) = live_seams(&settings);
            let healthy = runtime.health();
            report.runtime_healthy = Some(healthy);
            if !healthy {
                report
                    .issues
                    .push(format!("container runtime at {} is not healthy", settings.runtime.url));
            }
        }

        match global.format() {
            OutputFormat::Json => print_json(&report)?,
            OutputFormat::Text => {
                for issue in &report.issues {
                    println!("{issue}");
                }
            }
            OutputFormat::Pretty => print_pretty(&report),
        }

        if report.issues.is_empty() {
            Ok(())
        } else {
            Err(TownError::Config(format!("{} issue(s) found", report.issues.len())).into())
        }
    }
}

fn print_pretty(report: &DoctorReport) {
    let mark = |ok: bool| if ok { "✓" } else { "✗" };
    println!("=== Town Doctor ===\n");
    println!("Data dir: {}", report.data_dir);
    println!("  {} {SETTINGS_TOML}", mark(report.settings_file));
    println!("  {} token secret", mark(report.token_secret));
    match report.runtime_healthy {
        Some(ok) => println!("  {} runtime {}", mark(ok), report.runtime_url),
        None => println!("  - runtime {} (not checked)", report.runtime_url),
    }
    println!("  {} {} town(s)", mark(!report.towns.is_empty()), report.towns.len());
    if !report.issues.is_empty() {
        println!("\nIssues:");
        for issue in &report.issues {
            println!("  - {issue}");
        }
    }
}
