use clap::Args;

use super::rig::require_rig;
use super::{GlobalArgs, OutputFormat, print_json, short};
use crate::types::{EscalationFilter, NewEscalation, Severity};

#[derive(Debug, Args)]
pub struct EscalateArgs {
    /// Rig id or name the problem comes from
    pub rig: String,
    pub message: String,
    /// low, medium, high or critical
    #[arg(long, default_value = "medium")]
    pub severity: Severity,
    #[arg(long, default_value = "general")]
    pub category: String,
    /// Agent raising the escalation
    #[arg(long)]
    pub agent: Option<String>,
}

impl EscalateArgs {
    pub fn execute(&self, global: &GlobalArgs) -> anyhow::Result<()> {
        let mut town = global.open_town()?;
        let rig = require_rig(&town, &self.rig)?;
        let escalation = town.route_escalation(&NewEscalation {
            source_rig_id: rig.id,
            source_agent_id: self.agent.clone(),
            severity: self.severity,
            category: self.category.clone(),
            message: self.message.clone(),
        })?;
        town.drain_background();
        match global.format() {
            OutputFormat::Json => print_json(&escalation)?,
            OutputFormat::Text => println!("{}", escalation.id),
            OutputFormat::Pretty => {
                println!("Escalation {} [{}]", escalation.id, escalation.severity);
                if escalation.severity.notifies_mayor() {
                    println!("The mayor has been notified.");
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Args)]
pub struct EscalationsArgs {
    /// Include acknowledged escalations
    #[arg(long)]
    pub all: bool,
    /// Only this severity and above
    #[arg(long)]
    pub min_severity: Option<Severity>,
    /// Acknowledge an escalation by id instead of listing
    #[arg(long)]
    pub ack: Option<String>,
}

impl EscalationsArgs {
    pub fn execute(&self, global: &GlobalArgs) -> anyhow::Result<()> {
        let mut town = global.open_town()?;
        let format = global.format();
        if let Some(id) = &self.ack {
            let escalation = town.acknowledge_escalation(id)?;
            match format {
                OutputFormat::Json => print_json(&escalation)?,
                OutputFormat::Text | OutputFormat::Pretty => {
                    println!("Acknowledged {}", escalation.id);
                }
            }
            return Ok(());
        }

        let escalations = town.list_escalations(EscalationFilter {
            acknowledged: if self.all { None } else { Some(false) },
            min_severity: self.min_severity,
        })?;
        match format {
            OutputFormat::Json => print_json(&escalations)?,
            OutputFormat::Text => {
                for e in &escalations {
                    println!("{}\t{}\t{}\t{}\t{}", e.id, e.severity, e.category, e.re_escalation_count, e.message);
                }
            }
            OutputFormat::Pretty => {
                if escalations.is_empty() {
                    println!("No escalations.");
                }
                for e in &escalations {
                    let ack = if e.acknowledged { "acked" } else { "open" };
                    println!(
                        "  {}  {:<8} {:<5} x{} {}: {}",
                        short(&e.id),
                        e.severity,
                        ack,
                        e.re_escalation_count,
                        e.category,
                        e.message
                    );
                }
            }
        }
        Ok(())
    }
}
