use clap::Args;
use serde::Serialize;

use super::{GlobalArgs, OutputFormat, print_json, short};
use crate::town::TownSummary;
use crate::types::{Agent, AgentFilter};

#[derive(Debug, Args)]
pub struct StatusArgs {
    /// Also list every agent
    #[arg(long)]
    pub agents: bool,
}

#[derive(Debug, Serialize)]
struct StatusReport {
    #[serde(flatten)]
    summary: TownSummary,
    #[serde(skip_serializing_if = "Option::is_none")]
    agents: Option<Vec<Agent>>,
}

impl StatusArgs {
    pub fn execute(&self, global: &GlobalArgs) -> anyhow::Result<()> {
        let town = global.open_town()?;
        let report = StatusReport {
            summary: town.summary()?,
            agents: if self.agents {
                Some(town.list_agents(&AgentFilter::default())?)
            } else {
                None
            },
        };

        match global.format() {
            OutputFormat::Json => print_json(&report)?,
            OutputFormat::Text => {
                let s = &report.summary;
                println!(
                    "town={} rigs={} agents={} working={} open={} in_progress={} reviews={} escalations={}",
                    s.town_id,
                    s.rigs,
                    s.agents,
                    s.working_agents,
                    s.open_beads,
                    s.in_progress_beads,
                    s.pending_reviews,
                    s.open_escalations
                );
                for agent in report.agents.iter().flatten() {
                    println!("{}\t{}\t{}", agent.identity, agent.role, agent.status);
                }
            }
            OutputFormat::Pretty => print_pretty(&report),
        }
        Ok(())
    }
}

fn print_pretty(report: &StatusReport) {
    let s = &report.summary;
    println!("=== Town {} ===\n", s.town_id);
    println!("Owner:       {}", s.owner_user_id);
    println!("Rigs:        {}", s.rigs);
    println!("Agents:      {} ({} working)", s.agents, s.working_agents);
    println!("Beads:       {} open, {} in progress", s.open_beads, s.in_progress_beads);
    println!("Reviews:     {} pending", s.pending_reviews);
    println!("Escalations: {} unacknowledged", s.open_escalations);
    match s.next_wake_at {
        Some(at) => println!("Next wake:   {}", at.to_rfc3339()),
        None => println!("Next wake:   now"),
    }
    if let Some(agents) = &report.agents {
        println!("\nAgents:");
        for agent in agents {
            let hook = agent
                .current_hook_bead_id
                .as_deref()
                .map_or_else(|| "-".to_string(), |b| short(b).to_string());
            println!(
                "  {:<28} {:<9} {:<8} hook {}",
                agent.identity, agent.role, agent.status, hook
            );
        }
    }
}
