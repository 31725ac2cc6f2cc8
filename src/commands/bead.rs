use clap::Subcommand;

use super::rig::require_rig;
use super::{GlobalArgs, OutputFormat, print_json, short};
use crate::types::{Bead, BeadFilter, BeadStatus, NewBead, Priority};

#[derive(Debug, Subcommand)]
pub enum BeadCommand {
    /// Create a task bead
    Create {
        title: String,
        #[arg(long)]
        body: Option<String>,
        /// Rig id or name
        #[arg(long)]
        rig: Option<String>,
        /// low, medium, high or critical
        #[arg(long, default_value = "medium")]
        priority: Priority,
        #[arg(long = "label")]
        labels: Vec<String>,
    },
    /// List beads, highest priority first
    List {
        /// open, in_progress, closed or failed
        #[arg(long)]
        status: Option<BeadStatus>,
        /// Rig id or name
        #[arg(long)]
        rig: Option<String>,
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Close a bead; convoys holding it advance
    Close { id: String },
}

impl BeadCommand {
    pub fn execute(&self, global: &GlobalArgs) -> anyhow::Result<()> {
        let mut town = global.open_town()?;
        let format = global.format();
        match self {
            Self::Create {
                title,
                body,
                rig,
                priority,
                labels,
            } => {
                let mut new = NewBead::task(title.as_str());
                new.body.clone_from(body);
                if let Some(rig) = rig {
                    new.rig_id = Some(require_rig(&town, rig)?.id);
                }
                new.priority = *priority;
                new.labels.clone_from(labels);
                new.created_by = Some(town.owner_user_id().to_string());
                let bead = town.create_bead(&new)?;
                print_one(format, &bead)?;
            }
            Self::List { status, rig, limit } => {
                let rig_id = match rig {
                    Some(rig) => Some(require_rig(&town, rig)?.id),
                    None => None,
                };
                let beads = town.list_beads(&BeadFilter {
                    status: *status,
                    rig_id,
                    limit: *limit,
                    ..BeadFilter::default()
                })?;
                match format {
                    OutputFormat::Json => print_json(&beads)?,
                    OutputFormat::Text => {
                        for bead in &beads {
                            println!("{}\t{}\t{}\t{}", bead.id, bead.status, bead.priority, bead.title);
                        }
                    }
                    OutputFormat::Pretty => {
                        if beads.is_empty() {
                            println!("No beads.");
                        }
                        for bead in &beads {
                            println!(
                                "  {}  {:<11} {:<8} {}",
                                short(&bead.id),
                                bead.status,
                                bead.priority,
                                bead.title
                            );
                        }
                    }
                }
            }
            Self::Close { id } => {
                let bead = town.update_bead_status(id, BeadStatus::Closed, None)?;
                print_one(format, &bead)?;
            }
        }
        Ok(())
    }
}

fn print_one(format: OutputFormat, bead: &Bead) -> anyhow::Result<()> {
    match format {
        OutputFormat::Json => print_json(bead)?,
        OutputFormat::Text => println!("{}", bead.id),
        OutputFormat::Pretty => println!("Bead {} [{}] {}", bead.id, bead.status, bead.title),
    }
    Ok(())
}
