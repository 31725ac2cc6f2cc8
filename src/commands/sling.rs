use clap::Args;

use super::rig::require_rig;
use super::{GlobalArgs, OutputFormat, print_json};

#[derive(Debug, Args)]
pub struct SlingArgs {
    /// Rig id or name
    pub rig: String,
    /// Task title
    pub title: String,
    #[arg(long)]
    pub body: Option<String>,
}

impl SlingArgs {
    pub fn execute(&self, global: &GlobalArgs) -> anyhow::Result<()> {
        let mut town = global.open_town()?;
        let rig = require_rig(&town, &self.rig)?;
        let slung = town.sling(&rig.id, &self.title, self.body.as_deref())?;
        match global.format() {
            OutputFormat::Json => print_json(&slung)?,
            OutputFormat::Text => println!("{}\t{}", slung.bead.id, slung.agent.identity),
            OutputFormat::Pretty => {
                println!("Slung \"{}\" onto {}", slung.bead.title, rig.name);
                println!("  bead:  {}", slung.bead.id);
                println!("  agent: {}", slung.agent.identity);
                println!("It starts on the next tick.");
            }
        }
        Ok(())
    }
}
