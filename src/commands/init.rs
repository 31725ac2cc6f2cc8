use std::fs;

use anyhow::Context;
use clap::Args;
use serde::Serialize;

use super::{GlobalArgs, OutputFormat, live_seams, print_json};
use crate::config::{SETTINGS_TOML, Settings};
use crate::town::Town;

#[derive(Debug, Args)]
pub struct InitArgs {
    /// User id that owns the new town
    #[arg(long)]
    pub owner: String,
    /// Default model tier or model id for the town's agents
    #[arg(long)]
    pub model: Option<String>,
    /// Quality gates the refinery runs before merging (repeatable)
    #[arg(long = "gate")]
    pub gates: Vec<String>,
}

#[derive(Debug, Serialize)]
struct InitReport {
    town_id: String,
    owner_user_id: String,
    data_dir: String,
    wrote_settings: bool,
}

impl InitArgs {
    pub fn execute(&self, global: &GlobalArgs) -> anyhow::Result<()> {
        let data_dir = global.data_dir()?;
        fs::create_dir_all(&data_dir)
            .with_context(|| format!("creating {}", data_dir.display()))?;

        let settings_path = data_dir.join(SETTINGS_TOML);
        let wrote_settings = !settings_path.exists();
        if wrote_settings {
            fs::write(&settings_path, Settings::default().to_toml()?)
                .with_context(|| format!("writing {}", settings_path.display()))?;
        }
        let settings = Settings::load(&settings_path)?;

        let (runtime, clock) = live_seams(&settings);
        let town = Town::create(&data_dir, &self.owner, settings, runtime, clock)?;
        let mut config = town.town_config()?;
        if let Some(model) = &self.model {
            config.default_model.clone_from(model);
        }
        config.quality_gates.clone_from(&self.gates);
        town.set_town_config(&config)?;

        let report = InitReport {
            town_id: town.id().to_string(),
            owner_user_id: town.owner_user_id().to_string(),
            data_dir: data_dir.display().to_string(),
            wrote_settings,
        };
        match global.format() {
            OutputFormat::Json => print_json(&report)?,
            OutputFormat::Text => println!("{}", report.town_id),
            OutputFormat::Pretty => {
                println!("Town created: {}", report.town_id);
                println!("  owner:    {}", report.owner_user_id);
                println!("  data dir: {}", report.data_dir);
                if wrote_settings {
                    println!("  wrote {SETTINGS_TOML} with defaults");
                }
                if self.gates.is_empty() {
                    println!("  no quality gates: reviews merge directly");
                }
            }
        }
        Ok(())
    }
}
