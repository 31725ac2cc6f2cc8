use clap::Subcommand;

use super::{GlobalArgs, OutputFormat, print_json, short};
use crate::config::RigConfig;
use crate::error::TownError;
use crate::town::Town;
use crate::types::Rig;

#[derive(Debug, Subcommand)]
pub enum RigCommand {
    /// Register a git repository
    Add {
        name: String,
        git_url: String,
        #[arg(long, default_value = "main")]
        default_branch: String,
    },
    /// List registered rigs
    List,
    /// Remove a rig by id or name
    Remove { rig: String },
    /// Set credentials, model and env for a rig
    Configure {
        rig: String,
        #[arg(long)]
        git_token: Option<String>,
        #[arg(long)]
        git_username: Option<String>,
        #[arg(long)]
        model: Option<String>,
        /// KEY=VALUE, repeatable
        #[arg(long = "env", value_parser = parse_env)]
        env: Vec<(String, String)>,
    },
}

fn parse_env(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got {raw:?}")),
    }
}

pub(super) fn require_rig(town: &Town, id_or_name: &str) -> anyhow::Result<Rig> {
    Ok(town
        .find_rig(id_or_name)?
        .ok_or_else(|| TownError::not_found("rig", id_or_name))?)
}

impl RigCommand {
    pub fn execute(&self, global: &GlobalArgs) -> anyhow::Result<()> {
        let town = global.open_town()?;
        let format = global.format();
        match self {
            Self::Add {
                name,
                git_url,
                default_branch,
            } => {
                let rig = town.add_rig(name, git_url, default_branch)?;
                match format {
                    OutputFormat::Json => print_json(&rig)?,
                    OutputFormat::Text => println!("{}", rig.id),
                    OutputFormat::Pretty => println!("Rig {} added ({})", rig.name, rig.id),
                }
            }
            Self::List => {
                let rigs = town.list_rigs()?;
                match format {
                    OutputFormat::Json => print_json(&rigs)?,
                    OutputFormat::Text => {
                        for rig in &rigs {
                            println!("{}\t{}\t{}\t{}", rig.id, rig.name, rig.git_url, rig.default_branch);
                        }
                    }
                    OutputFormat::Pretty => {
                        if rigs.is_empty() {
                            println!("No rigs.");
                        }
                        for rig in &rigs {
                            println!(
                                "  {}  {:<16} {} ({})",
                                short(&rig.id),
                                rig.name,
                                rig.git_url,
                                rig.default_branch
                            );
                        }
                    }
                }
            }
            Self::Remove { rig } => {
                let rig = require_rig(&town, rig)?;
                town.remove_rig(&rig.id)?;
                if format != OutputFormat::Json {
                    println!("Removed rig {}", rig.name);
                }
            }
            Self::Configure {
                rig,
                git_token,
                git_username,
                model,
                env,
            } => {
                let rig = require_rig(&town, rig)?;
                let mut config = town.rig_config(&rig.id)?.unwrap_or_default();
                if git_token.is_some() {
                    config.git_token.clone_from(git_token);
                }
                if git_username.is_some() {
                    config.git_username.clone_from(git_username);
                }
                if model.is_some() {
                    config.model.clone_from(model);
                }
                config.env_vars.extend(env.iter().cloned());
                town.configure_rig(&rig.id, &config)?;
                print_config(format, &rig, &config)?;
            }
        }
        Ok(())
    }
}

/// Shows which settings are present without echoing secrets.
fn print_config(format: OutputFormat, rig: &Rig, config: &RigConfig) -> anyhow::Result<()> {
    let keys: Vec<&str> = config.env_vars.keys().map(String::as_str).collect();
    match format {
        OutputFormat::Json => print_json(&serde_json::json!({
            "rig_id": rig.id,
            "git_token": config.git_token.is_some(),
            "git_username": config.git_username,
            "model": config.model,
            "env_keys": keys,
        }))?,
        OutputFormat::Text | OutputFormat::Pretty => {
            println!("Rig {} configured", rig.name);
            println!(
                "  git token: {}",
                if config.git_token.is_some() { "set" } else { "unset" }
            );
            if let Some(model) = &config.model {
                println!("  model:     {model}");
            }
            if !keys.is_empty() {
                println!("  env:       {}", keys.join(", "));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_pairs_parse() {
        assert_eq!(
            parse_env("A=b=c").unwrap(),
            ("A".to_string(), "b=c".to_string())
        );
        assert!(parse_env("=x").is_err());
        assert!(parse_env("novalue").is_err());
    }
}
