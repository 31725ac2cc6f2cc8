pub mod bead;
pub mod doctor;
pub mod escalation;
pub mod init;
pub mod rig;
pub mod run;
pub mod schema;
pub mod sling;
pub mod status;
pub mod tick;

use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::Args;
use serde::Serialize;

use crate::clock::{Clock, SystemClock};
use crate::config::{self, Settings};
use crate::dispatch::{ContainerRuntime, HttpRuntime};
use crate::town::{self, Town};

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    Pretty,
    Text,
    Json,
}

impl OutputFormat {
    /// Pretty on a terminal, text when piped.
    pub fn resolve(explicit: Option<Self>) -> Self {
        explicit.unwrap_or_else(|| {
            if std::io::stdout().is_terminal() {
                Self::Pretty
            } else {
                Self::Text
            }
        })
    }
}

/// Options every command accepts.
#[derive(Debug, Clone, Args)]
pub struct GlobalArgs {
    /// Data directory (default: $TOWN_DATA_DIR, then the platform data dir)
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,
    /// Town id; may be omitted when the data directory holds a single town
    #[arg(long, global = true)]
    pub town: Option<String>,
    /// Output format
    #[arg(long, value_enum, global = true)]
    pub format: Option<OutputFormat>,
}

impl GlobalArgs {
    pub fn data_dir(&self) -> anyhow::Result<PathBuf> {
        config::resolve_data_dir(self.data_dir.as_deref())
    }

    pub fn format(&self) -> OutputFormat {
        OutputFormat::resolve(self.format)
    }

    pub fn settings(&self) -> anyhow::Result<(PathBuf, Settings)> {
        let dir = self.data_dir()?;
        let settings = Settings::load_from_dir(&dir)?;
        Ok((dir, settings))
    }

    /// Opens the selected town against the real runtime and clock.
    pub fn open_town(&self) -> anyhow::Result<Town> {
        let (dir, settings) = self.settings()?;
        let town_id = select_town(&dir, self.town.as_deref())?;
        let (runtime, clock) = live_seams(&settings);
        let town = Town::open(&dir, &town_id, settings, runtime, clock)
            .with_context(|| format!("opening town {town_id}"))?;
        Ok(town)
    }
}

pub fn live_seams(settings: &Settings) -> (Arc<dyn ContainerRuntime>, Arc<dyn Clock>) {
    (
        Arc::new(HttpRuntime::new(&settings.runtime)),
        Arc::new(SystemClock),
    )
}

fn select_town(data_dir: &Path, explicit: Option<&str>) -> anyhow::Result<String> {
    if let Some(id) = explicit {
        return Ok(id.to_string());
    }
    let ids = town::list_town_ids(data_dir)?;
    match ids.as_slice() {
        [] => anyhow::bail!(
            "no towns in {}; run `town init` first",
            data_dir.display()
        ),
        [only] => Ok(only.clone()),
        _ => anyhow::bail!(
            "{} towns in {}; pick one with --town ({})",
            ids.len(),
            data_dir.display(),
            ids.join(", ")
        ),
    }
}

pub fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Shortens ids for tables.
pub fn short(id: &str) -> &str {
    id.get(..8).unwrap_or(id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn select_requires_choice_when_ambiguous() {
        let dir = tempfile::tempdir().unwrap();
        assert!(select_town(dir.path(), None).is_err());
        assert_eq!(select_town(dir.path(), Some("t1")).unwrap(), "t1");

        for id in ["a", "b"] {
            let town = town::towns_dir(dir.path()).join(id);
            std::fs::create_dir_all(&town).unwrap();
            std::fs::write(town.join("town.db"), b"").unwrap();
        }
        let err = select_town(dir.path(), None).unwrap_err().to_string();
        assert!(err.contains("--town"));
    }

    #[test]
    fn short_ids() {
        assert_eq!(short("0123456789"), "01234567");
        assert_eq!(short("abc"), "abc");
    }
}
