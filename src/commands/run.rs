use std::sync::mpsc;

use anyhow::Context;
use clap::Args;
use tracing::info;

use super::{GlobalArgs, live_seams};
use crate::host::TownHost;
use crate::town::Town;

#[derive(Debug, Args)]
pub struct RunArgs {}

impl RunArgs {
    /// Hosts every town in the data directory until interrupted.
    pub fn execute(&self, global: &GlobalArgs) -> anyhow::Result<()> {
        let (dir, settings) = global.settings()?;
        let (runtime, clock) = live_seams(&settings);
        let host = match &global.town {
            Some(id) => {
                let mut host = TownHost::new();
                host.spawn(Town::open(&dir, id, settings, runtime, clock)?)?;
                host
            }
            None => TownHost::load_all(&dir, &settings, &runtime, &clock)?,
        };
        let towns = host.town_ids();
        if towns.is_empty() {
            anyhow::bail!("no towns in {}; run `town init` first", dir.display());
        }
        info!(count = towns.len(), data_dir = %dir.display(), "hosting towns");

        let (stop, stopped) = mpsc::channel();
        ctrlc::set_handler(move || {
            let _ = stop.send(());
        })
        .context("installing ctrl-c handler")?;
        let _ = stopped.recv();

        info!("shutting down");
        host.shutdown_all();
        Ok(())
    }
}
