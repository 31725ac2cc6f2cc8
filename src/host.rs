//! Runs many towns side by side.
//!
//! Each town lives on its own thread and owns its [`Town`] value outright.
//! Inbound operations arrive as closures over a channel and run between
//! ticks; the thread ticks whenever the town's alarm comes due. Two calls to
//! the same town, or a call and a tick, never overlap.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::config::Settings;
use crate::dispatch::ContainerRuntime;
use crate::error::{Result, TownError};
use crate::town::{self, Town};

type Call = Box<dyn FnOnce(&mut Town) + Send>;

enum Message {
    Call(Call),
    Shutdown,
}

struct Handle {
    inbox: Sender<Message>,
    thread: JoinHandle<()>,
}

#[derive(Default)]
pub struct TownHost {
    towns: BTreeMap<String, Handle>,
}

impl TownHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens every town under `data_dir` and starts its thread.
    pub fn load_all(
        data_dir: &Path,
        settings: &Settings,
        runtime: &Arc<dyn ContainerRuntime>,
        clock: &Arc<dyn Clock>,
    ) -> Result<Self> {
        let mut host = Self::new();
        for id in town::list_town_ids(data_dir)? {
            let town = Town::open(
                data_dir,
                &id,
                settings.clone(),
                Arc::clone(runtime),
                Arc::clone(clock),
            )?;
            host.spawn(town)?;
        }
        Ok(host)
    }

    pub fn spawn(&mut self, town: Town) -> Result<()> {
        let id = town.id().to_string();
        if self.towns.contains_key(&id) {
            return Err(TownError::Conflict(format!("town {id} is already running")));
        }
        let (inbox, rx) = mpsc::channel();
        let thread = thread::Builder::new()
            .name(format!("town-{}", id.chars().take(8).collect::<String>()))
            .spawn(move || run_town(town, &rx))?;
        info!(town_id = %id, "town started");
        self.towns.insert(id, Handle { inbox, thread });
        Ok(())
    }

    pub fn town_ids(&self) -> Vec<String> {
        self.towns.keys().cloned().collect()
    }

    /// Runs `op` on the town's own thread and waits for its result.
    pub fn call<R, F>(&self, town_id: &str, op: F) -> Result<R>
    where
        F: FnOnce(&mut Town) -> R + Send + 'static,
        R: Send + 'static,
    {
        let handle = self
            .towns
            .get(town_id)
            .ok_or_else(|| TownError::not_found("town", town_id))?;
        let (reply, answer) = mpsc::channel();
        let call: Call = Box::new(move |town| {
            // the caller may have given up waiting
            let _ = reply.send(op(town));
        });
        let stopped = || TownError::Conflict(format!("town {town_id} is not running"));
        handle
            .inbox
            .send(Message::Call(call))
            .map_err(|_| stopped())?;
        answer.recv().map_err(|_| stopped())
    }

    /// Stops every town after its current call or tick and waits for them.
    pub fn shutdown_all(self) {
        for (id, handle) in self.towns {
            let _ = handle.inbox.send(Message::Shutdown);
            if handle.thread.join().is_err() {
                warn!(town_id = %id, "town thread panicked");
            } else {
                debug!(town_id = %id, "town stopped");
            }
        }
    }
}

/// How long the town may sleep before its alarm is due.
fn until_due(town: &Town) -> Duration {
    match town.next_wake_at() {
        Ok(Some(at)) => (at - town.now()).to_std().unwrap_or(Duration::ZERO),
        Ok(None) => Duration::ZERO,
        Err(e) => {
            warn!(town_id = %town.id(), error = %e, "could not read alarm");
            idle_wait(town)
        }
    }
}

fn idle_wait(town: &Town) -> Duration {
    town.settings()
        .scheduler
        .idle_interval()
        .to_std()
        .unwrap_or(Duration::from_secs(60))
}

fn run_town(mut town: Town, inbox: &Receiver<Message>) {
    loop {
        let mut wait = until_due(&town);
        if wait.is_zero() {
            if let Err(e) = town.tick() {
                warn!(town_id = %town.id(), error = %e, "tick failed");
                wait = idle_wait(&town);
            } else {
                wait = until_due(&town);
            }
        }
        match inbox.recv_timeout(wait) {
            Ok(Message::Call(call)) => call(&mut town),
            Ok(Message::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {}
        }
    }
    town.drain_background();
    info!(town_id = %town.id(), "town stopped");
}
