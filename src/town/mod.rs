//! The per-tenant town actor.
//!
//! A [`Town`] owns its store, its agents' logs and its handle to the container
//! runtime. Every inbound operation and every scheduler tick runs against
//! `&mut Town`, so they never interleave.

mod containers;
mod convoys;
mod escalations;
mod lifecycle;
mod mail;
mod review;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info};

use crate::agent_log::{AgentEvent, AgentLogs};
use crate::background::BackgroundTasks;
use crate::clock::Clock;
use crate::config::{RigConfig, Settings, TownConfig};
use crate::dispatch::ContainerRuntime;
use crate::error::{Result, TownError};
use crate::store::{TownStore, keys};
use crate::types::{
    Agent, AgentFilter, AgentRole, AgentStatus, Bead, BeadEvent, BeadFilter, BeadStatus,
    NewBead, Rig,
};

pub use containers::StartPrompt;
use escalations::MayorLine;
pub(crate) use escalations::mayor_message;
pub use lifecycle::{POLECAT_NAMES, SlingResult, identity_for};

const TOWN_DB: &str = "town.db";
const AGENTS_DIR: &str = "agents";

/// Directory that holds every town under a data dir.
pub fn towns_dir(data_dir: &Path) -> PathBuf {
    data_dir.join("towns")
}

/// Ids of towns initialized under `data_dir`, sorted.
pub fn list_town_ids(data_dir: &Path) -> Result<Vec<String>> {
    let dir = towns_dir(data_dir);
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut ids = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if entry.path().join(TOWN_DB).is_file() {
            ids.push(entry.file_name().to_string_lossy().into_owned());
        }
    }
    ids.sort();
    Ok(ids)
}

/// Counts for `town status`.
#[derive(Debug, Clone, Serialize)]
pub struct TownSummary {
    pub town_id: String,
    pub owner_user_id: String,
    pub rigs: usize,
    pub agents: usize,
    pub working_agents: usize,
    pub open_beads: usize,
    pub in_progress_beads: usize,
    pub pending_reviews: usize,
    pub open_escalations: usize,
    pub next_wake_at: Option<DateTime<Utc>>,
}

pub struct Town {
    id: String,
    owner_user_id: String,
    pub(crate) store: TownStore,
    pub(crate) logs: AgentLogs,
    pub(crate) runtime: Arc<dyn ContainerRuntime>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) settings: Settings,
    pub(crate) background: BackgroundTasks,
    mayor_line: MayorLine,
}

impl Town {
    /// Creates a new town directory under `data_dir`.
    pub fn create(
        data_dir: &Path,
        owner_user_id: &str,
        settings: Settings,
        runtime: Arc<dyn ContainerRuntime>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        if owner_user_id.trim().is_empty() {
            return Err(TownError::Invalid("town owner must not be empty".into()));
        }
        let id = uuid::Uuid::new_v4().to_string();
        let dir = towns_dir(data_dir).join(&id);
        std::fs::create_dir_all(dir.join(AGENTS_DIR))?;
        let store = TownStore::open(dir.join(TOWN_DB))?;
        store.set_kv(keys::TOWN_ID, &id)?;
        store.set_kv(keys::OWNER_USER_ID, owner_user_id)?;
        store.set_town_config(&TownConfig::default())?;
        info!(town_id = %id, owner = owner_user_id, "town created");

        let logs = AgentLogs::on_disk(dir.join(AGENTS_DIR), settings.scheduler.agent_log_max_events);
        Ok(Self::assemble(
            id,
            owner_user_id.to_string(),
            store,
            logs,
            runtime,
            clock,
            settings,
        ))
    }

    pub fn open(
        data_dir: &Path,
        town_id: &str,
        settings: Settings,
        runtime: Arc<dyn ContainerRuntime>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let dir = towns_dir(data_dir).join(town_id);
        let db = dir.join(TOWN_DB);
        if !db.is_file() {
            return Err(TownError::not_found("town", town_id));
        }
        let store = TownStore::open(db)?;
        let id = store
            .get_kv(keys::TOWN_ID)?
            .ok_or_else(|| TownError::Config(format!("town {town_id} has no identity")))?;
        let owner = store.get_kv(keys::OWNER_USER_ID)?.unwrap_or_default();
        let logs = AgentLogs::on_disk(dir.join(AGENTS_DIR), settings.scheduler.agent_log_max_events);
        Ok(Self::assemble(id, owner, store, logs, runtime, clock, settings))
    }

    /// A town that lives entirely in memory.
    pub fn in_memory(
        town_id: &str,
        owner_user_id: &str,
        settings: Settings,
        runtime: Arc<dyn ContainerRuntime>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let store = TownStore::in_memory()?;
        store.set_kv(keys::TOWN_ID, town_id)?;
        store.set_kv(keys::OWNER_USER_ID, owner_user_id)?;
        let logs = AgentLogs::in_memory(settings.scheduler.agent_log_max_events);
        Ok(Self::assemble(
            town_id.to_string(),
            owner_user_id.to_string(),
            store,
            logs,
            runtime,
            clock,
            settings,
        ))
    }

    fn assemble(
        id: String,
        owner_user_id: String,
        store: TownStore,
        logs: AgentLogs,
        runtime: Arc<dyn ContainerRuntime>,
        clock: Arc<dyn Clock>,
        settings: Settings,
    ) -> Self {
        Self {
            id,
            owner_user_id,
            store,
            logs,
            runtime,
            clock,
            settings,
            background: BackgroundTasks::new(),
            mayor_line: MayorLine::default(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn owner_user_id(&self) -> &str {
        &self.owner_user_id
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub(crate) fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Waits for detached tasks and records what they reported. Call before
    /// dropping a town for good.
    pub fn drain_background(&mut self) {
        self.background.drain();
        self.apply_mayor_starts();
    }

    // ----- alarm -----

    pub fn next_wake_at(&self) -> Result<Option<DateTime<Utc>>> {
        self.store.next_wake_at()
    }

    /// Brings the next tick forward to at most one active interval from now.
    pub(crate) fn pull_alarm(&self) -> Result<()> {
        let soon = self
            .now()
            .checked_add_signed(self.settings.scheduler.active_interval())
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        match self.store.next_wake_at()? {
            Some(at) if at <= soon => Ok(()),
            _ => {
                debug!(town_id = %self.id, next_wake_at = %soon, "alarm pulled forward");
                self.store.set_next_wake_at(soon)
            }
        }
    }

    // ----- town config & rigs -----

    pub fn town_config(&self) -> Result<TownConfig> {
        self.store.town_config()
    }

    pub fn set_town_config(&self, config: &TownConfig) -> Result<()> {
        self.store.set_town_config(config)
    }

    pub fn add_rig(&self, name: &str, git_url: &str, default_branch: &str) -> Result<Rig> {
        let rig = self.store.insert_rig(name, git_url, default_branch, self.now())?;
        info!(town_id = %self.id, rig_id = %rig.id, name, "rig added");
        Ok(rig)
    }

    pub fn get_rig(&self, id: &str) -> Result<Option<Rig>> {
        self.store.get_rig(id)
    }

    /// Looks a rig up by id, then by name.
    pub fn find_rig(&self, id_or_name: &str) -> Result<Option<Rig>> {
        match self.store.get_rig(id_or_name)? {
            Some(rig) => Ok(Some(rig)),
            None => self.store.get_rig_by_name(id_or_name),
        }
    }

    pub fn list_rigs(&self) -> Result<Vec<Rig>> {
        self.store.list_rigs()
    }

    pub fn remove_rig(&self, id: &str) -> Result<()> {
        self.store.delete_rig(id)
    }

    pub fn configure_rig(&self, rig_id: &str, config: &RigConfig) -> Result<()> {
        self.store.set_rig_config(rig_id, config)
    }

    pub fn rig_config(&self, rig_id: &str) -> Result<Option<RigConfig>> {
        self.store.rig_config(rig_id)
    }

    // ----- beads -----

    pub fn create_bead(&mut self, new: &NewBead) -> Result<Bead> {
        let now = self.now();
        let bead = self.store.create_bead(new, now)?;
        debug!(town_id = %self.id, bead_id = %bead.id, title = %bead.title, "bead created");
        Ok(bead)
    }

    pub fn get_bead(&self, id: &str) -> Result<Option<Bead>> {
        self.store.get_bead(id)
    }

    pub fn list_beads(&self, filter: &BeadFilter) -> Result<Vec<Bead>> {
        self.store.list_beads(filter)
    }

    /// Changes status; closing a bead also advances every convoy holding it.
    pub fn update_bead_status(
        &mut self,
        id: &str,
        status: BeadStatus,
        agent_id: Option<&str>,
    ) -> Result<Bead> {
        let now = self.now();
        let before = self
            .store
            .get_bead(id)?
            .ok_or_else(|| TownError::not_found("bead", id))?;
        let bead = self.store.update_bead_status(id, status, agent_id, now)?;
        if status == BeadStatus::Closed && before.status != BeadStatus::Closed {
            self.propagate_close(id)?;
        }
        Ok(bead)
    }

    pub fn delete_bead(&mut self, id: &str) -> Result<()> {
        self.store.delete_bead(id)
    }

    pub fn bead_events(&self, bead_id: &str) -> Result<Vec<BeadEvent>> {
        self.store.bead_events(bead_id)
    }

    pub fn bead_events_after(&self, after_id: i64, limit: usize) -> Result<Vec<BeadEvent>> {
        self.store.bead_events_after(after_id, limit)
    }

    // ----- agents -----

    pub fn get_agent(&self, id: &str) -> Result<Option<Agent>> {
        self.store.get_agent(id)
    }

    pub fn get_agent_by_identity(&self, identity: &str) -> Result<Option<Agent>> {
        self.store.get_agent_by_identity(identity)
    }

    pub fn list_agents(&self, filter: &AgentFilter) -> Result<Vec<Agent>> {
        self.store.list_agents(filter)
    }

    pub fn update_agent_status(&mut self, id: &str, status: AgentStatus) -> Result<Agent> {
        let agent = self.store.update_agent_status(id, status, self.now())?;
        if agent.current_hook_bead_id.is_some() {
            self.pull_alarm()?;
        }
        Ok(agent)
    }

    pub fn hook_bead(&mut self, agent_id: &str, bead_id: &str) -> Result<Agent> {
        let now = self.now();
        let agent = self.store.hook_bead(agent_id, bead_id, now)?;
        debug!(town_id = %self.id, agent_id, bead_id, "bead hooked");
        self.pull_alarm()?;
        Ok(agent)
    }

    pub fn unhook_bead(&mut self, agent_id: &str) -> Result<Option<String>> {
        let now = self.now();
        self.store.unhook_bead(agent_id, now)
    }

    pub fn get_hooked_bead(&self, agent_id: &str) -> Result<Option<Bead>> {
        self.store.get_hooked_bead(agent_id)
    }

    pub fn write_checkpoint(&self, agent_id: &str, checkpoint: &Value) -> Result<()> {
        self.store.write_checkpoint(agent_id, checkpoint)
    }

    pub fn read_checkpoint(&self, agent_id: &str) -> Result<Option<Value>> {
        self.store.read_checkpoint(agent_id)
    }

    pub fn touch_heartbeat(&self, agent_id: &str) -> Result<()> {
        self.store.touch_heartbeat(agent_id, self.now())
    }

    pub fn append_agent_event(
        &mut self,
        agent_id: &str,
        event_type: &str,
        data: &Value,
    ) -> Result<i64> {
        if self.store.get_agent(agent_id)?.is_none() {
            return Err(TownError::not_found("agent", agent_id));
        }
        let now = self.now();
        self.logs.append(agent_id, event_type, data, now)
    }

    pub fn agent_events_after(
        &mut self,
        agent_id: &str,
        after_id: i64,
        limit: usize,
    ) -> Result<Vec<AgentEvent>> {
        if self.store.get_agent(agent_id)?.is_none() {
            return Ok(Vec::new());
        }
        self.logs.events_after(agent_id, after_id, limit)
    }

    pub fn summary(&self) -> Result<TownSummary> {
        let agents = self.store.list_agents(&AgentFilter::default())?;
        let count_beads = |status| {
            self.store
                .list_beads(&BeadFilter {
                    status: Some(status),
                    ..BeadFilter::default()
                })
                .map(|b| b.len())
        };
        Ok(TownSummary {
            town_id: self.id.clone(),
            owner_user_id: self.owner_user_id.clone(),
            rigs: self.store.list_rigs()?.len(),
            agents: agents.len(),
            working_agents: agents.iter().filter(|a| a.status.is_active()).count(),
            open_beads: count_beads(BeadStatus::Open)?,
            in_progress_beads: count_beads(BeadStatus::InProgress)?,
            pending_reviews: self
                .store
                .list_reviews(Some(crate::types::ReviewStatus::Pending))?
                .len(),
            open_escalations: self
                .store
                .list_escalations(crate::types::EscalationFilter {
                    acknowledged: Some(false),
                    min_severity: None,
                })?
                .len(),
            next_wake_at: self.store.next_wake_at()?,
        })
    }

    /// Singleton roles are looked up, never duplicated.
    pub(crate) fn singleton(&self, role: AgentRole) -> Result<Option<Agent>> {
        Ok(self
            .store
            .list_agents(&AgentFilter {
                role: Some(role),
                ..AgentFilter::default()
            })?
            .into_iter()
            .next())
    }
}
