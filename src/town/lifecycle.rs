use serde::Serialize;
use tracing::{info, warn};

use super::Town;
use crate::dispatch::branch_for_agent;
use crate::error::{Result, TownError};
use crate::store::NewAgent;
use crate::types::{Agent, AgentFilter, AgentRole, AgentStatus, Bead, NewBead, ReviewEntry};

/// Names handed to new polecats, in order.
pub const POLECAT_NAMES: &[&str] = &[
    "nux", "slit", "rictus", "toast", "capable", "cheedo", "dag", "ace", "keeper", "morsov",
    "valkyrie", "furiosa",
];

/// Stable handle for an agent: `name[-role][-rig]@town`, using 8-character
/// prefixes of the rig and town ids.
pub fn identity_for(name: &str, role: AgentRole, rig_id: Option<&str>, town_id: &str) -> String {
    let mut identity = name.to_string();
    if name != role.as_str() {
        identity.push('-');
        identity.push_str(role.as_str());
    }
    if let Some(rig_id) = rig_id {
        identity.push('-');
        identity.extend(rig_id.chars().take(8));
    }
    identity.push('@');
    identity.extend(town_id.chars().take(8));
    identity
}

#[derive(Debug, Clone, Serialize)]
pub struct SlingResult {
    pub bead: Bead,
    pub agent: Agent,
}

impl Town {
    /// Registers an agent under an explicit name.
    pub fn register_agent(
        &mut self,
        role: AgentRole,
        name: &str,
        rig_id: Option<&str>,
    ) -> Result<Agent> {
        if name.trim().is_empty() {
            return Err(TownError::Invalid("agent name must not be empty".into()));
        }
        if role.is_singleton() && let Some(existing) = self.singleton(role)? {
            return Err(TownError::Conflict(format!(
                "town already has a {role}: {}",
                existing.identity
            )));
        }
        let rig_id = if role.is_singleton() { None } else { rig_id };
        let identity = identity_for(name, role, rig_id, self.id());
        let agent = self.store.insert_agent(
            &NewAgent {
                role,
                name,
                identity: &identity,
                rig_id,
            },
            self.now(),
        )?;
        info!(town_id = %self.id(), agent_id = %agent.id, identity = %agent.identity, "agent registered");
        Ok(agent)
    }

    /// Returns the agent that should take new work for `role`.
    ///
    /// Mayor, refinery and witness are town-wide singletons. Polecats are
    /// reused when idle and unhooked, preferring the requested rig; otherwise
    /// a new one is named from [`POLECAT_NAMES`].
    pub fn get_or_create_agent(&mut self, role: AgentRole, rig_id: Option<&str>) -> Result<Agent> {
        if role.is_singleton() {
            if let Some(agent) = self.singleton(role)? {
                return Ok(agent);
            }
            return self.register_agent(role, role.as_str(), None);
        }

        let idle = self.store.list_agents(&AgentFilter {
            role: Some(AgentRole::Polecat),
            status: Some(AgentStatus::Idle),
            rig_id: None,
        })?;
        let free = |a: &&Agent| a.current_hook_bead_id.is_none();
        let same_rig = idle
            .iter()
            .filter(free)
            .find(|a| rig_id.is_some() && a.rig_id.as_deref() == rig_id);
        if let Some(agent) = same_rig.or_else(|| idle.iter().find(free)) {
            return Ok(agent.clone());
        }

        let name = self.next_polecat_name()?;
        self.register_agent(AgentRole::Polecat, &name, rig_id)
    }

    fn next_polecat_name(&self) -> Result<String> {
        let taken = self.store.polecat_names()?;
        if let Some(name) = POLECAT_NAMES
            .iter()
            .find(|name| !taken.iter().any(|t| t == *name))
        {
            return Ok((*name).to_string());
        }
        let mut n = taken.len() + 1;
        loop {
            let candidate = format!("polecat-{n}");
            if !taken.contains(&candidate) {
                return Ok(candidate);
            }
            n += 1;
        }
    }

    /// Deletes an agent. Its container is stopped in the background and its
    /// activity log is destroyed.
    pub fn delete_agent(&mut self, agent_id: &str) -> Result<Agent> {
        let now = self.now();
        let agent = self.store.delete_agent(agent_id, now)?;
        if let Err(e) = self.logs.destroy(agent_id) {
            warn!(agent_id, error = %e, "failed to remove agent log");
        }
        if agent.status.is_active() {
            let runtime = self.runtime.clone();
            let id = agent.id.clone();
            self.background.spawn("stop-container", move || {
                runtime.stop_agent(&id);
                Ok(())
            });
        }
        info!(town_id = %self.id(), agent_id, "agent deleted");
        Ok(agent)
    }

    /// Creates a task on a rig and hooks it to a polecat. The next tick starts it.
    pub fn sling(&mut self, rig_id: &str, title: &str, body: Option<&str>) -> Result<SlingResult> {
        let rig = self
            .store
            .get_rig(rig_id)?
            .ok_or_else(|| TownError::not_found("rig", rig_id))?;
        let mut new = NewBead::task(title).rig(&rig.id);
        new.body = body.map(str::to_string);
        let bead = self.create_bead(&new)?;
        let agent = self.get_or_create_agent(AgentRole::Polecat, Some(&rig.id))?;
        let agent = self.hook_bead(&agent.id, &bead.id)?;
        info!(
            town_id = %self.id(),
            rig = %rig.name,
            bead_id = %bead.id,
            agent = %agent.identity,
            "work slung"
        );
        let bead = self.store.get_bead(&bead.id)?.unwrap_or(bead);
        Ok(SlingResult { bead, agent })
    }

    /// An agent reports its hooked bead finished: queue it for review and free
    /// the agent.
    pub fn agent_done(
        &mut self,
        agent_id: &str,
        branch: Option<&str>,
        summary: Option<&str>,
    ) -> Result<ReviewEntry> {
        let agent = self
            .store
            .get_agent(agent_id)?
            .ok_or_else(|| TownError::not_found("agent", agent_id))?;
        if agent.role == AgentRole::Refinery {
            return Err(TownError::Invalid(
                "the refinery reports through complete_review".into(),
            ));
        }
        let bead_id = agent.current_hook_bead_id.clone().ok_or_else(|| {
            TownError::Conflict(format!("agent {agent_id} has no hooked bead"))
        })?;

        let now = self.now();
        let branch = branch.map_or_else(|| branch_for_agent(&agent.name, &bead_id), str::to_string);
        let entry = self
            .store
            .submit_review(agent_id, &bead_id, &branch, summary, now)?;
        self.store.unhook_bead(agent_id, now)?;
        self.store.update_agent_status(agent_id, AgentStatus::Idle, now)?;
        self.pull_alarm()?;
        info!(town_id = %self.id(), agent_id, bead_id = %bead_id, branch = %entry.branch, "work submitted for review");
        Ok(entry)
    }
}
