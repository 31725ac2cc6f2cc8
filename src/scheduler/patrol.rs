use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use super::{TickReport, fan_out};
use crate::dispatch::ContainerStatus;
use crate::error::Result;
use crate::town::Town;
use crate::types::{Agent, AgentFilter, AgentRole, AgentStatus, ReviewOutcome};

const LIVENESS_SUBJECT: &str = "Liveness check";

impl Town {
    /// Reconciles working and blocked agents with what the runtime reports.
    pub(super) fn patrol_phase(&mut self, report: &mut TickReport) -> Result<()> {
        let mut watched = Vec::new();
        for status in [AgentStatus::Working, AgentStatus::Blocked] {
            watched.extend(self.store.list_agents(&AgentFilter {
                status: Some(status),
                ..AgentFilter::default()
            })?);
        }
        if watched.is_empty() {
            return Ok(());
        }

        let runtime = Arc::clone(&self.runtime);
        let statuses = fan_out(&watched, |agent| runtime.agent_status(&agent.id));

        let stale_before = self.now() - self.settings.scheduler.stale_threshold();
        for (agent, status) in watched.iter().zip(statuses) {
            if let Err(e) = self.patrol_agent(agent, status, stale_before, report) {
                warn!(agent_id = %agent.id, error = %e, "patrol failed for agent");
            }
        }
        Ok(())
    }

    fn patrol_agent(
        &mut self,
        agent: &Agent,
        status: ContainerStatus,
        stale_before: DateTime<Utc>,
        report: &mut TickReport,
    ) -> Result<()> {
        match &status {
            ContainerStatus::Unknown => Ok(()),
            ContainerStatus::Running => {
                let stale = agent.last_activity_at.is_none_or(|at| at < stale_before);
                if stale && agent.stale_nudged_at.is_none() {
                    self.nudge(agent)?;
                    report.nudged += 1;
                }
                Ok(())
            }
            ContainerStatus::Gone { .. } if agent.role == AgentRole::Refinery => {
                self.refinery_exited(agent)?;
                report.went_idle += 1;
                Ok(())
            }
            ContainerStatus::Gone { .. }
                if status.completed() && agent.current_hook_bead_id.is_some() =>
            {
                self.agent_done(&agent.id, None, None)?;
                report.completed += 1;
                Ok(())
            }
            ContainerStatus::Gone { reason } => {
                info!(
                    agent_id = %agent.id,
                    reason = reason.as_deref().unwrap_or("unknown"),
                    hooked = agent.current_hook_bead_id.is_some(),
                    "container gone, agent back to idle"
                );
                self.store
                    .update_agent_status(&agent.id, AgentStatus::Idle, self.now())?;
                report.went_idle += 1;
                Ok(())
            }
        }
    }

    /// One liveness mail per outstanding check; a heartbeat clears it.
    fn nudge(&mut self, agent: &Agent) -> Result<()> {
        let witness = self.get_or_create_agent(AgentRole::Witness, None)?;
        let body = format!(
            "No activity from {} since {}. Reply with a heartbeat or report your status.",
            agent.identity,
            agent
                .last_activity_at
                .map_or_else(|| "start".to_string(), |at| at.to_rfc3339()),
        );
        let now = self.now();
        self.store
            .insert_mail(&witness.identity, &agent.id, LIVENESS_SUBJECT, &body, now)?;
        self.store.mark_stale_nudged(&agent.id, now)?;
        info!(agent_id = %agent.id, "stale agent nudged");
        Ok(())
    }

    /// A refinery that exits without reporting fails the review it held.
    fn refinery_exited(&mut self, refinery: &Agent) -> Result<()> {
        let now = self.now();
        if let Some(bead_id) = refinery.current_hook_bead_id.as_deref()
            && let Some(entry) = self.store.running_review_for_bead(bead_id)?
        {
            warn!(agent_id = %refinery.id, review_id = %entry.id, "refinery exited without reporting");
            self.apply_review_outcome(
                &entry,
                &ReviewOutcome::Failed {
                    error: "refinery exited without reporting".into(),
                },
                None,
            )?;
        }
        self.store.unhook_bead(&refinery.id, now)?;
        self.store
            .update_agent_status(&refinery.id, AgentStatus::Idle, now)?;
        Ok(())
    }
}
