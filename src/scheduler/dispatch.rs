use std::sync::Arc;

use tracing::{info, warn};

use super::{TickReport, fan_out};
use crate::dispatch::StartAgentRequest;
use crate::error::Result;
use crate::store::DispatchAttempt;
use crate::town::{StartPrompt, Town};
use crate::types::{Agent, AgentRole};

impl Town {
    /// Starts a container for every idle agent that holds a hook.
    pub(super) fn dispatch_phase(&mut self, report: &mut TickReport) -> Result<()> {
        let now = self.now();
        let max = self.settings.scheduler.max_dispatch_attempts;

        let mut planned: Vec<StartAgentRequest> = Vec::new();
        for agent in self.store.dispatchable_agents()? {
            let attempt = match self.store.claim_dispatch_attempt(&agent.id, max, now)? {
                DispatchAttempt::Proceed(n) => n,
                DispatchAttempt::Tripped => {
                    warn!(
                        agent_id = %agent.id,
                        bead_id = agent.current_hook_bead_id.as_deref().unwrap_or("-"),
                        max,
                        "dispatch circuit open, bead failed"
                    );
                    report.tripped += 1;
                    continue;
                }
            };
            match self.plan_start(&agent) {
                Ok(Some(request)) => planned.push(request),
                Ok(None) => {}
                Err(e) => {
                    warn!(agent_id = %agent.id, attempt, error = %e, "could not prepare dispatch");
                    report.dispatch_failed += 1;
                }
            }
        }
        if planned.is_empty() {
            return Ok(());
        }

        let runtime = Arc::clone(&self.runtime);
        let results = fan_out(&planned, |request| runtime.start_agent(request));

        let now = self.now();
        for (request, started) in planned.iter().zip(results) {
            if started {
                self.store.record_dispatch_success(&request.agent_id, now)?;
                info!(agent_id = %request.agent_id, branch = %request.branch, "agent dispatched");
                report.dispatched += 1;
            } else {
                warn!(agent_id = %request.agent_id, "container start failed");
                report.dispatch_failed += 1;
            }
        }
        Ok(())
    }

    fn plan_start(&self, agent: &Agent) -> Result<Option<StartAgentRequest>> {
        let Some(bead_id) = agent.current_hook_bead_id.as_deref() else {
            return Ok(None);
        };
        let Some(bead) = self.store.get_bead(bead_id)? else {
            return Ok(None);
        };
        if agent.role == AgentRole::Refinery
            && let Some(entry) = self.store.running_review_for_bead(bead_id)?
        {
            return self
                .prepare_start(agent, StartPrompt::Review(&entry, &bead))
                .map(Some);
        }
        self.prepare_start(agent, StartPrompt::Bead(&bead)).map(Some)
    }
}

#[cfg(test)]
mod tests {
    use crate::town::test_support::harness;
    use crate::types::{AgentStatus, BeadStatus};

    #[test]
    fn slung_work_starts_on_next_tick() {
        let mut h = harness();
        let rig = h.town.add_rig("api", "https://git.example/api.git", "main").unwrap();
        let slung = h.town.sling(&rig.id, "fix bug", None).unwrap();
        assert_eq!(slung.agent.status, AgentStatus::Idle);

        let report = h.town.tick().unwrap();
        assert_eq!(report.dispatched, 1);
        let agent = h.town.get_agent(&slung.agent.id).unwrap().unwrap();
        assert_eq!(agent.status, AgentStatus::Working);
        assert_eq!(agent.dispatch_attempts, 0);
        assert_eq!(h.runtime.starts().len(), 1);

        // working agents are not dispatched again
        h.town.tick().unwrap();
        assert_eq!(h.runtime.starts().len(), 1);
    }

    #[test]
    fn breaker_fails_bead_after_max_attempts() {
        let mut h = harness();
        h.runtime.fail_starts();
        let rig = h.town.add_rig("api", "https://git.example/api.git", "main").unwrap();
        let slung = h.town.sling(&rig.id, "fix bug", None).unwrap();
        let max = h.town.settings().scheduler.max_dispatch_attempts;

        for n in 1..=max {
            let report = h.town.tick().unwrap();
            assert_eq!(report.dispatch_failed, 1);
            let agent = h.town.get_agent(&slung.agent.id).unwrap().unwrap();
            assert_eq!(agent.dispatch_attempts, n);
        }
        let report = h.town.tick().unwrap();
        assert_eq!(report.tripped, 1);
        assert_eq!(h.runtime.starts().len(), max as usize);

        let agent = h.town.get_agent(&slung.agent.id).unwrap().unwrap();
        assert_eq!(agent.current_hook_bead_id, None);
        assert_eq!(agent.status, AgentStatus::Idle);
        assert_eq!(
            h.town.get_bead(&slung.bead.id).unwrap().unwrap().status,
            BeadStatus::Failed
        );
    }

    #[test]
    fn one_failure_does_not_block_others() {
        let mut h = harness();
        let rig = h.town.add_rig("api", "https://git.example/api.git", "main").unwrap();
        let first = h.town.sling(&rig.id, "one", None).unwrap();
        let second = h.town.sling(&rig.id, "two", None).unwrap();
        assert_ne!(first.agent.id, second.agent.id);
        h.runtime.push_start(false);
        h.runtime.push_start(true);

        let report = h.town.tick().unwrap();
        assert_eq!(report.dispatched + report.dispatch_failed, 2);
        assert_eq!(report.dispatched, 1);
    }
}
