use tracing::{info, warn};

use super::Town;
use crate::error::{Result, TownError};
use crate::types::{AgentRole, AgentStatus, BeadStatus, ReviewEntry, ReviewOutcome, ReviewStatus};

impl Town {
    /// Queues a branch for review. A submitter hooked to the bead is released
    /// and goes idle, as with `agent_done`.
    pub fn submit_review(
        &mut self,
        agent_id: &str,
        bead_id: &str,
        branch: &str,
        summary: Option<&str>,
    ) -> Result<ReviewEntry> {
        if branch.trim().is_empty() {
            return Err(TownError::Invalid("review branch must not be empty".into()));
        }
        let agent = self
            .store
            .get_agent(agent_id)?
            .ok_or_else(|| TownError::not_found("agent", agent_id))?;
        let now = self.now();
        let entry = self
            .store
            .submit_review(agent_id, bead_id, branch, summary, now)?;
        if agent.current_hook_bead_id.as_deref() == Some(bead_id)
            && agent.role != AgentRole::Refinery
        {
            self.store.unhook_bead(agent_id, now)?;
            self.store
                .update_agent_status(agent_id, AgentStatus::Idle, now)?;
        }
        self.pull_alarm()?;
        info!(town_id = %self.id(), agent_id, bead_id, branch, "review submitted");
        Ok(entry)
    }

    pub fn get_review(&self, id: &str) -> Result<Option<ReviewEntry>> {
        self.store.get_review(id)
    }

    pub fn list_reviews(&self, status: Option<ReviewStatus>) -> Result<Vec<ReviewEntry>> {
        self.store.list_reviews(status)
    }

    /// The refinery reports the result of a gated review.
    ///
    /// Completing an entry that is already merged or failed returns it
    /// unchanged.
    pub fn complete_review(
        &mut self,
        entry_id: &str,
        status: ReviewStatus,
        commit_sha: Option<&str>,
        summary: Option<&str>,
    ) -> Result<ReviewEntry> {
        let outcome = match status {
            ReviewStatus::Merged => ReviewOutcome::Merged {
                commit_sha: commit_sha.map(str::to_string),
            },
            ReviewStatus::Failed => ReviewOutcome::Failed {
                error: summary.unwrap_or("rejected by refinery").to_string(),
            },
            ReviewStatus::Pending | ReviewStatus::Running => {
                return Err(TownError::Invalid(format!(
                    "review can only complete as merged or failed, not {status}"
                )));
            }
        };
        let entry = self
            .store
            .get_review(entry_id)?
            .ok_or_else(|| TownError::not_found("review", entry_id))?;
        self.apply_review_outcome(&entry, &outcome, summary)
    }

    /// Records a terminal outcome: a merge closes the bead, a failure leaves
    /// it in progress. A refinery holding the bead is always released; after a
    /// merge so is any other holder, since a closed bead carries no hook.
    pub(crate) fn apply_review_outcome(
        &mut self,
        entry: &ReviewEntry,
        outcome: &ReviewOutcome,
        summary: Option<&str>,
    ) -> Result<ReviewEntry> {
        let now = self.now();
        let Some(finished) = self.store.finish_review(&entry.id, outcome, summary, now)? else {
            return self
                .store
                .get_review(&entry.id)?
                .ok_or_else(|| TownError::not_found("review", &entry.id));
        };

        match outcome {
            ReviewOutcome::Merged { commit_sha } => {
                let bead = self.store.get_bead(&entry.bead_id)?;
                match bead {
                    Some(bead) if !bead.status.is_terminal() => {
                        self.update_bead_status(&bead.id, BeadStatus::Closed, Some(&entry.agent_id))?;
                    }
                    Some(bead) => {
                        warn!(town_id = %self.id(), bead_id = %bead.id, status = %bead.status, "merged bead was already terminal");
                    }
                    None => warn!(town_id = %self.id(), bead_id = %entry.bead_id, "merged bead no longer exists"),
                }
                info!(
                    town_id = %self.id(),
                    review_id = %entry.id,
                    bead_id = %entry.bead_id,
                    commit = commit_sha.as_deref().unwrap_or("-"),
                    "review merged"
                );
            }
            ReviewOutcome::Failed { error } => {
                warn!(town_id = %self.id(), review_id = %entry.id, bead_id = %entry.bead_id, error = %error, "review failed");
            }
        }

        let merged = matches!(outcome, ReviewOutcome::Merged { .. });
        if let Some(holder) = self.store.agent_hooked_to(&entry.bead_id)?
            && (merged || holder.role == AgentRole::Refinery)
        {
            self.store.unhook_bead(&holder.id, now)?;
            self.store
                .update_agent_status(&holder.id, AgentStatus::Idle, now)?;
        }
        Ok(finished)
    }
}
