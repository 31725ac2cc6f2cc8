use tracing::{debug, info, warn};

use super::TickReport;
use crate::error::Result;
use crate::town::{StartPrompt, Town};
use crate::types::{AgentRole, ReviewEntry, ReviewOutcome};

impl Town {
    /// Takes the oldest pending review, at most one per tick.
    ///
    /// With quality gates configured the refinery reviews it; otherwise, or
    /// when the refinery cannot be started, the branch is merged directly.
    pub(super) fn review_phase(&mut self, report: &mut TickReport) -> Result<()> {
        let reset = self.store.reset_orphaned_reviews()?;
        if reset > 0 {
            info!(count = reset, "orphaned reviews returned to pending");
        }
        let Some(entry) = self.store.oldest_pending_review()? else {
            return Ok(());
        };

        if self.store.town_config()?.has_quality_gates() {
            let refinery = self.get_or_create_agent(AgentRole::Refinery, None)?;
            if refinery.current_hook_bead_id.is_some() || refinery.status.is_active() {
                debug!(review_id = %entry.id, "refinery busy, review stays pending");
                return Ok(());
            }
            self.store.mark_review_running(&entry.id)?;
            if self.dispatch_refinery(&refinery.id, &entry)? {
                report.reviews_dispatched += 1;
                return Ok(());
            }
            warn!(review_id = %entry.id, "refinery did not start, merging directly");
        } else {
            self.store.mark_review_running(&entry.id)?;
        }

        let outcome = self.start_merge_in_container(&entry);
        match &outcome {
            ReviewOutcome::Merged { .. } => report.reviews_merged += 1,
            ReviewOutcome::Failed { .. } => report.reviews_failed += 1,
        }
        self.apply_review_outcome(&entry, &outcome, None)?;
        Ok(())
    }

    /// Hooks the refinery to the entry's bead and starts it. On any failure
    /// the refinery is left unhooked and `false` is returned.
    fn dispatch_refinery(&mut self, refinery_id: &str, entry: &ReviewEntry) -> Result<bool> {
        let now = self.now();
        let bead = match self.store.get_bead(&entry.bead_id)? {
            Some(bead) => bead,
            None => return Ok(false),
        };
        let refinery = match self.store.hook_bead(refinery_id, &entry.bead_id, now) {
            Ok(agent) => agent,
            Err(e) => {
                warn!(review_id = %entry.id, error = %e, "could not hook refinery");
                return Ok(false);
            }
        };
        if self.start_agent_in_container(&refinery, StartPrompt::Review(entry, &bead)) {
            self.store.record_dispatch_success(refinery_id, self.now())?;
            info!(review_id = %entry.id, branch = %entry.branch, "refinery dispatched");
            return Ok(true);
        }
        self.store.unhook_bead(refinery_id, self.now())?;
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use crate::town::test_support::{Harness, harness};
    use crate::types::{AgentRole, AgentStatus, BeadStatus, ReviewOutcome, ReviewStatus};

    fn with_gates(h: &Harness) {
        let mut config = h.town.town_config().unwrap();
        config.quality_gates = vec!["cargo test".into(), "cargo clippy".into()];
        h.town.set_town_config(&config).unwrap();
    }

    fn submitted(h: &mut Harness) -> (String, String) {
        let rig = h.town.add_rig("api", "https://git.example/api.git", "main").unwrap();
        let slung = h.town.sling(&rig.id, "fix bug", None).unwrap();
        let entry = h.town.agent_done(&slung.agent.id, None, None).unwrap();
        (entry.id, slung.bead.id)
    }

    #[test]
    fn ungated_merge_success_closes_bead() {
        let mut h = harness();
        let (entry_id, bead_id) = submitted(&mut h);
        h.runtime.push_merge(ReviewOutcome::Merged {
            commit_sha: Some("cafe123".into()),
        });

        let report = h.town.tick().unwrap();
        assert_eq!(report.reviews_merged, 1);
        assert_eq!(h.runtime.merges().len(), 1);
        let entry = h.town.get_review(&entry_id).unwrap().unwrap();
        assert_eq!(entry.status, ReviewStatus::Merged);
        assert_eq!(entry.commit_sha.as_deref(), Some("cafe123"));
        assert_eq!(
            h.town.get_bead(&bead_id).unwrap().unwrap().status,
            BeadStatus::Closed
        );

        h.town.tick().unwrap();
        assert_eq!(h.runtime.merges().len(), 1);
    }

    #[test]
    fn ungated_merge_failure_keeps_bead_open() {
        let mut h = harness();
        let (entry_id, bead_id) = submitted(&mut h);
        h.runtime.push_merge(ReviewOutcome::Failed {
            error: "conflict in src/lib.rs".into(),
        });

        let report = h.town.tick().unwrap();
        assert_eq!(report.reviews_failed, 1);
        assert_eq!(h.runtime.merges().len(), 1);
        let entry = h.town.get_review(&entry_id).unwrap().unwrap();
        assert_eq!(entry.status, ReviewStatus::Failed);
        assert_eq!(entry.error.as_deref(), Some("conflict in src/lib.rs"));
        assert_eq!(
            h.town.get_bead(&bead_id).unwrap().unwrap().status,
            BeadStatus::InProgress
        );
    }

    #[test]
    fn gated_review_goes_to_refinery() {
        let mut h = harness();
        with_gates(&h);
        let (entry_id, bead_id) = submitted(&mut h);

        let report = h.town.tick().unwrap();
        assert_eq!(report.reviews_dispatched, 1);
        assert!(h.runtime.merges().is_empty());
        let start = h.runtime.starts().pop().unwrap();
        assert_eq!(start.role, AgentRole::Refinery);
        assert!(start.system_prompt.contains("cargo clippy"));

        let refinery = h.town.get_agent(&start.agent_id).unwrap().unwrap();
        assert_eq!(refinery.status, AgentStatus::Working);
        assert_eq!(refinery.current_hook_bead_id.as_deref(), Some(bead_id.as_str()));
        assert_eq!(
            h.town.get_review(&entry_id).unwrap().unwrap().status,
            ReviewStatus::Running
        );
    }

    #[test]
    fn busy_refinery_leaves_entry_pending() {
        let mut h = harness();
        with_gates(&h);
        let (first, _) = submitted(&mut h);
        let rig = h.town.list_rigs().unwrap().remove(0);
        let other = h.town.sling(&rig.id, "second", None).unwrap();
        let second = h.town.agent_done(&other.agent.id, None, None).unwrap();

        h.town.tick().unwrap();
        h.town.tick().unwrap();
        assert_eq!(
            h.town.get_review(&first).unwrap().unwrap().status,
            ReviewStatus::Running
        );
        assert_eq!(
            h.town.get_review(&second.id).unwrap().unwrap().status,
            ReviewStatus::Pending
        );
    }

    #[test]
    fn refinery_start_failure_falls_back_to_merge() {
        let mut h = harness();
        with_gates(&h);
        let (entry_id, _) = submitted(&mut h);
        h.runtime.fail_starts();

        let report = h.town.tick().unwrap();
        assert_eq!(report.reviews_dispatched, 0);
        assert_eq!(report.reviews_merged, 1);
        assert_eq!(h.runtime.merges().len(), 1);
        assert_eq!(
            h.town.get_review(&entry_id).unwrap().unwrap().status,
            ReviewStatus::Merged
        );
        let refinery = h.town.get_or_create_agent(AgentRole::Refinery, None).unwrap();
        assert_eq!(refinery.current_hook_bead_id, None);
    }
}
