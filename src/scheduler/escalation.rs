use tracing::info;

use super::TickReport;
use crate::error::Result;
use crate::town::{Town, mayor_message};

impl Town {
    /// Bumps unacknowledged escalations once they outlive
    /// `(re_escalation_count + 1) * escalation_base`.
    pub(super) fn escalation_phase(&mut self, report: &mut TickReport) -> Result<()> {
        let now = self.now();
        let base = self.settings.scheduler.escalation_base();
        let max = self.settings.scheduler.max_re_escalations;

        for escalation in self.store.agable_escalations(max)? {
            let steps = i32::try_from(escalation.re_escalation_count + 1).unwrap_or(i32::MAX);
            let due = base.checked_mul(steps);
            if due.is_none_or(|due| now - escalation.created_at < due) {
                continue;
            }
            let bumped = self.store.bump_escalation(&escalation.id)?;
            info!(
                escalation_id = %bumped.id,
                from = %escalation.severity,
                to = %bumped.severity,
                count = bumped.re_escalation_count,
                "escalation aged"
            );
            report.escalations_bumped += 1;
            if bumped.severity.notifies_mayor() {
                self.notify_mayor(&mayor_message(&bumped));
            }
        }
        Ok(())
    }
}
