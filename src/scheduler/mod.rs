//! The town's recurring wake-up.
//!
//! A tick runs four phases in order: dispatch, witness patrol, review drain
//! and escalation aging. A phase that errors is logged and the next one still
//! runs. The tick ends by re-arming the alarm.
//!
//! Outward calls for independent agents fan out on scoped threads. Requests
//! are built from the store first and results are written back after the
//! join, so the store itself never leaves the town's thread.

mod dispatch;
mod escalation;
mod patrol;
mod review;

use std::thread;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info_span, warn};

use crate::error::Result;
use crate::town::Town;

/// What one tick did.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TickReport {
    pub dispatched: usize,
    pub dispatch_failed: usize,
    /// Agents whose bead was failed by the circuit breaker.
    pub tripped: usize,
    pub completed: usize,
    pub went_idle: usize,
    pub nudged: usize,
    pub reviews_dispatched: usize,
    pub reviews_merged: usize,
    pub reviews_failed: usize,
    pub escalations_bumped: usize,
    pub phase_errors: Vec<String>,
    pub next_wake_at: Option<DateTime<Utc>>,
}

type Phase = fn(&mut Town, &mut TickReport) -> Result<()>;

const PHASES: &[(&str, Phase)] = &[
    ("dispatch", Town::dispatch_phase),
    ("patrol", Town::patrol_phase),
    ("review", Town::review_phase),
    ("escalation", Town::escalation_phase),
];

/// Runs `call` for every item concurrently and returns the results in input
/// order once all have finished.
pub(crate) fn fan_out<T, R, F>(items: &[T], call: F) -> Vec<R>
where
    T: Sync,
    R: Send,
    F: Fn(&T) -> R + Sync,
{
    if items.len() < 2 {
        return items.iter().map(&call).collect();
    }
    let call = &call;
    thread::scope(|scope| {
        let handles: Vec<_> = items
            .iter()
            .map(|item| scope.spawn(move || call(item)))
            .collect();
        handles
            .into_iter()
            .map(|handle| {
                handle
                    .join()
                    .unwrap_or_else(|panic| std::panic::resume_unwind(panic))
            })
            .collect()
    })
}

impl Town {
    /// Runs every phase once and re-arms the alarm.
    pub fn tick(&mut self) -> Result<TickReport> {
        let span = info_span!("tick", town_id = %self.id());
        let _enter = span.enter();

        self.apply_mayor_starts();
        let mut report = TickReport::default();
        for (name, phase) in PHASES {
            if let Err(e) = phase(self, &mut report) {
                warn!(phase = name, error = %e, "tick phase failed");
                report.phase_errors.push(format!("{name}: {e}"));
            }
        }
        self.background.reap();
        report.next_wake_at = Some(self.rearm()?);
        debug!(?report, "tick finished");
        Ok(report)
    }

    /// Whether the persisted alarm has come due. A town with no alarm is due.
    pub fn is_due(&self) -> Result<bool> {
        Ok(self
            .store
            .next_wake_at()?
            .is_none_or(|at| at <= self.now()))
    }

    /// Short interval while anything is in flight, long otherwise.
    fn rearm(&self) -> Result<DateTime<Utc>> {
        let busy = self.store.has_active_agents()? || self.store.has_open_reviews()?;
        let interval = if busy {
            self.settings.scheduler.active_interval()
        } else {
            self.settings.scheduler.idle_interval()
        };
        let next = self
            .now()
            .checked_add_signed(interval)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        self.store.set_next_wake_at(next)?;
        Ok(next)
    }
}
