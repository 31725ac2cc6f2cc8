use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, PoisonError};

use tracing::{debug, info, warn};

use super::Town;
use super::containers::StartPrompt;
use crate::dispatch::{ContainerRuntime, ContainerStatus, StartAgentRequest};
use crate::error::{Result, TownError};
use crate::types::{AgentRole, AgentStatus, Escalation, EscalationFilter, NewEscalation};

/// The line the mayor receives for an escalation.
pub(crate) fn mayor_message(escalation: &Escalation) -> String {
    let mut text = format!(
        "[{}] {} escalation from rig {}",
        escalation.severity, escalation.category, escalation.source_rig_id
    );
    if let Some(agent) = &escalation.source_agent_id {
        text.push_str(&format!(" (agent {agent})"));
    }
    if escalation.re_escalation_count > 0 {
        text.push_str(&format!(
            ", unacknowledged, re-escalated {}x",
            escalation.re_escalation_count
        ));
    }
    text.push_str(&format!(": {}\nEscalation id: {}", escalation.message, escalation.id));
    text
}

/// Mayor notifications in flight off the town thread.
///
/// Deliveries take the lane one at a time, so a second notification sees the
/// session the first one started. Sessions started in the background are
/// reported on the channel and marked working by the town.
pub(crate) struct MayorLine {
    lane: Arc<Mutex<()>>,
    started_tx: Sender<String>,
    started_rx: Receiver<String>,
}

impl Default for MayorLine {
    fn default() -> Self {
        let (started_tx, started_rx) = mpsc::channel();
        Self {
            lane: Arc::new(Mutex::new(())),
            started_tx,
            started_rx,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Delivery {
    Messaged,
    Started,
    Undelivered,
}

/// A running mayor gets a message. Otherwise a session starts, if one could
/// be prepared.
fn deliver_to_mayor(
    runtime: &dyn ContainerRuntime,
    mayor_id: &str,
    message: &str,
    start: Option<&StartAgentRequest>,
) -> Delivery {
    if runtime.agent_status(mayor_id) == ContainerStatus::Running {
        return if runtime.send_message(mayor_id, message) {
            Delivery::Messaged
        } else {
            Delivery::Undelivered
        };
    }
    match start {
        Some(request) if runtime.start_agent(request) => Delivery::Started,
        _ => Delivery::Undelivered,
    }
}

impl Town {
    /// Records an escalation. Medium and above reach the mayor.
    pub fn route_escalation(&mut self, new: &NewEscalation) -> Result<Escalation> {
        if new.source_rig_id.trim().is_empty() {
            return Err(TownError::Invalid("escalation needs a source rig".into()));
        }
        let escalation = self.store.insert_escalation(new, self.now())?;
        info!(
            town_id = %self.id(),
            escalation_id = %escalation.id,
            severity = %escalation.severity,
            category = %escalation.category,
            "escalation raised"
        );
        if escalation.severity.notifies_mayor() {
            self.notify_mayor(&mayor_message(&escalation));
        }
        Ok(escalation)
    }

    pub fn acknowledge_escalation(&mut self, id: &str) -> Result<Escalation> {
        let escalation = self.store.acknowledge_escalation(id, self.now())?;
        info!(town_id = %self.id(), escalation_id = id, "escalation acknowledged");
        Ok(escalation)
    }

    pub fn list_escalations(&self, filter: EscalationFilter) -> Result<Vec<Escalation>> {
        self.store.list_escalations(filter)
    }

    /// Best effort and detached: a running mayor gets a message, otherwise a
    /// mayor session starts with the message as its prompt.
    pub(crate) fn notify_mayor(&mut self, message: &str) {
        if let Err(e) = self.try_notify_mayor(message) {
            warn!(town_id = %self.id(), error = %e, "could not notify mayor");
        }
    }

    fn try_notify_mayor(&mut self, message: &str) -> Result<()> {
        let mayor = self.get_or_create_agent(AgentRole::Mayor, None)?;
        let start = match self.prepare_start(&mayor, StartPrompt::Message(message)) {
            Ok(request) => Some(request),
            Err(e) => {
                warn!(town_id = %self.id(), agent_id = %mayor.id, error = %e, "could not prepare mayor session");
                None
            }
        };

        let runtime = self.runtime.clone();
        let lane = self.mayor_line.lane.clone();
        let started = self.mayor_line.started_tx.clone();
        let town_id = self.id().to_string();
        let message = message.to_string();
        self.background.spawn("notify-mayor", move || {
            let turn = lane.lock().unwrap_or_else(PoisonError::into_inner);
            let delivery = deliver_to_mayor(runtime.as_ref(), &mayor.id, &message, start.as_ref());
            drop(turn);
            match delivery {
                Delivery::Messaged => debug!(town_id = %town_id, agent_id = %mayor.id, "mayor messaged"),
                Delivery::Started => {
                    info!(town_id = %town_id, agent_id = %mayor.id, "mayor session started");
                    // the town may be gone already
                    let _ = started.send(mayor.id);
                }
                Delivery::Undelivered => {
                    warn!(town_id = %town_id, agent_id = %mayor.id, "mayor notification was not delivered");
                }
            }
            Ok(())
        });
        Ok(())
    }

    /// Marks mayors started by background notifications as working.
    pub(crate) fn apply_mayor_starts(&self) {
        while let Ok(agent_id) = self.mayor_line.started_rx.try_recv() {
            if let Err(e) = self
                .store
                .update_agent_status(&agent_id, AgentStatus::Working, self.now())
            {
                warn!(town_id = %self.id(), agent_id = %agent_id, error = %e, "could not mark mayor working");
            }
        }
    }
}
