use tracing::debug;

use super::Town;
use crate::error::{Result, TownError};
use crate::types::{Mail, PrimeContext};

impl Town {
    /// Queues mail for the agent known as `to_identity`.
    pub fn send_mail(
        &mut self,
        from_identity: &str,
        to_identity: &str,
        subject: &str,
        body: &str,
    ) -> Result<Mail> {
        if subject.trim().is_empty() {
            return Err(TownError::Invalid("mail subject must not be empty".into()));
        }
        let recipient = self
            .store
            .get_agent_by_identity(to_identity)?
            .ok_or_else(|| TownError::not_found("agent", to_identity))?;
        let mail = self
            .store
            .insert_mail(from_identity, &recipient.id, subject, body, self.now())?;
        debug!(town_id = %self.id(), from = from_identity, to = to_identity, subject, "mail sent");
        Ok(mail)
    }

    /// Hands out undelivered mail. Each message is returned once.
    pub fn check_mail(&mut self, agent_id: &str) -> Result<Vec<Mail>> {
        let now = self.now();
        self.store.take_mail(agent_id, now)
    }

    /// Everything an agent needs when its session starts, with its mail
    /// delivered in the same step.
    pub fn prime(&mut self, agent_id: &str) -> Result<PrimeContext> {
        let now = self.now();
        let limit = self.settings.scheduler.prime_context_limit;
        let context = self.store.prime(agent_id, limit, now)?;
        self.store.touch_heartbeat(agent_id, now)?;
        Ok(context)
    }
}
