use chrono::{DateTime, Utc};
use rusqlite::{Connection, Row, params};

use super::agents::require_agent_in;
use super::{TownStore, new_id};
use crate::error::Result;
use crate::types::Mail;

const MAIL_COLUMNS: &str =
    "id, from_identity, to_agent_id, subject, body, delivered, created_at, delivered_at";

fn mail_from_row(row: &Row<'_>) -> rusqlite::Result<Mail> {
    Ok(Mail {
        id: row.get(0)?,
        from_identity: row.get(1)?,
        to_agent_id: row.get(2)?,
        subject: row.get(3)?,
        body: row.get(4)?,
        delivered: row.get(5)?,
        created_at: row.get(6)?,
        delivered_at: row.get(7)?,
    })
}

/// Reads undelivered mail for an agent and marks it delivered.
pub(super) fn take_mail_in(
    conn: &Connection,
    agent_id: &str,
    now: DateTime<Utc>,
) -> rusqlite::Result<Vec<Mail>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {MAIL_COLUMNS} FROM mail
         WHERE to_agent_id = ?1 AND delivered = 0
         ORDER BY created_at, id"
    ))?;
    let mut mail = stmt
        .query_map(params![agent_id], mail_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    conn.execute(
        "UPDATE mail SET delivered = 1, delivered_at = ?2
         WHERE to_agent_id = ?1 AND delivered = 0",
        params![agent_id, now],
    )?;
    for item in &mut mail {
        item.delivered = true;
        item.delivered_at = Some(now);
    }
    Ok(mail)
}

impl TownStore {
    pub fn insert_mail(
        &self,
        from_identity: &str,
        to_agent_id: &str,
        subject: &str,
        body: &str,
        now: DateTime<Utc>,
    ) -> Result<Mail> {
        require_agent_in(&self.conn, to_agent_id)?;
        let mail = Mail {
            id: new_id(),
            from_identity: from_identity.to_string(),
            to_agent_id: to_agent_id.to_string(),
            subject: subject.to_string(),
            body: body.to_string(),
            delivered: false,
            created_at: now,
            delivered_at: None,
        };
        self.conn.execute(
            "INSERT INTO mail
                (id, from_identity, to_agent_id, subject, body, delivered, created_at, delivered_at)
             VALUES (?1, ?2, ?3, ?4, ?5, 0, ?6, NULL)",
            params![
                mail.id,
                mail.from_identity,
                mail.to_agent_id,
                mail.subject,
                mail.body,
                mail.created_at
            ],
        )?;
        Ok(mail)
    }

    /// Delivers pending mail exactly once.
    pub fn take_mail(&mut self, agent_id: &str, now: DateTime<Utc>) -> Result<Vec<Mail>> {
        let tx = self.conn.transaction()?;
        let mail = take_mail_in(&tx, agent_id, now)?;
        tx.commit()?;
        Ok(mail)
    }

    pub fn undelivered_count(&self, agent_id: &str) -> Result<u32> {
        Ok(self.conn.query_row(
            "SELECT COUNT(*) FROM mail WHERE to_agent_id = ?1 AND delivered = 0",
            params![agent_id],
            |row| row.get(0),
        )?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TownError;
    use crate::store::NewAgent;
    use crate::types::AgentRole;

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_770_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn mail_is_delivered_once() {
        let mut store = TownStore::in_memory().unwrap();
        let agent = store
            .insert_agent(
                &NewAgent {
                    role: AgentRole::Mayor,
                    name: "mayor",
                    identity: "mayor@t",
                    rig_id: None,
                },
                at(0),
            )
            .unwrap();
        store
            .insert_mail("witness@t", &agent.id, "ping", "still there?", at(1))
            .unwrap();
        assert_eq!(store.undelivered_count(&agent.id).unwrap(), 1);

        let first = store.take_mail(&agent.id, at(2)).unwrap();
        assert_eq!(first.len(), 1);
        assert!(first[0].delivered);
        assert_eq!(first[0].delivered_at, Some(at(2)));
        assert!(store.take_mail(&agent.id, at(3)).unwrap().is_empty());
    }

    #[test]
    fn mail_to_unknown_agent_fails() {
        let store = TownStore::in_memory().unwrap();
        let err = store
            .insert_mail("a@t", "ghost", "s", "b", at(0))
            .unwrap_err();
        assert!(matches!(err, TownError::NotFound { .. }));
    }
}
