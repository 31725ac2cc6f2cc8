use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};

use super::{TownStore, new_id};
use crate::error::{Result, TownError};
use crate::types::{Escalation, EscalationFilter, NewEscalation, Severity};

const ESCALATION_COLUMNS: &str = "id, source_rig_id, source_agent_id, severity, category, message, \
     acknowledged, re_escalation_count, created_at, acknowledged_at";

fn escalation_from_row(row: &Row<'_>) -> rusqlite::Result<Escalation> {
    Ok(Escalation {
        id: row.get(0)?,
        source_rig_id: row.get(1)?,
        source_agent_id: row.get(2)?,
        severity: row.get(3)?,
        category: row.get(4)?,
        message: row.get(5)?,
        acknowledged: row.get(6)?,
        re_escalation_count: row.get(7)?,
        created_at: row.get(8)?,
        acknowledged_at: row.get(9)?,
    })
}

fn get_escalation_in(conn: &Connection, id: &str) -> rusqlite::Result<Option<Escalation>> {
    conn.query_row(
        &format!("SELECT {ESCALATION_COLUMNS} FROM escalations WHERE id = ?1"),
        params![id],
        escalation_from_row,
    )
    .optional()
}

impl TownStore {
    pub fn insert_escalation(&self, new: &NewEscalation, now: DateTime<Utc>) -> Result<Escalation> {
        if new.message.trim().is_empty() {
            return Err(TownError::Invalid("escalation message must not be empty".into()));
        }
        let id = new_id();
        self.conn.execute(
            "INSERT INTO escalations
                (id, source_rig_id, source_agent_id, severity, category, message,
                 acknowledged, re_escalation_count, created_at, acknowledged_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, 0, ?7, NULL)",
            params![
                id,
                new.source_rig_id,
                new.source_agent_id,
                new.severity,
                new.category,
                new.message,
                now
            ],
        )?;
        get_escalation_in(&self.conn, &id)?.ok_or_else(|| TownError::not_found("escalation", id))
    }

    pub fn get_escalation(&self, id: &str) -> Result<Option<Escalation>> {
        Ok(get_escalation_in(&self.conn, id)?)
    }

    pub fn list_escalations(&self, filter: EscalationFilter) -> Result<Vec<Escalation>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {ESCALATION_COLUMNS} FROM escalations
             WHERE ?1 IS NULL OR acknowledged = ?1
             ORDER BY created_at, id"
        ))?;
        let escalations = stmt
            .query_map(params![filter.acknowledged], escalation_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(match filter.min_severity {
            Some(min) => escalations
                .into_iter()
                .filter(|e| e.severity >= min)
                .collect(),
            None => escalations,
        })
    }

    /// Idempotent: acknowledging twice keeps the first timestamp.
    pub fn acknowledge_escalation(&self, id: &str, now: DateTime<Utc>) -> Result<Escalation> {
        self.conn.execute(
            "UPDATE escalations SET acknowledged = 1, acknowledged_at = ?2
             WHERE id = ?1 AND acknowledged = 0",
            params![id, now],
        )?;
        get_escalation_in(&self.conn, id)?.ok_or_else(|| TownError::not_found("escalation", id))
    }

    /// Unacknowledged escalations still eligible for re-escalation.
    pub fn agable_escalations(&self, max_re_escalations: u32) -> Result<Vec<Escalation>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {ESCALATION_COLUMNS} FROM escalations
             WHERE acknowledged = 0 AND re_escalation_count < ?1
             ORDER BY created_at, id"
        ))?;
        let escalations = stmt
            .query_map(params![max_re_escalations], escalation_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(escalations)
    }

    /// Raises severity one level (never lowering it) and counts the re-escalation.
    pub fn bump_escalation(&self, id: &str) -> Result<Escalation> {
        let current =
            get_escalation_in(&self.conn, id)?.ok_or_else(|| TownError::not_found("escalation", id))?;
        let severity: Severity = current.severity.bump().max(current.severity);
        self.conn.execute(
            "UPDATE escalations
             SET severity = ?2, re_escalation_count = re_escalation_count + 1
             WHERE id = ?1",
            params![id, severity],
        )?;
        get_escalation_in(&self.conn, id)?.ok_or_else(|| TownError::not_found("escalation", id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_770_000_000 + secs, 0).unwrap()
    }

    fn raise(store: &TownStore, severity: Severity) -> Escalation {
        store
            .insert_escalation(
                &NewEscalation {
                    source_rig_id: "r1".into(),
                    source_agent_id: None,
                    severity,
                    category: "general".into(),
                    message: "tests are red".into(),
                },
                at(0),
            )
            .unwrap()
    }

    #[test]
    fn bump_caps_at_critical() {
        let store = TownStore::in_memory().unwrap();
        let e = raise(&store, Severity::High);
        let e = store.bump_escalation(&e.id).unwrap();
        assert_eq!(e.severity, Severity::Critical);
        let e = store.bump_escalation(&e.id).unwrap();
        assert_eq!(e.severity, Severity::Critical);
        assert_eq!(e.re_escalation_count, 2);
        assert!(store.agable_escalations(2).unwrap().is_empty());
    }

    #[test]
    fn acknowledge_is_idempotent() {
        let store = TownStore::in_memory().unwrap();
        let e = raise(&store, Severity::Low);
        let first = store.acknowledge_escalation(&e.id, at(1)).unwrap();
        let second = store.acknowledge_escalation(&e.id, at(2)).unwrap();
        assert!(second.acknowledged);
        assert_eq!(first.acknowledged_at, second.acknowledged_at);
        assert!(matches!(
            store.acknowledge_escalation("nope", at(3)).unwrap_err(),
            TownError::NotFound { .. }
        ));
    }

    #[test]
    fn filters_by_ack_and_severity() {
        let store = TownStore::in_memory().unwrap();
        let low = raise(&store, Severity::Low);
        raise(&store, Severity::High);
        store.acknowledge_escalation(&low.id, at(1)).unwrap();

        let open = store
            .list_escalations(EscalationFilter {
                acknowledged: Some(false),
                min_severity: None,
            })
            .unwrap();
        assert_eq!(open.len(), 1);
        let serious = store
            .list_escalations(EscalationFilter {
                acknowledged: None,
                min_severity: Some(Severity::Medium),
            })
            .unwrap();
        assert_eq!(serious.len(), 1);
        assert_eq!(serious[0].severity, Severity::High);
    }
}
