use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params, params_from_iter};
use serde_json::Value;

use super::{TownStore, json_column, new_id};
use crate::error::{Result, TownError};
use crate::types::{Bead, BeadEvent, BeadFilter, BeadStatus, NewBead};

const BEAD_COLUMNS: &str = "id, type, status, title, body, rig_id, assignee_id, priority, labels, \
     metadata, created_by, created_at, updated_at, closed_at";

/// Highest priority first, then oldest.
const BEAD_ORDER: &str = "ORDER BY CASE priority \
     WHEN 'critical' THEN 0 WHEN 'high' THEN 1 WHEN 'medium' THEN 2 ELSE 3 END, created_at, id";

fn bead_from_row(row: &Row<'_>) -> rusqlite::Result<Bead> {
    let labels: String = row.get(8)?;
    Ok(Bead {
        id: row.get(0)?,
        bead_type: row.get(1)?,
        status: row.get(2)?,
        title: row.get(3)?,
        body: row.get(4)?,
        rig_id: row.get(5)?,
        assignee_id: row.get(6)?,
        priority: row.get(7)?,
        labels: json_column(8, &labels)?,
        metadata: row.get(9)?,
        created_by: row.get(10)?,
        created_at: row.get(11)?,
        updated_at: row.get(12)?,
        closed_at: row.get(13)?,
    })
}

fn event_from_row(row: &Row<'_>) -> rusqlite::Result<BeadEvent> {
    Ok(BeadEvent {
        id: row.get(0)?,
        bead_id: row.get(1)?,
        agent_id: row.get(2)?,
        event_type: row.get(3)?,
        old_value: row.get(4)?,
        new_value: row.get(5)?,
        metadata: row.get(6)?,
        created_at: row.get(7)?,
    })
}

pub(super) fn get_bead_in(conn: &Connection, id: &str) -> rusqlite::Result<Option<Bead>> {
    conn.query_row(
        &format!("SELECT {BEAD_COLUMNS} FROM beads WHERE id = ?1"),
        params![id],
        bead_from_row,
    )
    .optional()
}

pub(super) fn require_bead_in(conn: &Connection, id: &str) -> Result<Bead> {
    get_bead_in(conn, id)?.ok_or_else(|| TownError::not_found("bead", id))
}

/// A single audit row. Values are free-form text.
#[derive(Debug, Default)]
pub struct EventRecord<'a> {
    pub agent_id: Option<&'a str>,
    pub event_type: &'a str,
    pub old_value: Option<&'a str>,
    pub new_value: Option<&'a str>,
    pub metadata: Option<Value>,
}

pub(super) fn record_event_in(
    conn: &Connection,
    bead_id: &str,
    event: &EventRecord<'_>,
    now: DateTime<Utc>,
) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO bead_events
            (bead_id, agent_id, event_type, old_value, new_value, metadata, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            bead_id,
            event.agent_id,
            event.event_type,
            event.old_value,
            event.new_value,
            event
                .metadata
                .clone()
                .unwrap_or_else(|| Value::Object(serde_json::Map::new())),
            now,
        ],
    )?;
    Ok(())
}

/// Apply a status change inside an open transaction.
///
/// Returns `None` when the bead already had `status`.
pub(super) fn set_status_in(
    conn: &Connection,
    id: &str,
    status: BeadStatus,
    agent_id: Option<&str>,
    now: DateTime<Utc>,
) -> Result<Option<Bead>> {
    let bead = require_bead_in(conn, id)?;
    if bead.status == status {
        return Ok(None);
    }
    if bead.status.is_terminal() {
        return Err(TownError::Conflict(format!(
            "bead {id} is {} and cannot move to {status}",
            bead.status
        )));
    }

    let closed_at = status.is_terminal().then_some(now);
    conn.execute(
        "UPDATE beads SET status = ?2, updated_at = ?3, closed_at = ?4 WHERE id = ?1",
        params![id, status, now, closed_at],
    )?;
    record_event_in(
        conn,
        id,
        &EventRecord {
            agent_id,
            event_type: "status_changed",
            old_value: Some(bead.status.as_str()),
            new_value: Some(status.as_str()),
            metadata: None,
        },
        now,
    )?;
    Ok(Some(require_bead_in(conn, id)?))
}

impl TownStore {
    pub fn create_bead(&mut self, new: &NewBead, now: DateTime<Utc>) -> Result<Bead> {
        if new.title.trim().is_empty() {
            return Err(TownError::Invalid("bead title must not be empty".into()));
        }
        let metadata = match &new.metadata {
            None => Value::Object(serde_json::Map::new()),
            Some(value @ Value::Object(_)) => value.clone(),
            Some(_) => {
                return Err(TownError::Invalid(
                    "bead metadata must be a JSON object".into(),
                ));
            }
        };

        let id = new_id();
        let tx = self.conn.transaction()?;
        tx.execute(
            "INSERT INTO beads
                (id, type, status, title, body, rig_id, assignee_id, priority, labels,
                 metadata, created_by, created_at, updated_at, closed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, NULL, ?7, ?8, ?9, ?10, ?11, ?11, NULL)",
            params![
                id,
                new.bead_type,
                BeadStatus::Open,
                new.title,
                new.body,
                new.rig_id,
                new.priority,
                serde_json::to_string(&new.labels)?,
                metadata,
                new.created_by,
                now,
            ],
        )?;
        record_event_in(
            &tx,
            &id,
            &EventRecord {
                agent_id: None,
                event_type: "created",
                new_value: Some(BeadStatus::Open.as_str()),
                ..EventRecord::default()
            },
            now,
        )?;
        let bead = require_bead_in(&tx, &id)?;
        tx.commit()?;
        Ok(bead)
    }

    pub fn get_bead(&self, id: &str) -> Result<Option<Bead>> {
        Ok(get_bead_in(&self.conn, id)?)
    }

    pub fn list_beads(&self, filter: &BeadFilter) -> Result<Vec<Bead>> {
        let mut clauses = Vec::new();
        let mut args: Vec<String> = Vec::new();
        if let Some(status) = filter.status {
            args.push(status.as_str().to_string());
            clauses.push(format!("status = ?{}", args.len()));
        }
        if let Some(bead_type) = filter.bead_type {
            args.push(bead_type.as_str().to_string());
            clauses.push(format!("type = ?{}", args.len()));
        }
        if let Some(rig_id) = &filter.rig_id {
            args.push(rig_id.clone());
            clauses.push(format!("rig_id = ?{}", args.len()));
        }
        if let Some(assignee_id) = &filter.assignee_id {
            args.push(assignee_id.clone());
            clauses.push(format!("assignee_id = ?{}", args.len()));
        }

        let mut sql = format!("SELECT {BEAD_COLUMNS} FROM beads");
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push(' ');
        sql.push_str(BEAD_ORDER);
        if let Some(limit) = filter.limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }

        let mut stmt = self.conn.prepare(&sql)?;
        let beads = stmt
            .query_map(params_from_iter(args.iter()), bead_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(beads)
    }

    /// Open task beads visible from a rig. `None` means tenant-wide beads only.
    pub fn open_beads_for_rig(&self, rig_id: Option<&str>, limit: usize) -> Result<Vec<Bead>> {
        let sql = format!(
            "SELECT {BEAD_COLUMNS} FROM beads
             WHERE status = 'open' AND type = 'task' AND rig_id IS ?1
             {BEAD_ORDER} LIMIT ?2"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let beads = stmt
            .query_map(params![rig_id, limit], bead_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(beads)
    }

    /// Returns the bead after the change, unchanged when already in `status`.
    pub fn update_bead_status(
        &mut self,
        id: &str,
        status: BeadStatus,
        agent_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Bead> {
        let tx = self.conn.transaction()?;
        let bead = match set_status_in(&tx, id, status, agent_id, now)? {
            Some(bead) => bead,
            None => require_bead_in(&tx, id)?,
        };
        tx.commit()?;
        Ok(bead)
    }

    /// Deletes a bead along with its events, review entries and any hooks on it.
    pub fn delete_bead(&mut self, id: &str) -> Result<()> {
        let tx = self.conn.transaction()?;
        require_bead_in(&tx, id)?;
        let in_active_convoy: bool = tx.query_row(
            "SELECT EXISTS(
                SELECT 1 FROM convoy_beads cb JOIN convoys c ON c.id = cb.convoy_id
                WHERE cb.bead_id = ?1 AND c.status = 'active')",
            params![id],
            |row| row.get(0),
        )?;
        if in_active_convoy {
            return Err(TownError::Conflict(format!(
                "bead {id} belongs to an active convoy"
            )));
        }

        tx.execute(
            "UPDATE agents SET current_hook_bead_id = NULL, dispatch_attempts = 0
             WHERE current_hook_bead_id = ?1",
            params![id],
        )?;
        tx.execute("DELETE FROM bead_events WHERE bead_id = ?1", params![id])?;
        tx.execute("DELETE FROM review_queue WHERE bead_id = ?1", params![id])?;
        tx.execute("DELETE FROM beads WHERE id = ?1", params![id])?;
        tx.commit()?;
        Ok(())
    }

    pub fn bead_events(&self, bead_id: &str) -> Result<Vec<BeadEvent>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, bead_id, agent_id, event_type, old_value, new_value, metadata, created_at
             FROM bead_events WHERE bead_id = ?1 ORDER BY id",
        )?;
        let events = stmt
            .query_map(params![bead_id], event_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(events)
    }

    /// Tenant-wide event feed, oldest first.
    pub fn bead_events_after(&self, after_id: i64, limit: usize) -> Result<Vec<BeadEvent>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, bead_id, agent_id, event_type, old_value, new_value, metadata, created_at
             FROM bead_events WHERE id > ?1 ORDER BY id LIMIT ?2",
        )?;
        let events = stmt
            .query_map(params![after_id, limit], event_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BeadType, Priority};

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_770_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn create_records_event_and_defaults() {
        let mut store = TownStore::in_memory().unwrap();
        let bead = store
            .create_bead(&NewBead::task("fix bug").body("details"), at(0))
            .unwrap();
        assert_eq!(bead.status, BeadStatus::Open);
        assert_eq!(bead.bead_type, BeadType::Task);
        assert_eq!(bead.priority, Priority::Medium);
        assert_eq!(bead.metadata, serde_json::json!({}));

        let events = store.bead_events(&bead.id).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, "created");
    }

    #[test]
    fn rejects_blank_title_and_non_object_metadata() {
        let mut store = TownStore::in_memory().unwrap();
        let err = store.create_bead(&NewBead::task("  "), at(0)).unwrap_err();
        assert!(matches!(err, TownError::Invalid(_)));

        let mut bad = NewBead::task("x");
        bad.metadata = Some(serde_json::json!([1, 2]));
        assert!(matches!(
            store.create_bead(&bad, at(0)).unwrap_err(),
            TownError::Invalid(_)
        ));
        assert!(store.list_beads(&BeadFilter::default()).unwrap().is_empty());
    }

    #[test]
    fn terminal_status_is_sticky() {
        let mut store = TownStore::in_memory().unwrap();
        let bead = store.create_bead(&NewBead::task("x"), at(0)).unwrap();
        let closed = store
            .update_bead_status(&bead.id, BeadStatus::Closed, None, at(1))
            .unwrap();
        assert_eq!(closed.closed_at, Some(at(1)));

        // same status again is a no-op
        let again = store
            .update_bead_status(&bead.id, BeadStatus::Closed, None, at(2))
            .unwrap();
        assert_eq!(again.closed_at, Some(at(1)));

        let err = store
            .update_bead_status(&bead.id, BeadStatus::Open, None, at(3))
            .unwrap_err();
        assert!(matches!(err, TownError::Conflict(_)));
        assert_eq!(store.bead_events(&bead.id).unwrap().len(), 2);
    }

    #[test]
    fn update_missing_bead_is_not_found() {
        let mut store = TownStore::in_memory().unwrap();
        let err = store
            .update_bead_status("nope", BeadStatus::Closed, None, at(0))
            .unwrap_err();
        assert!(matches!(err, TownError::NotFound { .. }));
        assert_eq!(store.get_bead("nope").unwrap(), None);
    }

    #[test]
    fn list_orders_by_priority_and_filters() {
        let mut store = TownStore::in_memory().unwrap();
        store.create_bead(&NewBead::task("low").rig("r1"), at(0)).unwrap();
        let mut urgent = NewBead::task("urgent").rig("r1");
        urgent.priority = Priority::Critical;
        store.create_bead(&urgent, at(1)).unwrap();
        store.create_bead(&NewBead::task("elsewhere").rig("r2"), at(2)).unwrap();

        let r1 = store
            .list_beads(&BeadFilter {
                rig_id: Some("r1".into()),
                ..BeadFilter::default()
            })
            .unwrap();
        let titles: Vec<_> = r1.iter().map(|b| b.title.as_str()).collect();
        assert_eq!(titles, ["urgent", "low"]);

        let limited = store
            .list_beads(&BeadFilter {
                limit: Some(1),
                ..BeadFilter::default()
            })
            .unwrap();
        assert_eq!(limited.len(), 1);
    }

    #[test]
    fn events_after_pages_through_feed() {
        let mut store = TownStore::in_memory().unwrap();
        let a = store.create_bead(&NewBead::task("a"), at(0)).unwrap();
        store.create_bead(&NewBead::task("b"), at(1)).unwrap();
        store
            .update_bead_status(&a.id, BeadStatus::InProgress, None, at(2))
            .unwrap();

        let first = store.bead_events_after(0, 2).unwrap();
        assert_eq!(first.len(), 2);
        let rest = store.bead_events_after(first[1].id, 10).unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].event_type, "status_changed");
    }

    #[test]
    fn delete_removes_events() {
        let mut store = TownStore::in_memory().unwrap();
        let bead = store.create_bead(&NewBead::task("x"), at(0)).unwrap();
        store.delete_bead(&bead.id).unwrap();
        assert_eq!(store.get_bead(&bead.id).unwrap(), None);
        assert!(store.bead_events(&bead.id).unwrap().is_empty());
        assert!(matches!(
            store.delete_bead(&bead.id).unwrap_err(),
            TownError::NotFound { .. }
        ));
    }
}
