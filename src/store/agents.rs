use chrono::{DateTime, Utc};
use rusqlite::{Connection, ErrorCode, OptionalExtension, Row, params, params_from_iter};
use serde_json::Value;

use super::beads::{EventRecord, record_event_in, require_bead_in};
use super::{TownStore, json_column, new_id};
use crate::error::{Result, TownError};
use crate::types::{Agent, AgentFilter, AgentRole, AgentStatus, Bead, BeadStatus};

const AGENT_COLUMNS: &str = "id, role, name, identity, rig_id, status, current_hook_bead_id, \
     dispatch_attempts, checkpoint, last_activity_at, stale_nudged_at, created_at";

fn agent_from_row(row: &Row<'_>) -> rusqlite::Result<Agent> {
    let checkpoint: Option<String> = row.get(8)?;
    Ok(Agent {
        id: row.get(0)?,
        role: row.get(1)?,
        name: row.get(2)?,
        identity: row.get(3)?,
        rig_id: row.get(4)?,
        status: row.get(5)?,
        current_hook_bead_id: row.get(6)?,
        dispatch_attempts: row.get(7)?,
        checkpoint: checkpoint.map(|raw| json_column(8, &raw)).transpose()?,
        last_activity_at: row.get(9)?,
        stale_nudged_at: row.get(10)?,
        created_at: row.get(11)?,
    })
}

pub(super) fn get_agent_in(conn: &Connection, id: &str) -> rusqlite::Result<Option<Agent>> {
    conn.query_row(
        &format!("SELECT {AGENT_COLUMNS} FROM agents WHERE id = ?1"),
        params![id],
        agent_from_row,
    )
    .optional()
}

pub(super) fn require_agent_in(conn: &Connection, id: &str) -> Result<Agent> {
    get_agent_in(conn, id)?.ok_or_else(|| TownError::not_found("agent", id))
}

/// Result of counting a dispatch attempt before the start call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchAttempt {
    /// Attempt number, within the limit: go ahead and start.
    Proceed(u32),
    /// The limit was exceeded; the bead was failed and the agent unhooked.
    Tripped,
}

/// Fields for a new agent row.
#[derive(Debug)]
pub struct NewAgent<'a> {
    pub role: AgentRole,
    pub name: &'a str,
    pub identity: &'a str,
    pub rig_id: Option<&'a str>,
}

impl TownStore {
    pub fn insert_agent(&self, new: &NewAgent<'_>, now: DateTime<Utc>) -> Result<Agent> {
        let id = new_id();
        let inserted = self.conn.execute(
            "INSERT INTO agents
                (id, role, name, identity, rig_id, status, current_hook_bead_id,
                 dispatch_attempts, checkpoint, last_activity_at, stale_nudged_at, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, NULL, 0, NULL, NULL, NULL, ?7)",
            params![
                id,
                new.role,
                new.name,
                new.identity,
                new.rig_id,
                AgentStatus::Idle,
                now
            ],
        );
        match inserted {
            Ok(_) => {}
            Err(rusqlite::Error::SqliteFailure(e, _)) if e.code == ErrorCode::ConstraintViolation => {
                return Err(TownError::Conflict(format!(
                    "agent identity {} already registered",
                    new.identity
                )));
            }
            Err(e) => return Err(e.into()),
        }
        require_agent_in(&self.conn, &id)
    }

    pub fn get_agent(&self, id: &str) -> Result<Option<Agent>> {
        Ok(get_agent_in(&self.conn, id)?)
    }

    pub fn get_agent_by_identity(&self, identity: &str) -> Result<Option<Agent>> {
        Ok(self
            .conn
            .query_row(
                &format!("SELECT {AGENT_COLUMNS} FROM agents WHERE identity = ?1"),
                params![identity],
                agent_from_row,
            )
            .optional()?)
    }

    pub fn list_agents(&self, filter: &AgentFilter) -> Result<Vec<Agent>> {
        let mut clauses = Vec::new();
        let mut args: Vec<String> = Vec::new();
        if let Some(role) = filter.role {
            args.push(role.as_str().to_string());
            clauses.push(format!("role = ?{}", args.len()));
        }
        if let Some(status) = filter.status {
            args.push(status.as_str().to_string());
            clauses.push(format!("status = ?{}", args.len()));
        }
        if let Some(rig_id) = &filter.rig_id {
            args.push(rig_id.clone());
            clauses.push(format!("rig_id = ?{}", args.len()));
        }
        let mut sql = format!("SELECT {AGENT_COLUMNS} FROM agents");
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(" ORDER BY created_at, id");

        let mut stmt = self.conn.prepare(&sql)?;
        let agents = stmt
            .query_map(params_from_iter(args.iter()), agent_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(agents)
    }

    /// Agents that hold a hook but are idle: the dispatch candidates.
    pub fn dispatchable_agents(&self) -> Result<Vec<Agent>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {AGENT_COLUMNS} FROM agents
             WHERE status = 'idle' AND current_hook_bead_id IS NOT NULL
             ORDER BY created_at, id"
        ))?;
        let agents = stmt
            .query_map([], agent_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(agents)
    }

    pub fn agent_hooked_to(&self, bead_id: &str) -> Result<Option<Agent>> {
        Ok(self
            .conn
            .query_row(
                &format!("SELECT {AGENT_COLUMNS} FROM agents WHERE current_hook_bead_id = ?1"),
                params![bead_id],
                agent_from_row,
            )
            .optional()?)
    }

    pub fn update_agent_status(
        &self,
        id: &str,
        status: AgentStatus,
        now: DateTime<Utc>,
    ) -> Result<Agent> {
        let changed = self.conn.execute(
            "UPDATE agents SET status = ?2, last_activity_at = ?3 WHERE id = ?1",
            params![id, status, now],
        )?;
        if changed == 0 {
            return Err(TownError::not_found("agent", id));
        }
        require_agent_in(&self.conn, id)
    }

    /// Deletes the agent row. Its beads lose their assignee and its mail goes with it.
    pub fn delete_agent(&mut self, id: &str, now: DateTime<Utc>) -> Result<Agent> {
        let tx = self.conn.transaction()?;
        let agent = require_agent_in(&tx, id)?;
        let assigned: Vec<String> = tx
            .prepare("SELECT id FROM beads WHERE assignee_id = ?1")?
            .query_map(params![id], |row| row.get(0))?
            .collect::<rusqlite::Result<_>>()?;
        for bead_id in &assigned {
            record_event_in(
                &tx,
                bead_id,
                &EventRecord {
                    agent_id: Some(id),
                    event_type: "unassigned",
                    old_value: Some(id),
                    new_value: None,
                    metadata: None,
                },
                now,
            )?;
        }
        tx.execute("DELETE FROM agents WHERE id = ?1", params![id])?;
        tx.commit()?;
        Ok(agent)
    }

    /// Hook `bead_id` onto the agent.
    ///
    /// Re-hooking the same bead is a no-op. Hooking a second bead, or a bead
    /// already held by another agent, is a conflict.
    pub fn hook_bead(&mut self, agent_id: &str, bead_id: &str, now: DateTime<Utc>) -> Result<Agent> {
        let tx = self.conn.transaction()?;
        let agent = require_agent_in(&tx, agent_id)?;
        match agent.current_hook_bead_id.as_deref() {
            Some(current) if current == bead_id => return Ok(agent),
            Some(current) => {
                return Err(TownError::Conflict(format!(
                    "agent {agent_id} is already hooked to bead {current}"
                )));
            }
            None => {}
        }

        let bead = require_bead_in(&tx, bead_id)?;
        if bead.status.is_terminal() {
            return Err(TownError::Conflict(format!(
                "bead {bead_id} is {} and cannot be hooked",
                bead.status
            )));
        }
        let holder: Option<String> = tx
            .query_row(
                "SELECT id FROM agents WHERE current_hook_bead_id = ?1",
                params![bead_id],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(holder) = holder {
            return Err(TownError::Conflict(format!(
                "bead {bead_id} is already hooked by agent {holder}"
            )));
        }

        tx.execute(
            "UPDATE agents SET current_hook_bead_id = ?2, dispatch_attempts = 0 WHERE id = ?1",
            params![agent_id, bead_id],
        )?;
        tx.execute(
            "UPDATE beads SET assignee_id = ?2, status = ?3, updated_at = ?4 WHERE id = ?1",
            params![bead_id, agent_id, BeadStatus::InProgress, now],
        )?;
        record_event_in(
            &tx,
            bead_id,
            &EventRecord {
                agent_id: Some(agent_id),
                event_type: "hooked",
                old_value: Some(bead.status.as_str()),
                new_value: Some(BeadStatus::InProgress.as_str()),
                metadata: None,
            },
            now,
        )?;
        let agent = require_agent_in(&tx, agent_id)?;
        tx.commit()?;
        Ok(agent)
    }

    /// Clears the agent's hook. Returns the bead id that was hooked, if any.
    pub fn unhook_bead(&mut self, agent_id: &str, now: DateTime<Utc>) -> Result<Option<String>> {
        let tx = self.conn.transaction()?;
        let agent = require_agent_in(&tx, agent_id)?;
        let Some(bead_id) = agent.current_hook_bead_id else {
            return Ok(None);
        };
        tx.execute(
            "UPDATE agents SET current_hook_bead_id = NULL, dispatch_attempts = 0 WHERE id = ?1",
            params![agent_id],
        )?;
        if get_bead_exists(&tx, &bead_id)? {
            record_event_in(
                &tx,
                &bead_id,
                &EventRecord {
                    agent_id: Some(agent_id),
                    event_type: "unhooked",
                    ..EventRecord::default()
                },
                now,
            )?;
        }
        tx.commit()?;
        Ok(Some(bead_id))
    }

    pub fn get_hooked_bead(&self, agent_id: &str) -> Result<Option<Bead>> {
        let Some(agent) = get_agent_in(&self.conn, agent_id)? else {
            return Ok(None);
        };
        match agent.current_hook_bead_id {
            Some(bead_id) => self.get_bead(&bead_id),
            None => Ok(None),
        }
    }

    pub fn write_checkpoint(&self, agent_id: &str, checkpoint: &Value) -> Result<()> {
        let changed = self.conn.execute(
            "UPDATE agents SET checkpoint = ?2 WHERE id = ?1",
            params![agent_id, serde_json::to_string(checkpoint)?],
        )?;
        if changed == 0 {
            return Err(TownError::not_found("agent", agent_id));
        }
        Ok(())
    }

    pub fn read_checkpoint(&self, agent_id: &str) -> Result<Option<Value>> {
        Ok(get_agent_in(&self.conn, agent_id)?.and_then(|agent| agent.checkpoint))
    }

    /// Stamps activity and answers any outstanding liveness check.
    pub fn touch_heartbeat(&self, agent_id: &str, now: DateTime<Utc>) -> Result<()> {
        let changed = self.conn.execute(
            "UPDATE agents SET last_activity_at = ?2, stale_nudged_at = NULL WHERE id = ?1",
            params![agent_id, now],
        )?;
        if changed == 0 {
            return Err(TownError::not_found("agent", agent_id));
        }
        Ok(())
    }

    pub fn mark_stale_nudged(&self, agent_id: &str, now: DateTime<Utc>) -> Result<()> {
        self.conn.execute(
            "UPDATE agents SET stale_nudged_at = ?2 WHERE id = ?1",
            params![agent_id, now],
        )?;
        Ok(())
    }

    /// Successful start: working, counters reset, fresh activity.
    pub fn record_dispatch_success(&self, agent_id: &str, now: DateTime<Utc>) -> Result<()> {
        self.conn.execute(
            "UPDATE agents
             SET status = ?2, dispatch_attempts = 0, last_activity_at = ?3, stale_nudged_at = NULL
             WHERE id = ?1",
            params![agent_id, AgentStatus::Working, now],
        )?;
        Ok(())
    }

    /// Counts a dispatch attempt and trips the breaker once attempts exceed
    /// `max_attempts`. A successful start resets the count.
    pub fn claim_dispatch_attempt(
        &mut self,
        agent_id: &str,
        max_attempts: u32,
        now: DateTime<Utc>,
    ) -> Result<DispatchAttempt> {
        let tx = self.conn.transaction()?;
        let agent = require_agent_in(&tx, agent_id)?;
        let attempts = agent.dispatch_attempts + 1;
        if attempts <= max_attempts {
            tx.execute(
                "UPDATE agents SET dispatch_attempts = ?2 WHERE id = ?1",
                params![agent_id, attempts],
            )?;
            tx.commit()?;
            return Ok(DispatchAttempt::Proceed(attempts));
        }

        if let Some(bead_id) = agent.current_hook_bead_id.as_deref() {
            let open = super::beads::get_bead_in(&tx, bead_id)?
                .is_some_and(|bead| !bead.status.is_terminal());
            if open {
                super::beads::set_status_in(&tx, bead_id, BeadStatus::Failed, Some(agent_id), now)?;
                record_event_in(
                    &tx,
                    bead_id,
                    &EventRecord {
                        agent_id: Some(agent_id),
                        event_type: "dispatch_failed",
                        new_value: Some("circuit_open"),
                        metadata: Some(serde_json::json!({ "attempts": attempts })),
                        ..EventRecord::default()
                    },
                    now,
                )?;
            }
        }
        tx.execute(
            "UPDATE agents
             SET current_hook_bead_id = NULL, dispatch_attempts = 0, status = ?2
             WHERE id = ?1",
            params![agent_id, AgentStatus::Idle],
        )?;
        tx.commit()?;
        Ok(DispatchAttempt::Tripped)
    }

    /// Names already taken by polecats anywhere in the town.
    pub fn polecat_names(&self) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT name FROM agents WHERE role = 'polecat' ORDER BY name")?;
        let names = stmt
            .query_map([], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(names)
    }

    /// Whether any agent keeps the scheduler busy.
    pub fn has_active_agents(&self) -> Result<bool> {
        Ok(self.conn.query_row(
            "SELECT EXISTS(
                SELECT 1 FROM agents
                WHERE status IN ('working', 'blocked')
                   OR (status = 'idle' AND current_hook_bead_id IS NOT NULL))",
            [],
            |row| row.get(0),
        )?)
    }
}

fn get_bead_exists(conn: &Connection, bead_id: &str) -> rusqlite::Result<bool> {
    conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM beads WHERE id = ?1)",
        params![bead_id],
        |row| row.get(0),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::NewBead;

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_770_000_000 + secs, 0).unwrap()
    }

    fn polecat(store: &TownStore, name: &str) -> Agent {
        store
            .insert_agent(
                &NewAgent {
                    role: AgentRole::Polecat,
                    name,
                    identity: &format!("{name}-polecat@t"),
                    rig_id: Some("r1"),
                },
                at(0),
            )
            .unwrap()
    }

    #[test]
    fn duplicate_identity_conflicts() {
        let store = TownStore::in_memory().unwrap();
        polecat(&store, "nux");
        let err = store
            .insert_agent(
                &NewAgent {
                    role: AgentRole::Polecat,
                    name: "nux",
                    identity: "nux-polecat@t",
                    rig_id: None,
                },
                at(1),
            )
            .unwrap_err();
        assert!(matches!(err, TownError::Conflict(_)));
    }

    #[test]
    fn hook_sets_bead_in_progress() {
        let mut store = TownStore::in_memory().unwrap();
        let agent = polecat(&store, "nux");
        let bead = store.create_bead(&NewBead::task("x"), at(0)).unwrap();

        let hooked = store.hook_bead(&agent.id, &bead.id, at(1)).unwrap();
        assert_eq!(hooked.current_hook_bead_id.as_deref(), Some(bead.id.as_str()));
        let bead = store.get_bead(&bead.id).unwrap().unwrap();
        assert_eq!(bead.status, BeadStatus::InProgress);
        assert_eq!(bead.assignee_id.as_deref(), Some(agent.id.as_str()));

        // same bead again is a no-op
        store.hook_bead(&agent.id, &bead.id, at(2)).unwrap();
    }

    #[test]
    fn second_hook_conflicts_without_change() {
        let mut store = TownStore::in_memory().unwrap();
        let agent = polecat(&store, "nux");
        let first = store.create_bead(&NewBead::task("a"), at(0)).unwrap();
        let second = store.create_bead(&NewBead::task("b"), at(0)).unwrap();
        store.hook_bead(&agent.id, &first.id, at(1)).unwrap();

        let err = store.hook_bead(&agent.id, &second.id, at(2)).unwrap_err();
        match err {
            TownError::Conflict(msg) => assert!(msg.contains(&first.id)),
            other => panic!("expected conflict, got {other:?}"),
        }
        let agent = store.get_agent(&agent.id).unwrap().unwrap();
        assert_eq!(agent.current_hook_bead_id.as_deref(), Some(first.id.as_str()));
        let second = store.get_bead(&second.id).unwrap().unwrap();
        assert_eq!(second.status, BeadStatus::Open);
    }

    #[test]
    fn bead_can_only_be_held_once() {
        let mut store = TownStore::in_memory().unwrap();
        let a = polecat(&store, "nux");
        let b = polecat(&store, "slit");
        let bead = store.create_bead(&NewBead::task("x"), at(0)).unwrap();
        store.hook_bead(&a.id, &bead.id, at(1)).unwrap();
        assert!(matches!(
            store.hook_bead(&b.id, &bead.id, at(2)).unwrap_err(),
            TownError::Conflict(_)
        ));
    }

    #[test]
    fn breaker_trips_after_limit() {
        let mut store = TownStore::in_memory().unwrap();
        let agent = polecat(&store, "nux");
        let bead = store.create_bead(&NewBead::task("x"), at(0)).unwrap();
        store.hook_bead(&agent.id, &bead.id, at(1)).unwrap();

        for n in 1..=3 {
            assert_eq!(
                store.claim_dispatch_attempt(&agent.id, 3, at(2)).unwrap(),
                DispatchAttempt::Proceed(n)
            );
        }
        assert_eq!(
            store.claim_dispatch_attempt(&agent.id, 3, at(3)).unwrap(),
            DispatchAttempt::Tripped
        );
        let agent = store.get_agent(&agent.id).unwrap().unwrap();
        assert_eq!(agent.current_hook_bead_id, None);
        assert_eq!(agent.dispatch_attempts, 0);
        assert_eq!(agent.status, AgentStatus::Idle);
        assert_eq!(
            store.get_bead(&bead.id).unwrap().unwrap().status,
            BeadStatus::Failed
        );
    }

    #[test]
    fn delete_agent_unassigns_beads() {
        let mut store = TownStore::in_memory().unwrap();
        let agent = polecat(&store, "nux");
        let bead = store.create_bead(&NewBead::task("x"), at(0)).unwrap();
        store.hook_bead(&agent.id, &bead.id, at(1)).unwrap();
        store.delete_agent(&agent.id, at(2)).unwrap();

        let bead = store.get_bead(&bead.id).unwrap().unwrap();
        assert_eq!(bead.assignee_id, None);
        assert_eq!(store.get_agent(&agent.id).unwrap(), None);
        let events = store.bead_events(&bead.id).unwrap();
        assert_eq!(events.last().unwrap().event_type, "unassigned");
    }

    #[test]
    fn heartbeat_clears_nudge() {
        let store = TownStore::in_memory().unwrap();
        let agent = polecat(&store, "nux");
        store.mark_stale_nudged(&agent.id, at(5)).unwrap();
        store.touch_heartbeat(&agent.id, at(6)).unwrap();
        let agent = store.get_agent(&agent.id).unwrap().unwrap();
        assert_eq!(agent.stale_nudged_at, None);
        assert_eq!(agent.last_activity_at, Some(at(6)));
    }

    #[test]
    fn checkpoint_roundtrip() {
        let store = TownStore::in_memory().unwrap();
        let agent = polecat(&store, "nux");
        assert_eq!(store.read_checkpoint(&agent.id).unwrap(), None);
        let cp = serde_json::json!({"step": 3, "notes": "halfway"});
        store.write_checkpoint(&agent.id, &cp).unwrap();
        assert_eq!(store.read_checkpoint(&agent.id).unwrap(), Some(cp));
    }
}
