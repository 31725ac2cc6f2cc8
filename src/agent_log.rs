//! Per-agent activity logs.
//!
//! Each agent gets its own small SQLite file so a chatty agent never contends
//! with the town store. Logs are bounded: once an agent has more than
//! `max_events` rows, the oldest are dropped.

use std::collections::HashMap;
use std::ops::Deref;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, params};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Result, TownError};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentEvent {
    pub id: i64,
    pub event_type: String,
    pub data: Value,
    pub created_at: DateTime<Utc>,
}

const LOG_SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS events (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        event_type TEXT NOT NULL,
        data TEXT NOT NULL,
        created_at TEXT NOT NULL
    );
";

enum Backing {
    /// One `<agent_id>.db` per agent, opened for each call.
    Disk(PathBuf),
    /// The connection is the log, so it stays open until destroyed.
    Memory(HashMap<String, Connection>),
}

enum LogConn<'a> {
    Opened(Connection),
    Kept(&'a Connection),
}

impl Deref for LogConn<'_> {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        match self {
            Self::Opened(conn) => conn,
            Self::Kept(conn) => conn,
        }
    }
}

/// On disk no handle outlives the call that needed it, so a town with many
/// past agents holds no open files between ticks.
pub struct AgentLogs {
    backing: Backing,
    max_events: usize,
}

impl AgentLogs {
    pub fn on_disk(dir: impl Into<PathBuf>, max_events: usize) -> Self {
        Self {
            backing: Backing::Disk(dir.into()),
            max_events,
        }
    }

    pub fn in_memory(max_events: usize) -> Self {
        Self {
            backing: Backing::Memory(HashMap::new()),
            max_events,
        }
    }

    /// Opens the agent's log. Without `create`, a log never written yields `None`.
    fn connection(&mut self, agent_id: &str, create: bool) -> Result<Option<LogConn<'_>>> {
        validate_agent_id(agent_id)?;
        match &mut self.backing {
            Backing::Disk(dir) => {
                let path = dir.join(format!("{agent_id}.db"));
                if !create && !path.exists() {
                    return Ok(None);
                }
                std::fs::create_dir_all(dir.as_path())?;
                let conn = Connection::open(path)?;
                conn.execute_batch(LOG_SCHEMA)?;
                Ok(Some(LogConn::Opened(conn)))
            }
            Backing::Memory(open) => {
                if !open.contains_key(agent_id) {
                    if !create {
                        return Ok(None);
                    }
                    let conn = Connection::open_in_memory()?;
                    conn.execute_batch(LOG_SCHEMA)?;
                    open.insert(agent_id.to_string(), conn);
                }
                Ok(open.get(agent_id).map(LogConn::Kept))
            }
        }
    }

    pub fn append(
        &mut self,
        agent_id: &str,
        event_type: &str,
        data: &Value,
        now: DateTime<Utc>,
    ) -> Result<i64> {
        let max_events = i64::try_from(self.max_events).unwrap_or(i64::MAX);
        let conn = self
            .connection(agent_id, true)?
            .ok_or_else(|| TownError::not_found("agent log", agent_id))?;
        conn.execute(
            "INSERT INTO events (event_type, data, created_at) VALUES (?1, ?2, ?3)",
            params![event_type, serde_json::to_string(data)?, now],
        )?;
        let id = conn.last_insert_rowid();
        conn.execute("DELETE FROM events WHERE id <= ?1", params![id - max_events])?;
        Ok(id)
    }

    /// Events with id greater than `after_id`, oldest first.
    pub fn events_after(
        &mut self,
        agent_id: &str,
        after_id: i64,
        limit: usize,
    ) -> Result<Vec<AgentEvent>> {
        let Some(conn) = self.connection(agent_id, false)? else {
            return Ok(Vec::new());
        };
        let mut stmt = conn.prepare(
            "SELECT id, event_type, data, created_at FROM events
             WHERE id > ?1 ORDER BY id LIMIT ?2",
        )?;
        let rows = stmt.query_map(
            params![after_id, limit],
            |row| -> rusqlite::Result<(i64, String, String, DateTime<Utc>)> {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
            },
        )?;
        let mut events = Vec::new();
        for row in rows {
            let (id, event_type, data, created_at) = row?;
            events.push(AgentEvent {
                id,
                event_type,
                data: serde_json::from_str(&data)?,
                created_at,
            });
        }
        Ok(events)
    }

    /// Deletes the agent's log.
    pub fn destroy(&mut self, agent_id: &str) -> Result<()> {
        validate_agent_id(agent_id)?;
        match &mut self.backing {
            Backing::Memory(open) => {
                open.remove(agent_id);
            }
            Backing::Disk(dir) => {
                let path = dir.join(format!("{agent_id}.db"));
                match std::fs::remove_file(&path) {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
            }
        }
        Ok(())
    }

    /// Connections held open between calls.
    #[cfg(test)]
    fn open_connections(&self) -> usize {
        match &self.backing {
            Backing::Disk(_) => 0,
            Backing::Memory(open) => open.len(),
        }
    }
}

fn validate_agent_id(agent_id: &str) -> Result<()> {
    let ok = !agent_id.is_empty()
        && agent_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if ok {
        Ok(())
    } else {
        Err(TownError::Invalid(format!("invalid agent id {agent_id:?}")))
    }
}
