//! Per-town relational store.
//!
//! One SQLite database per town holds every table the orchestrator owns.
//! Methods take explicit timestamps; the clock lives with the caller.

mod agents;
mod beads;
mod convoys;
mod escalations;
mod mail;
mod review_queue;
mod rigs;

use std::path::Path;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::config::TownConfig;
use crate::error::Result;
use crate::types::PrimeContext;

pub use agents::{DispatchAttempt, NewAgent};

const SCHEMA_VERSION: u32 = 1;

const SCHEMA_V1: &str = "
    CREATE TABLE IF NOT EXISTS kv (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS rigs (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL UNIQUE,
        git_url TEXT NOT NULL,
        default_branch TEXT NOT NULL,
        created_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS rig_configs (
        rig_id TEXT PRIMARY KEY,
        config TEXT NOT NULL,
        FOREIGN KEY(rig_id) REFERENCES rigs(id) ON DELETE CASCADE
    );

    CREATE TABLE IF NOT EXISTS agents (
        id TEXT PRIMARY KEY,
        role TEXT NOT NULL,
        name TEXT NOT NULL,
        identity TEXT NOT NULL UNIQUE,
        rig_id TEXT,
        status TEXT NOT NULL,
        current_hook_bead_id TEXT,
        dispatch_attempts INTEGER NOT NULL DEFAULT 0,
        checkpoint TEXT,
        last_activity_at TEXT,
        stale_nudged_at TEXT,
        created_at TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_agents_role ON agents(role);
    CREATE INDEX IF NOT EXISTS idx_agents_hook ON agents(current_hook_bead_id);

    CREATE TABLE IF NOT EXISTS beads (
        id TEXT PRIMARY KEY,
        type TEXT NOT NULL,
        status TEXT NOT NULL,
        title TEXT NOT NULL,
        body TEXT,
        rig_id TEXT,
        assignee_id TEXT,
        priority TEXT NOT NULL,
        labels TEXT NOT NULL DEFAULT '[]',
        metadata TEXT NOT NULL DEFAULT '{}',
        created_by TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        closed_at TEXT,
        FOREIGN KEY(assignee_id) REFERENCES agents(id) ON DELETE SET NULL
    );
    CREATE INDEX IF NOT EXISTS idx_beads_status ON beads(status);
    CREATE INDEX IF NOT EXISTS idx_beads_rig ON beads(rig_id);

    CREATE TABLE IF NOT EXISTS bead_events (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        bead_id TEXT NOT NULL,
        agent_id TEXT,
        event_type TEXT NOT NULL,
        old_value TEXT,
        new_value TEXT,
        metadata TEXT NOT NULL DEFAULT '{}',
        created_at TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_bead_events_bead ON bead_events(bead_id);

    CREATE TABLE IF NOT EXISTS mail (
        id TEXT PRIMARY KEY,
        from_identity TEXT NOT NULL,
        to_agent_id TEXT NOT NULL,
        subject TEXT NOT NULL,
        body TEXT NOT NULL,
        delivered INTEGER NOT NULL DEFAULT 0,
        created_at TEXT NOT NULL,
        delivered_at TEXT,
        FOREIGN KEY(to_agent_id) REFERENCES agents(id) ON DELETE CASCADE
    );
    CREATE INDEX IF NOT EXISTS idx_mail_inbox ON mail(to_agent_id, delivered);

    CREATE TABLE IF NOT EXISTS review_queue (
        id TEXT PRIMARY KEY,
        agent_id TEXT NOT NULL,
        bead_id TEXT NOT NULL,
        branch TEXT NOT NULL,
        status TEXT NOT NULL,
        summary TEXT,
        commit_sha TEXT,
        error TEXT,
        created_at TEXT NOT NULL,
        processed_at TEXT
    );
    CREATE INDEX IF NOT EXISTS idx_review_queue_status ON review_queue(status);

    CREATE TABLE IF NOT EXISTS convoys (
        id TEXT PRIMARY KEY,
        title TEXT NOT NULL,
        status TEXT NOT NULL,
        total_beads INTEGER NOT NULL,
        closed_beads INTEGER NOT NULL DEFAULT 0,
        created_by TEXT,
        created_at TEXT NOT NULL,
        landed_at TEXT
    );

    CREATE TABLE IF NOT EXISTS convoy_beads (
        convoy_id TEXT NOT NULL,
        bead_id TEXT NOT NULL,
        rig_id TEXT,
        status TEXT NOT NULL,
        PRIMARY KEY (convoy_id, bead_id),
        FOREIGN KEY(convoy_id) REFERENCES convoys(id) ON DELETE CASCADE
    );
    CREATE INDEX IF NOT EXISTS idx_convoy_beads_bead ON convoy_beads(bead_id);

    CREATE TABLE IF NOT EXISTS escalations (
        id TEXT PRIMARY KEY,
        source_rig_id TEXT NOT NULL,
        source_agent_id TEXT,
        severity TEXT NOT NULL,
        category TEXT NOT NULL,
        message TEXT NOT NULL,
        acknowledged INTEGER NOT NULL DEFAULT 0,
        re_escalation_count INTEGER NOT NULL DEFAULT 0,
        created_at TEXT NOT NULL,
        acknowledged_at TEXT
    );
";

/// Well-known keys in the `kv` table.
pub mod keys {
    pub const TOWN_ID: &str = "town.id";
    pub const OWNER_USER_ID: &str = "town.owner_user_id";
    pub const TOWN_CONFIG: &str = "town.config";
    pub const NEXT_WAKE_AT: &str = "alarm.next_wake_at";
}

pub struct TownStore {
    conn: Connection,
}

impl TownStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        let mut store = Self { conn };
        store.bootstrap()?;
        Ok(store)
    }

    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let mut store = Self { conn };
        store.bootstrap()?;
        Ok(store)
    }

    pub fn schema_version(&self) -> Result<u32> {
        let version: Option<u32> = self
            .conn
            .query_row("SELECT MAX(version) FROM schema_migrations", [], |row| {
                row.get(0)
            })
            .optional()?
            .flatten();
        Ok(version.unwrap_or(0))
    }

    fn bootstrap(&mut self) -> Result<()> {
        self.conn.execute_batch(
            "
            PRAGMA foreign_keys = ON;
            CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL
            );
            ",
        )?;

        if self.schema_version()? < SCHEMA_VERSION {
            let tx = self.conn.transaction()?;
            tx.execute_batch(SCHEMA_V1)?;
            tx.execute(
                "INSERT INTO schema_migrations (version, applied_at) VALUES (?1, ?2)",
                params![SCHEMA_VERSION, Utc::now()],
            )?;
            tx.commit()?;
        }
        Ok(())
    }

    pub fn get_kv(&self, key: &str) -> Result<Option<String>> {
        Ok(self
            .conn
            .query_row("SELECT value FROM kv WHERE key = ?1", params![key], |row| {
                row.get(0)
            })
            .optional()?)
    }

    pub fn set_kv(&self, key: &str, value: &str) -> Result<()> {
        self.conn.execute(
            "INSERT INTO kv (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }

    pub fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        self.get_kv(key)?
            .map(|raw| serde_json::from_str(&raw))
            .transpose()
            .map_err(Into::into)
    }

    pub fn set_json<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        self.set_kv(key, &serde_json::to_string(value)?)
    }

    pub fn next_wake_at(&self) -> Result<Option<DateTime<Utc>>> {
        Ok(self
            .get_kv(keys::NEXT_WAKE_AT)?
            .and_then(|raw| DateTime::parse_from_rfc3339(&raw).ok())
            .map(|t| t.with_timezone(&Utc)))
    }

    pub fn set_next_wake_at(&self, at: DateTime<Utc>) -> Result<()> {
        self.set_kv(keys::NEXT_WAKE_AT, &at.to_rfc3339())
    }

    pub fn town_config(&self) -> Result<TownConfig> {
        Ok(self.get_json(keys::TOWN_CONFIG)?.unwrap_or_default())
    }

    pub fn set_town_config(&self, config: &TownConfig) -> Result<()> {
        self.set_json(keys::TOWN_CONFIG, config)
    }

    /// Snapshot of everything an agent needs on wake-up.
    ///
    /// Mail handed out here is marked delivered in the same transaction.
    pub fn prime(
        &mut self,
        agent_id: &str,
        open_limit: usize,
        now: DateTime<Utc>,
    ) -> Result<PrimeContext> {
        let tx = self.conn.transaction()?;
        let agent = agents::require_agent_in(&tx, agent_id)?;
        let hooked_bead = match agent.current_hook_bead_id.as_deref() {
            Some(bead_id) => beads::get_bead_in(&tx, bead_id)?,
            None => None,
        };
        let mail = mail::take_mail_in(&tx, agent_id, now)?;
        tx.commit()?;

        let open_beads = self.open_beads_for_rig(agent.rig_id.as_deref(), open_limit)?;
        let failed_reviews = self.failed_reviews_for_agent(agent_id)?;
        Ok(PrimeContext {
            agent,
            hooked_bead,
            mail,
            open_beads,
            failed_reviews,
        })
    }
}

/// Decode a JSON text column, surfacing bad JSON as a conversion failure.
fn json_column<T: DeserializeOwned>(idx: usize, raw: &str) -> rusqlite::Result<T> {
    serde_json::from_str(raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bootstrap_is_idempotent_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("town.db");
        {
            let store = TownStore::open(&path).unwrap();
            store.set_kv(keys::TOWN_ID, "t-1").unwrap();
        }
        let store = TownStore::open(&path).unwrap();
        assert_eq!(store.schema_version().unwrap(), SCHEMA_VERSION);
        assert_eq!(store.get_kv(keys::TOWN_ID).unwrap().as_deref(), Some("t-1"));
    }

    #[test]
    fn kv_overwrites() {
        let store = TownStore::in_memory().unwrap();
        assert_eq!(store.town_config().unwrap(), TownConfig::default());
        store.set_kv("k", "a").unwrap();
        store.set_kv("k", "b").unwrap();
        assert_eq!(store.get_kv("k").unwrap().as_deref(), Some("b"));
        assert_eq!(store.get_kv("missing").unwrap(), None);
    }

    #[test]
    fn next_wake_roundtrip() {
        let store = TownStore::in_memory().unwrap();
        assert_eq!(store.next_wake_at().unwrap(), None);
        let at = DateTime::parse_from_rfc3339("2026-03-01T12:00:05Z")
            .unwrap()
            .with_timezone(&Utc);
        store.set_next_wake_at(at).unwrap();
        assert_eq!(store.next_wake_at().unwrap(), Some(at));
    }
}
