use chrono::{DateTime, Utc};
use rusqlite::{ErrorCode, OptionalExtension, Row, params};

use super::{TownStore, json_column, new_id};
use crate::config::RigConfig;
use crate::error::{Result, TownError};
use crate::types::Rig;

fn rig_from_row(row: &Row<'_>) -> rusqlite::Result<Rig> {
    Ok(Rig {
        id: row.get(0)?,
        name: row.get(1)?,
        git_url: row.get(2)?,
        default_branch: row.get(3)?,
        created_at: row.get(4)?,
    })
}

impl TownStore {
    pub fn insert_rig(
        &self,
        name: &str,
        git_url: &str,
        default_branch: &str,
        now: DateTime<Utc>,
    ) -> Result<Rig> {
        if name.trim().is_empty() || git_url.trim().is_empty() {
            return Err(TownError::Invalid("rig name and git url are required".into()));
        }
        let rig = Rig {
            id: new_id(),
            name: name.to_string(),
            git_url: git_url.to_string(),
            default_branch: default_branch.to_string(),
            created_at: now,
        };
        match self.conn.execute(
            "INSERT INTO rigs (id, name, git_url, default_branch, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![rig.id, rig.name, rig.git_url, rig.default_branch, rig.created_at],
        ) {
            Ok(_) => Ok(rig),
            Err(rusqlite::Error::SqliteFailure(e, _)) if e.code == ErrorCode::ConstraintViolation => {
                Err(TownError::Conflict(format!("rig {name} already exists")))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn get_rig(&self, id: &str) -> Result<Option<Rig>> {
        Ok(self
            .conn
            .query_row(
                "SELECT id, name, git_url, default_branch, created_at FROM rigs WHERE id = ?1",
                params![id],
                rig_from_row,
            )
            .optional()?)
    }

    pub fn get_rig_by_name(&self, name: &str) -> Result<Option<Rig>> {
        Ok(self
            .conn
            .query_row(
                "SELECT id, name, git_url, default_branch, created_at FROM rigs WHERE name = ?1",
                params![name],
                rig_from_row,
            )
            .optional()?)
    }

    pub fn list_rigs(&self) -> Result<Vec<Rig>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, name, git_url, default_branch, created_at FROM rigs ORDER BY name",
        )?;
        let rigs = stmt
            .query_map([], rig_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rigs)
    }

    /// Removes the rig and its config. Beads keep their dangling `rig_id`.
    pub fn delete_rig(&self, id: &str) -> Result<()> {
        let changed = self.conn.execute("DELETE FROM rigs WHERE id = ?1", params![id])?;
        if changed == 0 {
            return Err(TownError::not_found("rig", id));
        }
        Ok(())
    }

    pub fn set_rig_config(&self, rig_id: &str, config: &RigConfig) -> Result<()> {
        if self.get_rig(rig_id)?.is_none() {
            return Err(TownError::not_found("rig", rig_id));
        }
        self.conn.execute(
            "INSERT INTO rig_configs (rig_id, config) VALUES (?1, ?2)
             ON CONFLICT(rig_id) DO UPDATE SET config = excluded.config",
            params![rig_id, serde_json::to_string(config)?],
        )?;
        Ok(())
    }

    pub fn rig_config(&self, rig_id: &str) -> Result<Option<RigConfig>> {
        let raw: Option<String> = self
            .conn
            .query_row(
                "SELECT config FROM rig_configs WHERE rig_id = ?1",
                params![rig_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(raw.map(|raw| json_column(0, &raw)).transpose()?)
    }
}
