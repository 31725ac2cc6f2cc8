use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};

use super::beads::{EventRecord, record_event_in, require_bead_in};
use super::{TownStore, new_id};
use crate::error::{Result, TownError};
use crate::types::{ReviewEntry, ReviewOutcome, ReviewStatus};

const REVIEW_COLUMNS: &str = "id, agent_id, bead_id, branch, status, summary, commit_sha, error, \
     created_at, processed_at";

fn review_from_row(row: &Row<'_>) -> rusqlite::Result<ReviewEntry> {
    Ok(ReviewEntry {
        id: row.get(0)?,
        agent_id: row.get(1)?,
        bead_id: row.get(2)?,
        branch: row.get(3)?,
        status: row.get(4)?,
        summary: row.get(5)?,
        commit_sha: row.get(6)?,
        error: row.get(7)?,
        created_at: row.get(8)?,
        processed_at: row.get(9)?,
    })
}

fn get_review_in(conn: &Connection, id: &str) -> rusqlite::Result<Option<ReviewEntry>> {
    conn.query_row(
        &format!("SELECT {REVIEW_COLUMNS} FROM review_queue WHERE id = ?1"),
        params![id],
        review_from_row,
    )
    .optional()
}

impl TownStore {
    pub fn submit_review(
        &self,
        agent_id: &str,
        bead_id: &str,
        branch: &str,
        summary: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<ReviewEntry> {
        let bead = require_bead_in(&self.conn, bead_id)?;
        if bead.status.is_terminal() {
            return Err(TownError::Conflict(format!(
                "bead {bead_id} is {} and cannot be reviewed",
                bead.status
            )));
        }
        let id = new_id();
        self.conn.execute(
            "INSERT INTO review_queue
                (id, agent_id, bead_id, branch, status, summary, commit_sha, error,
                 created_at, processed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, NULL, NULL, ?7, NULL)",
            params![id, agent_id, bead_id, branch, ReviewStatus::Pending, summary, now],
        )?;
        record_event_in(
            &self.conn,
            bead_id,
            &EventRecord {
                agent_id: Some(agent_id),
                event_type: "review_submitted",
                new_value: Some(branch),
                ..EventRecord::default()
            },
            now,
        )?;
        get_review_in(&self.conn, &id)?.ok_or_else(|| TownError::not_found("review", id))
    }

    pub fn get_review(&self, id: &str) -> Result<Option<ReviewEntry>> {
        Ok(get_review_in(&self.conn, id)?)
    }

    pub fn list_reviews(&self, status: Option<ReviewStatus>) -> Result<Vec<ReviewEntry>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {REVIEW_COLUMNS} FROM review_queue
             WHERE ?1 IS NULL OR status = ?1
             ORDER BY created_at, id"
        ))?;
        let entries = stmt
            .query_map(params![status], review_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(entries)
    }

    pub fn oldest_pending_review(&self) -> Result<Option<ReviewEntry>> {
        Ok(self
            .conn
            .query_row(
                &format!(
                    "SELECT {REVIEW_COLUMNS} FROM review_queue
                     WHERE status = 'pending' ORDER BY created_at, id LIMIT 1"
                ),
                [],
                review_from_row,
            )
            .optional()?)
    }

    pub fn failed_reviews_for_agent(&self, agent_id: &str) -> Result<Vec<ReviewEntry>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {REVIEW_COLUMNS} FROM review_queue
             WHERE agent_id = ?1 AND status = 'failed'
             ORDER BY created_at, id"
        ))?;
        let entries = stmt
            .query_map(params![agent_id], review_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(entries)
    }

    /// The running entry whose bead a given refinery holds.
    pub fn running_review_for_bead(&self, bead_id: &str) -> Result<Option<ReviewEntry>> {
        Ok(self
            .conn
            .query_row(
                &format!(
                    "SELECT {REVIEW_COLUMNS} FROM review_queue
                     WHERE bead_id = ?1 AND status = 'running'
                     ORDER BY created_at LIMIT 1"
                ),
                params![bead_id],
                review_from_row,
            )
            .optional()?)
    }

    pub fn has_open_reviews(&self) -> Result<bool> {
        Ok(self.conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM review_queue WHERE status IN ('pending', 'running'))",
            [],
            |row| row.get(0),
        )?)
    }

    pub fn mark_review_running(&self, id: &str) -> Result<()> {
        let changed = self.conn.execute(
            "UPDATE review_queue SET status = ?2 WHERE id = ?1 AND status = 'pending'",
            params![id, ReviewStatus::Running],
        )?;
        if changed == 0 {
            return Err(TownError::Conflict(format!("review {id} is not pending")));
        }
        Ok(())
    }

    /// Running entries whose bead no refinery holds go back to pending.
    pub fn reset_orphaned_reviews(&self) -> Result<usize> {
        Ok(self.conn.execute(
            "UPDATE review_queue SET status = 'pending'
             WHERE status = 'running'
               AND NOT EXISTS (
                   SELECT 1 FROM agents a
                   WHERE a.role = 'refinery' AND a.current_hook_bead_id = review_queue.bead_id)",
            [],
        )?)
    }

    /// Records a terminal outcome. Returns `None` if the entry was already terminal.
    pub fn finish_review(
        &self,
        id: &str,
        outcome: &ReviewOutcome,
        summary: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Option<ReviewEntry>> {
        let entry = get_review_in(&self.conn, id)?.ok_or_else(|| TownError::not_found("review", id))?;
        if entry.status.is_terminal() {
            return Ok(None);
        }
        let (commit_sha, error) = match outcome {
            ReviewOutcome::Merged { commit_sha } => (commit_sha.as_deref(), None),
            ReviewOutcome::Failed { error } => (None, Some(error.as_str())),
        };
        self.conn.execute(
            "UPDATE review_queue
             SET status = ?2, commit_sha = ?3, error = ?4,
                 summary = COALESCE(?5, summary), processed_at = ?6
             WHERE id = ?1",
            params![id, outcome.status(), commit_sha, error, summary, now],
        )?;
        record_event_in(
            &self.conn,
            &entry.bead_id,
            &EventRecord {
                agent_id: Some(entry.agent_id.as_str()),
                event_type: "review_completed",
                old_value: Some(entry.status.as_str()),
                new_value: Some(outcome.status().as_str()),
                metadata: Some(serde_json::json!({
                    "review_id": id,
                    "commit_sha": commit_sha,
                    "error": error,
                })),
            },
            now,
        )?;
        Ok(get_review_in(&self.conn, id)?)
    }
}
