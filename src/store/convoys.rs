use chrono::{DateTime, Utc};
use rusqlite::{Connection, ErrorCode, OptionalExtension, Row, params};

use super::beads::require_bead_in;
use super::{TownStore, new_id};
use crate::error::{Result, TownError};
use crate::types::{Convoy, ConvoyBead, ConvoyBeadStatus, ConvoyStatus};

const CONVOY_COLUMNS: &str =
    "id, title, status, total_beads, closed_beads, created_by, created_at, landed_at";

fn convoy_from_row(row: &Row<'_>) -> rusqlite::Result<Convoy> {
    Ok(Convoy {
        id: row.get(0)?,
        title: row.get(1)?,
        status: row.get(2)?,
        total_beads: row.get(3)?,
        closed_beads: row.get(4)?,
        created_by: row.get(5)?,
        created_at: row.get(6)?,
        landed_at: row.get(7)?,
    })
}

fn get_convoy_in(conn: &Connection, id: &str) -> rusqlite::Result<Option<Convoy>> {
    conn.query_row(
        &format!("SELECT {CONVOY_COLUMNS} FROM convoys WHERE id = ?1"),
        params![id],
        convoy_from_row,
    )
    .optional()
}

fn require_convoy_in(conn: &Connection, id: &str) -> Result<Convoy> {
    get_convoy_in(conn, id)?.ok_or_else(|| TownError::not_found("convoy", id))
}

fn insert_member(conn: &Connection, convoy_id: &str, bead_id: &str) -> Result<()> {
    let bead = require_bead_in(conn, bead_id)?;
    let status = if bead.status.is_terminal() {
        ConvoyBeadStatus::Closed
    } else {
        ConvoyBeadStatus::Open
    };
    match conn.execute(
        "INSERT INTO convoy_beads (convoy_id, bead_id, rig_id, status) VALUES (?1, ?2, ?3, ?4)",
        params![convoy_id, bead_id, bead.rig_id, status],
    ) {
        Ok(_) => Ok(()),
        Err(rusqlite::Error::SqliteFailure(e, _)) if e.code == ErrorCode::ConstraintViolation => {
            Err(TownError::Conflict(format!(
                "bead {bead_id} is already in convoy {convoy_id}"
            )))
        }
        Err(e) => Err(e.into()),
    }
}

/// Recounts members and lands the convoy once every member is closed.
fn recompute_in(conn: &Connection, convoy_id: &str, now: DateTime<Utc>) -> Result<Convoy> {
    let (total, closed): (u32, u32) = conn.query_row(
        "SELECT COUNT(*), COALESCE(SUM(status = 'closed'), 0)
         FROM convoy_beads WHERE convoy_id = ?1",
        params![convoy_id],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?;
    conn.execute(
        "UPDATE convoys SET total_beads = ?2, closed_beads = ?3 WHERE id = ?1",
        params![convoy_id, total, closed],
    )?;
    conn.execute(
        "UPDATE convoys SET status = ?2, landed_at = ?3
         WHERE id = ?1 AND status = 'active' AND closed_beads >= total_beads",
        params![convoy_id, ConvoyStatus::Landed, now],
    )?;
    require_convoy_in(conn, convoy_id)
}

impl TownStore {
    /// `bead_ids` must be non-empty and free of duplicates.
    pub fn create_convoy(
        &mut self,
        title: &str,
        bead_ids: &[String],
        created_by: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Convoy> {
        let id = new_id();
        let tx = self.conn.transaction()?;
        tx.execute(
            "INSERT INTO convoys
                (id, title, status, total_beads, closed_beads, created_by, created_at, landed_at)
             VALUES (?1, ?2, ?3, ?4, 0, ?5, ?6, NULL)",
            params![
                id,
                title,
                ConvoyStatus::Active,
                u32::try_from(bead_ids.len()).unwrap_or(u32::MAX),
                created_by,
                now
            ],
        )?;
        for bead_id in bead_ids {
            insert_member(&tx, &id, bead_id)?;
        }
        let convoy = recompute_in(&tx, &id, now)?;
        tx.commit()?;
        Ok(convoy)
    }

    pub fn add_bead_to_convoy(
        &mut self,
        convoy_id: &str,
        bead_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Convoy> {
        let tx = self.conn.transaction()?;
        let convoy = require_convoy_in(&tx, convoy_id)?;
        if convoy.status == ConvoyStatus::Landed {
            return Err(TownError::Conflict(format!(
                "convoy {convoy_id} has already landed"
            )));
        }
        insert_member(&tx, convoy_id, bead_id)?;
        let convoy = recompute_in(&tx, convoy_id, now)?;
        tx.commit()?;
        Ok(convoy)
    }

    /// Marks one member closed. Safe to call repeatedly.
    pub fn close_convoy_bead(
        &mut self,
        convoy_id: &str,
        bead_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Convoy> {
        let tx = self.conn.transaction()?;
        require_convoy_in(&tx, convoy_id)?;
        tx.execute(
            "UPDATE convoy_beads SET status = ?3 WHERE convoy_id = ?1 AND bead_id = ?2",
            params![convoy_id, bead_id, ConvoyBeadStatus::Closed],
        )?;
        let convoy = recompute_in(&tx, convoy_id, now)?;
        tx.commit()?;
        Ok(convoy)
    }

    pub fn get_convoy(&self, id: &str) -> Result<Option<Convoy>> {
        Ok(get_convoy_in(&self.conn, id)?)
    }

    pub fn list_convoys(&self, status: Option<ConvoyStatus>) -> Result<Vec<Convoy>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {CONVOY_COLUMNS} FROM convoys
             WHERE ?1 IS NULL OR status = ?1
             ORDER BY created_at, id"
        ))?;
        let convoys = stmt
            .query_map(params![status], convoy_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(convoys)
    }

    pub fn convoy_beads(&self, convoy_id: &str) -> Result<Vec<ConvoyBead>> {
        let mut stmt = self.conn.prepare(
            "SELECT convoy_id, bead_id, rig_id, status FROM convoy_beads
             WHERE convoy_id = ?1 ORDER BY bead_id",
        )?;
        let members = stmt
            .query_map(params![convoy_id], |row| {
                Ok(ConvoyBead {
                    convoy_id: row.get(0)?,
                    bead_id: row.get(1)?,
                    rig_id: row.get(2)?,
                    status: row.get(3)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(members)
    }

    /// Ids of convoys that contain `bead_id`.
    pub fn convoys_for_bead(&self, bead_id: &str) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT convoy_id FROM convoy_beads WHERE bead_id = ?1 ORDER BY convoy_id")?;
        let ids = stmt
            .query_map(params![bead_id], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BeadStatus, NewBead};

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_770_000_000 + secs, 0).unwrap()
    }

    fn beads(store: &mut TownStore, n: usize) -> Vec<String> {
        (0..n)
            .map(|i| {
                store
                    .create_bead(&NewBead::task(format!("b{i}")), at(0))
                    .unwrap()
                    .id
            })
            .collect()
    }

    #[test]
    fn lands_exactly_once_when_all_closed() {
        let mut store = TownStore::in_memory().unwrap();
        let ids = beads(&mut store, 2);
        let convoy = store.create_convoy("release", &ids, None, at(1)).unwrap();
        assert_eq!(convoy.total_beads, 2);
        assert_eq!(convoy.status, ConvoyStatus::Active);

        let after_one = store.close_convoy_bead(&convoy.id, &ids[0], at(2)).unwrap();
        assert_eq!(after_one.closed_beads, 1);
        assert_eq!(after_one.landed_at, None);

        let landed = store.close_convoy_bead(&convoy.id, &ids[1], at(3)).unwrap();
        assert_eq!(landed.status, ConvoyStatus::Landed);
        assert_eq!(landed.landed_at, Some(at(3)));

        // repeated close keeps the original landing time
        let again = store.close_convoy_bead(&convoy.id, &ids[1], at(9)).unwrap();
        assert_eq!(again.closed_beads, 2);
        assert_eq!(again.landed_at, Some(at(3)));
    }

    #[test]
    fn duplicate_member_conflicts() {
        let mut store = TownStore::in_memory().unwrap();
        let ids = beads(&mut store, 2);
        let convoy = store.create_convoy("c", &ids[..1], None, at(1)).unwrap();
        let err = store.add_bead_to_convoy(&convoy.id, &ids[0], at(2)).unwrap_err();
        assert!(matches!(err, TownError::Conflict(_)));

        let grown = store.add_bead_to_convoy(&convoy.id, &ids[1], at(2)).unwrap();
        assert_eq!(grown.total_beads, 2);
        assert_eq!(store.convoys_for_bead(&ids[1]).unwrap(), vec![convoy.id]);
    }

    #[test]
    fn landed_convoy_rejects_members() {
        let mut store = TownStore::in_memory().unwrap();
        let ids = beads(&mut store, 2);
        let convoy = store.create_convoy("c", &ids[..1], None, at(1)).unwrap();
        store.close_convoy_bead(&convoy.id, &ids[0], at(2)).unwrap();
        let err = store.add_bead_to_convoy(&convoy.id, &ids[1], at(3)).unwrap_err();
        assert!(matches!(err, TownError::Conflict(_)));
    }

    #[test]
    fn already_closed_members_count() {
        let mut store = TownStore::in_memory().unwrap();
        let ids = beads(&mut store, 2);
        store
            .update_bead_status(&ids[0], BeadStatus::Closed, None, at(1))
            .unwrap();
        let convoy = store.create_convoy("c", &ids, None, at(2)).unwrap();
        assert_eq!(convoy.closed_beads, 1);
    }

    #[test]
    fn active_convoy_blocks_bead_delete() {
        let mut store = TownStore::in_memory().unwrap();
        let ids = beads(&mut store, 1);
        store.create_convoy("c", &ids, None, at(1)).unwrap();
        assert!(matches!(
            store.delete_bead(&ids[0]).unwrap_err(),
            TownError::Conflict(_)
        ));
    }
}
