use tracing::info;

use super::Town;
use crate::error::{Result, TownError};
use crate::types::{Convoy, ConvoyBead, ConvoyStatus};

impl Town {
    /// Groups beads under one convoy. Repeated ids count once.
    pub fn create_convoy(
        &mut self,
        title: &str,
        bead_ids: &[String],
        created_by: Option<&str>,
    ) -> Result<Convoy> {
        if title.trim().is_empty() {
            return Err(TownError::Invalid("convoy title must not be empty".into()));
        }
        let mut unique: Vec<String> = Vec::with_capacity(bead_ids.len());
        for id in bead_ids {
            if !unique.contains(id) {
                unique.push(id.clone());
            }
        }
        if unique.is_empty() {
            return Err(TownError::Invalid("a convoy needs at least one bead".into()));
        }
        for id in &unique {
            if self.store.get_bead(id)?.is_none() {
                return Err(TownError::not_found("bead", id));
            }
        }
        let now = self.now();
        let convoy = self.store.create_convoy(title, &unique, created_by, now)?;
        info!(town_id = %self.id(), convoy_id = %convoy.id, beads = convoy.total_beads, "convoy created");
        Ok(convoy)
    }

    pub fn add_bead_to_convoy(&mut self, convoy_id: &str, bead_id: &str) -> Result<Convoy> {
        if self.store.get_bead(bead_id)?.is_none() {
            return Err(TownError::not_found("bead", bead_id));
        }
        let now = self.now();
        self.store.add_bead_to_convoy(convoy_id, bead_id, now)
    }

    /// Marks a member closed and lands the convoy when it was the last one.
    /// Repeating the call changes nothing.
    pub fn on_bead_closed(&mut self, convoy_id: &str, bead_id: &str) -> Result<Convoy> {
        let now = self.now();
        let before = self
            .store
            .get_convoy(convoy_id)?
            .ok_or_else(|| TownError::not_found("convoy", convoy_id))?;
        let convoy = self.store.close_convoy_bead(convoy_id, bead_id, now)?;
        if before.status == ConvoyStatus::Active && convoy.status == ConvoyStatus::Landed {
            info!(town_id = %self.id(), convoy_id, title = %convoy.title, "convoy landed");
        }
        Ok(convoy)
    }

    pub fn get_convoy(&self, id: &str) -> Result<Option<Convoy>> {
        self.store.get_convoy(id)
    }

    pub fn list_convoys(&self, status: Option<ConvoyStatus>) -> Result<Vec<Convoy>> {
        self.store.list_convoys(status)
    }

    pub fn convoy_beads(&self, convoy_id: &str) -> Result<Vec<ConvoyBead>> {
        self.store.convoy_beads(convoy_id)
    }

    pub(crate) fn propagate_close(&mut self, bead_id: &str) -> Result<()> {
        for convoy_id in self.store.convoys_for_bead(bead_id)? {
            self.on_bead_closed(&convoy_id, bead_id)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::error::TownError;
    use crate::town::test_support::harness;
    use crate::types::{BeadStatus, ConvoyBeadStatus, ConvoyStatus, NewBead};

    #[test]
    fn closing_every_bead_lands_once() {
        let mut h = harness();
        let a = h.town.create_bead(&NewBead::task("a")).unwrap();
        let b = h.town.create_bead(&NewBead::task("b")).unwrap();
        let convoy = h
            .town
            .create_convoy("release", &[a.id.clone(), b.id.clone(), a.id.clone()], None)
            .unwrap();
        assert_eq!(convoy.total_beads, 2);

        h.town.update_bead_status(&a.id, BeadStatus::Closed, None).unwrap();
        let mid = h.town.get_convoy(&convoy.id).unwrap().unwrap();
        assert_eq!(mid.closed_beads, 1);
        assert_eq!(mid.status, ConvoyStatus::Active);

        h.town.update_bead_status(&b.id, BeadStatus::Closed, None).unwrap();
        let landed = h.town.get_convoy(&convoy.id).unwrap().unwrap();
        assert_eq!(landed.status, ConvoyStatus::Landed);
        let landed_at = landed.landed_at;
        assert!(landed_at.is_some());

        h.clock.advance(chrono::Duration::minutes(5));
        let again = h.town.on_bead_closed(&convoy.id, &b.id).unwrap();
        assert_eq!(again.closed_beads, 2);
        assert_eq!(again.landed_at, landed_at);
        assert!(
            h.town
                .convoy_beads(&convoy.id)
                .unwrap()
                .iter()
                .all(|m| m.status == ConvoyBeadStatus::Closed)
        );
    }

    #[test]
    fn rejects_empty_and_unknown_beads() {
        let mut h = harness();
        assert!(matches!(
            h.town.create_convoy("empty", &[], None),
            Err(TownError::Invalid(_))
        ));
        assert!(matches!(
            h.town.create_convoy("ghost", &["nope".to_string()], None),
            Err(TownError::NotFound { .. })
        ));
    }

    #[test]
    fn adding_to_landed_convoy_conflicts() {
        let mut h = harness();
        let a = h.town.create_bead(&NewBead::task("a")).unwrap();
        let b = h.town.create_bead(&NewBead::task("b")).unwrap();
        let convoy = h.town.create_convoy("one", &[a.id.clone()], None).unwrap();
        assert!(matches!(
            h.town.add_bead_to_convoy(&convoy.id, &a.id),
            Err(TownError::Conflict(_))
        ));
        h.town.update_bead_status(&a.id, BeadStatus::Closed, None).unwrap();
        assert!(matches!(
            h.town.add_bead_to_convoy(&convoy.id, &b.id),
            Err(TownError::Conflict(_))
        ));
    }
}
