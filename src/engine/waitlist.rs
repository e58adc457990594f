use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::notify::{BookingEvent, PromotionCandidate};
use crate::observability;
use crate::request::JoinWaitlistRequest;

use super::conflict::{local_now, now_ms, require_admin};
use super::{Engine, EngineError};

/// Entries on `venue_id` whose slot overlaps `freed`, first come first served.
/// `entries` must be in insertion order so equal timestamps keep that order.
pub fn promotion_candidates(entries: &[WaitlistEntry], venue_id: Ulid, freed: &Slot) -> Vec<PromotionCandidate> {
    let mut out: Vec<PromotionCandidate> = entries
        .iter()
        .filter(|e| e.venue_id == venue_id && e.slot().overlaps(freed))
        .map(|e| PromotionCandidate {
            exact: e.start_time == freed.start && e.end_time == freed.end,
            entry: e.clone(),
        })
        .collect();
    out.sort_by_key(|c| c.entry.created_at);
    out
}

impl Engine {
    /// Register interest in a slot. No uniqueness check: joining twice
    /// creates two entries.
    pub async fn join_waitlist(&self, req: JoinWaitlistRequest, actor: &Actor) -> Result<WaitlistEntry, EngineError> {
        req.validate()?;
        let user_id = match req.user_id {
            Some(u) if u != actor.user_id && !actor.is_admin() => {
                return Err(EngineError::Forbidden("customers may only join the waitlist for themselves"));
            }
            Some(u) => u,
            None => actor.user_id,
        };
        if self.store.get_venue(&req.venue_id).is_none() {
            return Err(EngineError::NotFound(req.venue_id));
        }

        let mut waitlist = self.store.waitlist.write().await;
        // Past entries linger until the next compaction and do not count.
        let today = local_now().date();
        if waitlist.iter().filter(|e| e.date >= today).count() >= MAX_WAITLIST_ENTRIES {
            return Err(EngineError::LimitExceeded("waitlist is full"));
        }
        let entry = WaitlistEntry {
            id: Ulid::new(),
            user_id,
            venue_id: req.venue_id,
            date: req.date,
            start_time: req.start_time,
            end_time: req.end_time,
            created_at: now_ms(),
        };
        let event = Event::WaitlistJoined { entry: entry.clone() };
        self.wal_append(&event).await?;
        self.store.apply_global(&mut waitlist, &event);
        info!(entry_id = %entry.id, venue_id = %entry.venue_id, "waitlist joined for {}", entry.date);
        Ok(entry)
    }

    /// Remove an entry. Removing one that is already gone is not an error
    /// and returns `None`.
    pub async fn leave_waitlist(&self, id: Ulid, actor: &Actor) -> Result<Option<WaitlistEntry>, EngineError> {
        let mut waitlist = self.store.waitlist.write().await;
        let Some(entry) = waitlist.iter().find(|e| e.id == id).cloned() else {
            debug!(entry_id = %id, "waitlist entry already gone");
            return Ok(None);
        };
        if !actor.may_act_for(Some(entry.user_id)) {
            return Err(EngineError::Forbidden("waitlist entry belongs to another user"));
        }
        let event = Event::WaitlistLeft { id };
        self.wal_append(&event).await?;
        self.store.apply_global(&mut waitlist, &event);
        info!(entry_id = %id, "waitlist left");
        Ok(Some(entry))
    }

    /// Entries overlapping a slot, oldest first. Admin only.
    pub async fn waitlist_for_slot(
        &self,
        venue_id: Ulid,
        slot: &Slot,
        actor: &Actor,
    ) -> Result<Vec<PromotionCandidate>, EngineError> {
        require_admin(actor)?;
        if self.store.get_venue(&venue_id).is_none() {
            return Err(EngineError::NotFound(venue_id));
        }
        let waitlist = self.store.waitlist.read().await;
        Ok(promotion_candidates(&waitlist, venue_id, slot))
    }

    /// Drop the booking owner's entries for the slot they now hold. Called
    /// with the booking's venue still locked. The booking is already durable,
    /// so a failed removal is only logged.
    pub(super) async fn consume_waitlist(&self, booking: &Booking) {
        let Some(user_id) = booking.user_id else { return };
        if !booking.status.occupies_slot() {
            return;
        }
        let slot = booking.slot();
        let mut waitlist = self.store.waitlist.write().await;
        let fulfilled: Vec<Ulid> = waitlist
            .iter()
            .filter(|e| e.user_id == user_id && e.venue_id == booking.venue_id && e.slot().overlaps(&slot))
            .map(|e| e.id)
            .collect();
        for id in fulfilled {
            let event = Event::WaitlistLeft { id };
            if let Err(e) = self.wal_append(&event).await {
                warn!(entry_id = %id, booking_id = %booking.id, "waitlist entry kept: {e}");
                return;
            }
            self.store.apply_global(&mut waitlist, &event);
            debug!(entry_id = %id, booking_id = %booking.id, "waitlist entry fulfilled");
        }
    }

    /// Tell clients who was waiting for a slot that just opened up. Nobody is
    /// booked automatically; payment still needs a human step.
    pub(super) async fn surface_candidates(&self, freed: &Booking) {
        let candidates = {
            let waitlist = self.store.waitlist.read().await;
            promotion_candidates(&waitlist, freed.venue_id, &freed.slot())
        };
        if candidates.is_empty() {
            return;
        }
        metrics::counter!(observability::WAITLIST_MATCHES_TOTAL).increment(candidates.len() as u64);
        info!(
            booking_id = %freed.id,
            "{} waitlist candidate(s) for freed slot",
            candidates.len()
        );
        self.notifier.publish(BookingEvent::Waitlist { booking_id: freed.id, candidates });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, NaiveTime};

    fn t(h: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, 0, 0).unwrap()
    }

    fn entry(venue_id: Ulid, date: NaiveDate, start: u32, end: u32, created_at: Ms) -> WaitlistEntry {
        WaitlistEntry {
            id: Ulid::new(),
            user_id: Ulid::new(),
            venue_id,
            date,
            start_time: t(start),
            end_time: t(end),
            created_at,
        }
    }

    #[test]
    fn exact_match_first_when_older() {
        let venue = Ulid::new();
        let day = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        let exact = entry(venue, day, 10, 11, 100);
        let partial = entry(venue, day, 10, 12, 200);
        let entries = vec![partial.clone(), exact.clone()];

        let freed = Slot::new(day, t(10), t(11));
        let found = promotion_candidates(&entries, venue, &freed);
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].entry.id, exact.id);
        assert!(found[0].exact);
        assert!(!found[1].exact);
    }

    #[test]
    fn other_venues_dates_and_adjacent_slots_are_ignored() {
        let venue = Ulid::new();
        let day = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        let entries = vec![
            entry(Ulid::new(), day, 10, 11, 1),
            entry(venue, day.succ_opt().unwrap(), 10, 11, 2),
            entry(venue, day, 11, 12, 3),
        ];
        let freed = Slot::new(day, t(10), t(11));
        assert!(promotion_candidates(&entries, venue, &freed).is_empty());
    }

    #[test]
    fn equal_timestamps_keep_insertion_order() {
        let venue = Ulid::new();
        let day = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        let first = entry(venue, day, 9, 12, 5);
        let second = entry(venue, day, 9, 12, 5);
        let found = promotion_candidates(&[first.clone(), second.clone()], venue, &Slot::new(day, t(10), t(11)));
        assert_eq!(found[0].entry.id, first.id);
        assert_eq!(found[1].entry.id, second.id);
    }
}
